//! Wire protocol for the agent chat channel.
//!
//! The backend speaks newline-delimited JSON over a WebSocket, one
//! `{"type": ..., "payload": ...}` envelope per record. This crate owns
//! both directions of that wire:
//! - classification of inbound payloads into typed [`ServerEvent`]s,
//!   tolerant of batched records and malformed JSON,
//! - serialization of outbound [`ClientFrame`]s,
//! - the [`CloseTable`] that maps backend close codes to structured
//!   [`CloseReason`]s.

mod close;
mod event;
mod outbound;

pub use close::{CloseReason, CloseTable};
pub use event::{Classified, ServerEvent, ToolArguments, classify};
pub use outbound::ClientFrame;
