//! Session and connection lifecycle core for the agent chat backend.
//!
//! This crate owns the one genuinely stateful part of the chat client:
//! creating a backend session for an agent, supervising the WebSocket
//! connection bound to it, folding the streamed events into an ordered
//! conversation log, and recovering from transport failures without ever
//! letting a superseded connection's late callbacks touch live state.
//!
//! Rendering, upload forms and page chrome are external collaborators:
//! they read [`ClientSnapshot`]s and feed user text, confirmation
//! decisions and agent selections back in.
//!
//! # Example
//!
//! ```rust,no_run
//! use chat_client::{Agent, ChatClient, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = ChatClient::new(ClientConfig::default()).expect("valid config");
//!     let mut notices = client.subscribe();
//!
//!     client.select_agent(Agent::named("k8s-expert")).await;
//!     client.send("list pods").await.unwrap();
//!
//!     while notices.recv().await.is_ok() {
//!         let snapshot = client.snapshot().await;
//!         println!("{:?}: {} messages", snapshot.status, snapshot.messages.len());
//!     }
//! }
//! ```

mod config;
mod connection;
mod error;
mod reducer;
mod session;
mod status;
pub mod transport;

pub use config::{ClientConfig, RetryPolicy};
pub use connection::{ChatClient, ClientNotice, ClientSnapshot, ConnectionState, UPGRADE_NOTICE};
pub use error::{ClientError, Result};
pub use reducer::{Confirmation, Entry, MessageLog, ToolGroupState, ToolInvocation};
pub use session::{Agent, BootstrapError, Bootstrapper};
pub use status::{FailureReason, Status};
