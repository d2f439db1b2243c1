//! Outbound client frames.

use serde::Serialize;

/// A frame sent from the client to the backend.
///
/// Serializes to the same `{"type", "payload"}` envelope the backend uses
/// inbound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A user chat message.
    Message { message: String },
    /// Answer to a pending confirmation request.
    ConfirmationResponse { id: String, confirmed: bool },
    /// Application-level heartbeat.
    Ping,
}

impl ClientFrame {
    /// Encode for the wire. Infallible for these shapes.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"ping"}"#.to_string())
    }
}
