//! Close-code classification.
//!
//! The numeric close codes are owned by the backend and treated as
//! configuration data here; the connection state machine only ever sees
//! the structured [`CloseReason`].

use std::collections::HashMap;

/// Why the transport closed, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Expected closure (client-initiated teardown or server going away).
    Normal,
    /// Usage quota exhausted. Terminal.
    QuotaExceeded,
    /// The session id is unknown or expired server-side. Terminal; the
    /// stored session id must be discarded.
    InvalidSession,
    /// A required credential upload is missing. Terminal.
    MissingCredentials,
    /// Anything else. Eligible for reconnection.
    Abnormal,
}

impl CloseReason {
    /// Terminal reasons must never trigger automatic reconnection.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CloseReason::QuotaExceeded | CloseReason::InvalidSession | CloseReason::MissingCredentials
        )
    }
}

/// Lookup table from backend close codes to reasons.
#[derive(Debug, Clone)]
pub struct CloseTable {
    codes: HashMap<u16, CloseReason>,
}

impl Default for CloseTable {
    fn default() -> Self {
        let mut codes = HashMap::new();
        // RFC 6455 normal closure / going away.
        codes.insert(1000, CloseReason::Normal);
        codes.insert(1001, CloseReason::Normal);
        // Backend private-range codes.
        codes.insert(4001, CloseReason::InvalidSession);
        codes.insert(4003, CloseReason::MissingCredentials);
        codes.insert(4029, CloseReason::QuotaExceeded);
        Self { codes }
    }
}

impl CloseTable {
    /// Classify a close code. Unmapped codes (including a missing close
    /// frame) are abnormal.
    pub fn reason(&self, code: Option<u16>) -> CloseReason {
        code.and_then(|c| self.codes.get(&c).copied())
            .unwrap_or(CloseReason::Abnormal)
    }

    /// Override or extend the mapping for one code.
    pub fn with_code(mut self, code: u16, reason: CloseReason) -> Self {
        self.codes.insert(code, reason);
        self
    }
}
