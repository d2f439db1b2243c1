//! Human-facing status projection.
//!
//! Pure derivation over connection state and busy/engagement flags; no
//! state of its own. The structured enum is the source of truth — display
//! text hangs off it, never the other way around.

use std::fmt;

use crate::connection::ConnectionState;

/// Why the client gave up on the connection for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Usage quota exhausted.
    QuotaExceeded,
    /// The backend no longer recognizes the session.
    InvalidSession,
    /// A required credential upload is missing.
    MissingCredentials,
    /// Bounded reconnection attempts were exhausted.
    MaxAttemptsReached,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::QuotaExceeded => write!(f, "usage limit reached"),
            FailureReason::InvalidSession => write!(f, "session expired"),
            FailureReason::MissingCredentials => write!(f, "required credentials missing"),
            FailureReason::MaxAttemptsReached => write!(f, "maximum retry attempts reached"),
        }
    }
}

/// Displayed client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Nothing sent yet; connection noise is suppressed.
    Idle,
    /// A turn is in flight.
    Busy,
    /// Connected and waiting for user input.
    Ready,
    /// Automatic reconnection in progress.
    Reconnecting { attempt: u32, max: u32 },
    /// Cleanly disconnected; sending reconnects.
    Disconnected,
    /// Terminal failure; the user must start a new session.
    Failed(FailureReason),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => write!(f, "Idle"),
            Status::Busy => write!(f, "Thinking..."),
            Status::Ready => write!(f, "Ready"),
            Status::Reconnecting { attempt, max } => {
                write!(f, "Reconnecting... ({attempt}/{max})")
            }
            Status::Disconnected => write!(f, "Disconnected"),
            Status::Failed(reason) => write!(f, "Connection failed - {reason}"),
        }
    }
}

/// Derive the displayed status. Before the first user message everything
/// short of a terminal failure maps to `Idle`.
pub fn project(
    conn: &ConnectionState,
    busy: bool,
    has_sent_first_message: bool,
    max_attempts: u32,
) -> Status {
    if let ConnectionState::Failed(reason) = conn {
        return Status::Failed(*reason);
    }
    if !has_sent_first_message {
        return Status::Idle;
    }
    match conn {
        ConnectionState::Reconnecting { attempt } => Status::Reconnecting {
            attempt: *attempt,
            max: max_attempts,
        },
        ConnectionState::Connecting => Status::Busy,
        ConnectionState::Connected => {
            if busy {
                Status::Busy
            } else {
                Status::Ready
            }
        }
        ConnectionState::Disconnected => Status::Disconnected,
        ConnectionState::Failed(_) => unreachable!("handled above"),
    }
}
