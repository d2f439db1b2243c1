//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// No agent has been selected yet
    #[error("No agent selected")]
    NoAgent,

    /// A connection attempt is already in flight
    #[error("Connection attempt already in flight")]
    ConnectInFlight,

    /// Not connected to the backend
    #[error("Not connected")]
    NotConnected,

    /// HTTP error during session bootstrap
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
