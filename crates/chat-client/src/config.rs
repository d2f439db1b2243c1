//! Client configuration.

use std::collections::HashMap;
use std::time::Duration;

use chat_protocol::CloseTable;
use url::Url;

use crate::error::Result;

/// Reconnection policy: bounded attempts with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up for good.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between attempts.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            factor: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        self.base_delay.mul_f64(self.factor.powi(exp as i32))
    }
}

/// Configuration for [`ChatClient`](crate::ChatClient).
///
/// Endpoint paths default to the backend's chat API layout; everything is
/// overridable for tests and alternate deployments.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP(S) origin of the backend.
    pub base_url: Url,
    /// Path of the session-creation endpoint.
    pub session_path: String,
    /// Path prefix of the chat WebSocket endpoint.
    pub ws_path: String,
    /// Free-form initialization parameters forwarded verbatim with the
    /// session-creation request. Not interpreted by the client.
    pub init_args: HashMap<String, String>,
    /// Interval between application-level heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Reconnection policy for abnormal closures.
    pub retry: RetryPolicy,
    /// Backend-owned close-code mapping.
    pub close_table: CloseTable,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://127.0.0.1:8080").expect("static url"),
            session_path: "/ai-api/chat/session".to_string(),
            ws_path: "/ai-api/chat/ws".to_string(),
            init_args: HashMap::new(),
            heartbeat_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            close_table: CloseTable::default(),
        }
    }
}

impl ClientConfig {
    /// Session-creation endpoint URL.
    pub fn session_url(&self) -> Result<Url> {
        Ok(self.base_url.join(&self.session_path)?)
    }

    /// Chat channel URL for one (session, agent) pair.
    pub fn ws_url(&self, session_id: &str, agent_name: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("{}/{}", self.ws_path.trim_end_matches('/'), session_id))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        let _ = url.set_scheme(scheme);
        url.query_pairs_mut().append_pair("agent_name", agent_name);
        Ok(url)
    }
}
