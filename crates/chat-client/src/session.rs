//! Session bootstrap.
//!
//! A session is a backend-issued conversation context bound to one agent.
//! It is created at most once per client lifetime, reused by every
//! (re)connection, and discarded only when the backend invalidates it or
//! the user explicitly starts over.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

/// An agent from the directory. Only `name` matters to the core: it is the
/// channel routing key and the session's binding key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub starting_prompts: Vec<String>,
}

impl Agent {
    /// Agent with just a name, for callers that don't carry directory
    /// metadata.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            starting_prompts: Vec::new(),
        }
    }
}

/// Why session creation failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BootstrapError {
    /// HTTP 429: usage quota exhausted. Terminal for this agent until the
    /// user starts a new session; never retried silently.
    #[error("usage quota exceeded")]
    Quota,
    /// Any other failure. The user retries by sending another message.
    #[error("session creation failed: {0}")]
    Failed(String),
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    agent_name: &'a str,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    agent_init_args: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Empty,
    Ready(String),
    QuotaExhausted,
}

/// Creates and holds the session id. Single-flight: the slot mutex is held
/// across the HTTP request, so concurrent callers await the same outcome
/// instead of issuing duplicate requests.
pub struct Bootstrapper {
    http: reqwest::Client,
    endpoint: Url,
    init_args: HashMap<String, String>,
    slot: Mutex<Slot>,
}

impl Bootstrapper {
    pub fn new(endpoint: Url, init_args: HashMap<String, String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            init_args,
            slot: Mutex::new(Slot::Empty),
        }
    }

    /// Return the existing session id or create one for `agent_name`.
    /// Idempotent; at most one request is ever in flight.
    pub async fn create_session(&self, agent_name: &str) -> Result<String, BootstrapError> {
        if agent_name.is_empty() {
            return Err(BootstrapError::Failed("agent name is empty".to_string()));
        }

        let mut slot = self.slot.lock().await;
        match &*slot {
            Slot::Ready(id) => return Ok(id.clone()),
            Slot::QuotaExhausted => return Err(BootstrapError::Quota),
            Slot::Empty => {}
        }

        let body = CreateSessionRequest {
            agent_name,
            agent_init_args: self.init_args.clone(),
        };
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| BootstrapError::Failed(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!(agent = agent_name, "session creation rejected: quota exceeded");
            *slot = Slot::QuotaExhausted;
            return Err(BootstrapError::Quota);
        }
        if !status.is_success() {
            let detail = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| format!("status {status}"));
            return Err(BootstrapError::Failed(detail));
        }

        let parsed: CreateSessionResponse = response
            .json()
            .await
            .map_err(|err| BootstrapError::Failed(err.to_string()))?;
        info!(agent = agent_name, session = %parsed.session_id, "session created");
        *slot = Slot::Ready(parsed.session_id.clone());
        Ok(parsed.session_id)
    }

    /// Current session id, if one has been issued.
    pub async fn current(&self) -> Option<String> {
        match &*self.slot.lock().await {
            Slot::Ready(id) => Some(id.clone()),
            _ => None,
        }
    }

    /// Forget the session id (backend said it is invalid/expired). The
    /// next user action creates a fresh one.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        if let Slot::Ready(id) = &*slot {
            info!(session = %id, "discarding invalidated session");
        }
        *slot = Slot::Empty;
    }

    /// Explicit user restart: clears even a quota-exhausted slot.
    pub async fn reset(&self) {
        *self.slot.lock().await = Slot::Empty;
    }
}
