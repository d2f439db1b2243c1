//! Inbound frame classification.

use serde_json::Value;
use tracing::warn;

/// Longest slice of a malformed raw record that may be surfaced to the
/// user. Anything beyond this stays in logs only.
pub const MAX_RAW_EXCERPT: usize = 100;

/// Arguments attached to a tool call.
///
/// The backend sends either a structured object or a string that usually
/// contains JSON. A string is opportunistically parsed; when that fails the
/// raw text is kept as-is rather than treated as an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    Structured(Value),
    Opaque(String),
}

impl ToolArguments {
    fn from_payload(value: Value) -> Self {
        match value {
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(parsed) if parsed.is_object() || parsed.is_array() => {
                    ToolArguments::Structured(parsed)
                }
                _ => ToolArguments::Opaque(s),
            },
            other => ToolArguments::Structured(other),
        }
    }
}

/// A typed event decoded from one inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Backend-reported error for the current turn.
    Error { message: String },
    /// Incremental fragment of the assistant's answer.
    TextDelta { fragment: String },
    /// Incremental fragment of the assistant's thinking, rendered apart
    /// from the final answer.
    Reasoning { fragment: String },
    /// One tool invocation.
    ToolCall {
        name: String,
        arguments: ToolArguments,
    },
    /// Server-initiated agent hand-off within the same session.
    AgentUpdate { agent_name: String },
    /// The backend wants the user to approve a command before running it.
    ConfirmationRequest { id: String, command: String },
    /// End of one full turn.
    End,
    /// Heartbeat acknowledgment. Consumed, never surfaced.
    Pong,
    /// A well-formed record of a kind this client does not know. Logged
    /// for diagnostics, never surfaced, never fatal.
    Unknown { kind: String },
}

/// Outcome of classifying one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Event(ServerEvent),
    /// The record was not valid JSON or was missing a required field.
    /// Carries a bounded excerpt of the raw text for the diagnostic entry.
    Malformed { excerpt: String },
}

/// Classify one transport payload into typed events.
///
/// A payload may carry several newline-delimited records; each is decoded
/// independently so a malformed record never discards its siblings.
pub fn classify(raw: &str) -> Vec<Classified> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(classify_record)
        .collect()
}

fn classify_record(record: &str) -> Classified {
    let value: Value = match serde_json::from_str(record) {
        Ok(v) => v,
        Err(err) => {
            warn!(%err, "failed to decode inbound record");
            return malformed(record);
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        warn!("inbound record has no type field");
        return malformed(record);
    };

    let payload = value.get("payload");
    let field = |name: &str| -> Option<String> {
        payload
            .and_then(|p| p.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let event = match kind {
        "error" => {
            // Older backend revisions put the message at the top level.
            let message = field("message")
                .or_else(|| value.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "An error occurred".to_string());
            ServerEvent::Error { message }
        }
        "message" => match field("message") {
            Some(fragment) => ServerEvent::TextDelta { fragment },
            None => return malformed(record),
        },
        "reasoning" => match field("message") {
            Some(fragment) => ServerEvent::Reasoning { fragment },
            None => return malformed(record),
        },
        "tool_call" => {
            let Some(name) = field("name") else {
                return malformed(record);
            };
            let arguments = payload
                .and_then(|p| p.get("arguments"))
                .cloned()
                .map(ToolArguments::from_payload)
                .unwrap_or(ToolArguments::Structured(Value::Null));
            ServerEvent::ToolCall { name, arguments }
        }
        "agent_update" => match field("agent_name") {
            Some(agent_name) => ServerEvent::AgentUpdate { agent_name },
            None => return malformed(record),
        },
        "confirmation_request" => match (field("id"), field("command")) {
            (Some(id), Some(command)) => ServerEvent::ConfirmationRequest { id, command },
            _ => return malformed(record),
        },
        "end" => ServerEvent::End,
        "pong" => ServerEvent::Pong,
        other => {
            warn!(kind = other, "unknown inbound event kind");
            ServerEvent::Unknown {
                kind: other.to_string(),
            }
        }
    };
    Classified::Event(event)
}

fn malformed(record: &str) -> Classified {
    Classified::Malformed {
        excerpt: truncate_chars(record, MAX_RAW_EXCERPT),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
