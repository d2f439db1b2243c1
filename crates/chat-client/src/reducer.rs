//! Conversation log reducer.
//!
//! Folds classified server events into an ordered, append-only message
//! log. At most one assistant-text entry, one reasoning entry and one tool
//! group are "open" (mutable) at a time; anything superseded by a
//! different kind, or closed by the end of a turn, is never touched again.

use chat_protocol::{ServerEvent, ToolArguments};
use serde_json::Value;

/// One tool invocation inside a tool group.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    /// Structured when the backend (or an opportunistic parse) gave us
    /// JSON, opaque text otherwise.
    pub arguments: Value,
}

impl ToolInvocation {
    fn new(name: String, arguments: ToolArguments) -> Self {
        let arguments = match arguments {
            ToolArguments::Structured(v) => v,
            ToolArguments::Opaque(s) => Value::String(s),
        };
        Self { name, arguments }
    }
}

/// Whether a tool group is still collecting calls. Presentational only;
/// `Completed` does not mean the tools succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolGroupState {
    Running,
    Completed,
}

/// One log entry. Ids are unique and creation-ordered.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    User { id: u64, text: String },
    AssistantText { id: u64, text: String },
    Reasoning { id: u64, text: String },
    Error { id: u64, text: String },
    ToolGroup {
        id: u64,
        tools: Vec<ToolInvocation>,
        state: ToolGroupState,
    },
}

impl Entry {
    pub fn id(&self) -> u64 {
        match self {
            Entry::User { id, .. }
            | Entry::AssistantText { id, .. }
            | Entry::Reasoning { id, .. }
            | Entry::Error { id, .. }
            | Entry::ToolGroup { id, .. } => *id,
        }
    }

    /// Text content, empty for tool groups.
    pub fn text(&self) -> &str {
        match self {
            Entry::User { text, .. }
            | Entry::AssistantText { text, .. }
            | Entry::Reasoning { text, .. }
            | Entry::Error { text, .. } => text,
            Entry::ToolGroup { .. } => "",
        }
    }
}

/// An unanswered confirmation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub id: String,
    pub command: String,
}

/// The append-only conversation log plus outstanding confirmations. The
/// reducer is the sole writer; readers get cloned snapshots.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Entry>,
    confirmations: Vec<Confirmation>,
    next_id: u64,
    open_text: Option<usize>,
    open_reasoning: Option<usize>,
    open_group: Option<usize>,
    busy: bool,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn confirmations(&self) -> &[Confirmation] {
        &self.confirmations
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push(&mut self, entry: Entry) -> usize {
        // Any new entry supersedes the previously open text/reasoning
        // entries.
        self.open_text = None;
        self.open_reasoning = None;
        self.entries.push(entry);
        self.entries.len() - 1
    }

    fn close_group(&mut self) {
        if let Some(index) = self.open_group.take()
            && let Some(Entry::ToolGroup { state, .. }) = self.entries.get_mut(index)
        {
            *state = ToolGroupState::Completed;
        }
    }

    /// Begin a user turn: appends the user entry, closes anything still
    /// open from the previous turn, marks the client busy.
    pub fn begin_user_turn(&mut self, text: &str) {
        self.close_group();
        let id = self.next_id();
        self.push(Entry::User {
            id,
            text: text.to_string(),
        });
        self.busy = true;
    }

    /// Append an internal diagnostic for a record that failed to decode.
    /// `excerpt` is already bounded by the classifier.
    pub fn push_decode_failure(&mut self, excerpt: &str) {
        self.close_group();
        let id = self.next_id();
        self.push(Entry::Error {
            id,
            text: format!("Received an unreadable message from the backend: {excerpt}"),
        });
        self.busy = false;
    }

    /// Append a terminal notice (quota, authorization, retries exhausted).
    pub fn push_notice(&mut self, text: &str) {
        self.close_group();
        let id = self.next_id();
        self.push(Entry::Error {
            id,
            text: text.to_string(),
        });
        self.busy = false;
    }

    /// Fold one server event into the log.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::Error { message } => {
                self.close_group();
                let id = self.next_id();
                self.push(Entry::Error {
                    id,
                    text: message.clone(),
                });
                self.busy = false;
            }
            ServerEvent::TextDelta { fragment } => {
                if let Some(index) = self.open_text {
                    if let Some(Entry::AssistantText { text, .. }) = self.entries.get_mut(index) {
                        text.push_str(fragment);
                    }
                } else {
                    self.close_group();
                    let id = self.next_id();
                    let index = self.push(Entry::AssistantText {
                        id,
                        text: fragment.clone(),
                    });
                    self.open_text = Some(index);
                }
            }
            ServerEvent::Reasoning { fragment } => {
                if let Some(index) = self.open_reasoning {
                    if let Some(Entry::Reasoning { text, .. }) = self.entries.get_mut(index) {
                        text.push_str("\n\n");
                        text.push_str(fragment);
                    }
                } else {
                    self.close_group();
                    let id = self.next_id();
                    let index = self.push(Entry::Reasoning {
                        id,
                        text: fragment.clone(),
                    });
                    self.open_reasoning = Some(index);
                }
            }
            ServerEvent::ToolCall { name, arguments } => {
                let invocation = ToolInvocation::new(name.clone(), arguments.clone());
                if let Some(index) = self.open_group {
                    if let Some(Entry::ToolGroup { tools, .. }) = self.entries.get_mut(index) {
                        tools.push(invocation);
                    }
                } else {
                    let id = self.next_id();
                    let index = self.push(Entry::ToolGroup {
                        id,
                        tools: vec![invocation],
                        state: ToolGroupState::Running,
                    });
                    self.open_group = Some(index);
                }
            }
            ServerEvent::ConfirmationRequest { id, command } => {
                self.close_group();
                self.confirmations.push(Confirmation {
                    id: id.clone(),
                    command: command.clone(),
                });
            }
            ServerEvent::End => {
                self.close_group();
                self.open_text = None;
                self.open_reasoning = None;
                self.busy = false;
            }
            // Agent hand-offs touch the status side channel, not the log.
            // Pong is consumed upstream; unknown kinds are log-only noise.
            ServerEvent::AgentUpdate { .. } | ServerEvent::Pong | ServerEvent::Unknown { .. } => {}
        }
    }

    /// The transport dropped mid-turn: close anything still open and clear
    /// the busy flag without appending an entry.
    pub fn interrupt(&mut self) {
        self.close_group();
        self.open_text = None;
        self.open_reasoning = None;
        self.busy = false;
    }

    /// Remove a confirmation by id. Returns whether it was outstanding;
    /// answering an unknown or already-answered id is a no-op.
    pub fn take_confirmation(&mut self, id: &str) -> bool {
        let before = self.confirmations.len();
        self.confirmations.retain(|c| c.id != id);
        self.confirmations.len() != before
    }

    /// Full reset for a new session.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_protocol::ServerEvent as Ev;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn delta(s: &str) -> Ev {
        Ev::TextDelta {
            fragment: s.to_string(),
        }
    }

    fn tool(name: &str) -> Ev {
        Ev::ToolCall {
            name: name.to_string(),
            arguments: ToolArguments::Structured(json!({})),
        }
    }

    #[test]
    fn text_deltas_concatenate_in_arrival_order() {
        let mut log = MessageLog::new();
        log.begin_user_turn("hi");
        for fragment in ["Hel", "lo ", "world"] {
            log.apply(&delta(fragment));
        }
        let last = log.entries().last().unwrap();
        assert_eq!(last.text(), "Hello world");
        assert_eq!(log.entries().len(), 2);
    }

    #[test]
    fn consecutive_tool_calls_share_one_group_in_order() {
        let mut log = MessageLog::new();
        log.apply(&tool("get_pods"));
        log.apply(&tool("get_nodes"));
        log.apply(&tool("describe"));
        assert_eq!(log.entries().len(), 1);
        match log.entries().last().unwrap() {
            Entry::ToolGroup { tools, state, .. } => {
                let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
                assert_eq!(names, vec!["get_pods", "get_nodes", "describe"]);
                assert_eq!(*state, ToolGroupState::Running);
            }
            other => panic!("expected tool group, got {other:?}"),
        }
    }

    #[test]
    fn text_closes_tool_group() {
        let mut log = MessageLog::new();
        log.apply(&tool("get_pods"));
        log.apply(&delta("done"));
        log.apply(&tool("get_nodes"));
        // Second tool call lands in a fresh group.
        assert_eq!(log.entries().len(), 3);
        match &log.entries()[0] {
            Entry::ToolGroup { state, .. } => assert_eq!(*state, ToolGroupState::Completed),
            other => panic!("expected tool group, got {other:?}"),
        }
    }

    #[test]
    fn end_closes_group_and_next_text_opens_fresh_entry() {
        let mut log = MessageLog::new();
        log.apply(&tool("get_pods"));
        log.apply(&delta("first turn"));
        log.apply(&Ev::End);
        match &log.entries()[0] {
            Entry::ToolGroup { state, .. } => assert_eq!(*state, ToolGroupState::Completed),
            other => panic!("expected tool group, got {other:?}"),
        }
        assert!(!log.is_busy());

        log.apply(&delta("second turn"));
        assert_eq!(log.entries().len(), 3);
        assert_eq!(log.entries()[1].text(), "first turn");
        assert_eq!(log.entries()[2].text(), "second turn");
    }

    #[test]
    fn reasoning_appends_with_blank_line_and_never_merges_with_text() {
        let mut log = MessageLog::new();
        log.apply(&Ev::Reasoning {
            fragment: "step one".into(),
        });
        log.apply(&Ev::Reasoning {
            fragment: "step two".into(),
        });
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].text(), "step one\n\nstep two");

        log.apply(&delta("answer"));
        log.apply(&Ev::Reasoning {
            fragment: "more thinking".into(),
        });
        assert_eq!(log.entries().len(), 3);
        assert!(matches!(log.entries()[2], Entry::Reasoning { .. }));
        assert_eq!(log.entries()[2].text(), "more thinking");
    }

    #[test]
    fn error_closes_group_and_clears_busy() {
        let mut log = MessageLog::new();
        log.begin_user_turn("do it");
        log.apply(&tool("apply"));
        log.apply(&Ev::Error {
            message: "cluster unreachable".into(),
        });
        assert!(!log.is_busy());
        match &log.entries()[1] {
            Entry::ToolGroup { state, .. } => assert_eq!(*state, ToolGroupState::Completed),
            other => panic!("expected tool group, got {other:?}"),
        }
        assert!(matches!(log.entries()[2], Entry::Error { .. }));
        // Error supersedes the stream: new text starts fresh.
        log.apply(&delta("recovered"));
        assert_eq!(log.entries()[3].text(), "recovered");
    }

    #[test]
    fn confirmation_request_closes_group_without_touching_messages() {
        let mut log = MessageLog::new();
        log.apply(&tool("delete_pod"));
        log.apply(&Ev::ConfirmationRequest {
            id: "abc".into(),
            command: "kubectl delete pod x".into(),
        });
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.confirmations().len(), 1);
        match &log.entries()[0] {
            Entry::ToolGroup { state, .. } => assert_eq!(*state, ToolGroupState::Completed),
            other => panic!("expected tool group, got {other:?}"),
        }
    }

    #[test]
    fn confirmation_answered_exactly_once() {
        let mut log = MessageLog::new();
        log.apply(&Ev::ConfirmationRequest {
            id: "abc".into(),
            command: "rm -rf".into(),
        });
        assert!(log.take_confirmation("abc"));
        assert!(!log.take_confirmation("abc"));
        assert!(log.confirmations().is_empty());
    }

    #[test]
    fn multiple_confirmations_answered_independently() {
        let mut log = MessageLog::new();
        for id in ["a", "b", "c"] {
            log.apply(&Ev::ConfirmationRequest {
                id: id.into(),
                command: format!("cmd {id}"),
            });
        }
        assert!(log.take_confirmation("b"));
        let ids: Vec<_> = log.confirmations().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn decode_failure_appends_bounded_diagnostic() {
        let mut log = MessageLog::new();
        log.begin_user_turn("hi");
        log.push_decode_failure("{not json");
        let last = log.entries().last().unwrap();
        assert!(matches!(last, Entry::Error { .. }));
        assert!(last.text().contains("{not json"));
        assert!(!log.is_busy());
    }

    #[test]
    fn ids_are_unique_and_creation_ordered() {
        let mut log = MessageLog::new();
        log.begin_user_turn("one");
        log.apply(&delta("a"));
        log.apply(&Ev::End);
        log.begin_user_turn("two");
        let ids: Vec<_> = log.entries().iter().map(Entry::id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn opaque_tool_arguments_survive_as_text() {
        let mut log = MessageLog::new();
        log.apply(&Ev::ToolCall {
            name: "kubectl".into(),
            arguments: ToolArguments::Opaque("get pods -A".into()),
        });
        match log.entries().last().unwrap() {
            Entry::ToolGroup { tools, .. } => {
                assert_eq!(tools[0].arguments, json!("get pods -A"));
            }
            other => panic!("expected tool group, got {other:?}"),
        }
    }
}
