//! Connection supervisor and client facade.
//!
//! Owns the transport lifecycle: connect, send, heartbeat, close-code
//! classification, retry-vs-terminal decisions, exponential backoff and
//! single-flight reconnection. Every connection gets a monotonically
//! increasing generation; tasks spawned for a connection capture their
//! generation and compare it against the live one before mutating shared
//! state, so a slow-closing old socket's late events are inert.

use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, broadcast};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use chat_protocol::{Classified, ClientFrame, CloseReason, ServerEvent, classify};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::reducer::{Confirmation, Entry, MessageLog};
use crate::session::{Agent, BootstrapError, Bootstrapper};
use crate::status::{self, FailureReason, Status};
use crate::transport::{Connector, FrameSender, TransportEvent, TransportHandle, WsConnector};

/// Fixed notice shown when the backend reports the usage quota exhausted.
pub const UPGRADE_NOTICE: &str =
    "You've reached the usage limit for this agent. Upgrade your plan to keep the conversation going.";

const SESSION_EXPIRED_NOTICE: &str = "Your session has expired. Send a message to start a new one.";
const MISSING_CREDENTIALS_NOTICE: &str =
    "The agent needs credentials that haven't been uploaded yet. Upload them and start a new session.";
const MAX_ATTEMPTS_NOTICE: &str = "Connection failed - maximum retry attempts reached.";

/// Transport connection state. `Failed` is absorbing until the user starts
/// a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed(FailureReason),
}

/// Change notifications for external consumers. Snapshots carry the data;
/// notices only say that something moved.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    Status(Status),
    Log,
    Confirmations,
    Agent(String),
}

/// Read-only view of the client state.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub messages: Vec<Entry>,
    pub confirmations: Vec<Confirmation>,
    pub status: Status,
    pub connection: ConnectionState,
    pub current_agent: Option<String>,
    pub session_id: Option<String>,
    pub reconnect_attempts: u32,
    pub has_sent_first_message: bool,
}

struct ClientState {
    agent: Option<Agent>,
    /// Display label; the backend may swap it via `agent_update`.
    current_agent: Option<String>,
    session_id: Option<String>,
    conn: ConnectionState,
    /// Live connection generation. Bumped before every connect and on
    /// teardown; stale tasks compare and bail.
    generation: u64,
    attempts: u32,
    reconnect_scheduled: bool,
    has_sent_first_message: bool,
    /// Single buffered outbound message, flushed exactly once on open.
    pending: Option<String>,
    sender: Option<FrameSender>,
    log: MessageLog,
}

impl ClientState {
    fn new() -> Self {
        Self {
            agent: None,
            current_agent: None,
            session_id: None,
            conn: ConnectionState::Disconnected,
            generation: 0,
            attempts: 0,
            reconnect_scheduled: false,
            has_sent_first_message: false,
            pending: None,
            sender: None,
            log: MessageLog::new(),
        }
    }
}

struct Inner<C: Connector> {
    config: ClientConfig,
    connector: C,
    bootstrapper: Bootstrapper,
    state: Mutex<ClientState>,
    notices: broadcast::Sender<ClientNotice>,
    /// Self-reference for the tasks this supervisor spawns.
    weak: Weak<Inner<C>>,
}

enum SendAction {
    Done,
    Connect(String),
    Bootstrap(String),
}

impl<C: Connector> Inner<C> {
    fn status_of(&self, s: &ClientState) -> Status {
        status::project(
            &s.conn,
            s.log.is_busy(),
            s.has_sent_first_message,
            self.config.retry.max_attempts,
        )
    }

    fn notify_status(&self, s: &ClientState) {
        let _ = self.notices.send(ClientNotice::Status(self.status_of(s)));
    }

    fn notify_log(&self) {
        let _ = self.notices.send(ClientNotice::Log);
    }

    /// Open a new connection generation. Tears down any live transport
    /// first; refuses while another attempt is mid-flight.
    async fn connect(&self, initial: Option<String>) -> Result<()> {
        let (generation, url) = {
            let mut s = self.state.lock().await;
            if matches!(s.conn, ConnectionState::Connecting) {
                return Err(ClientError::ConnectInFlight);
            }
            let agent_name = s
                .current_agent
                .clone()
                .or_else(|| s.agent.as_ref().map(|a| a.name.clone()))
                .ok_or(ClientError::NoAgent)?;
            let session_id = s
                .session_id
                .clone()
                .ok_or_else(|| ClientError::Internal("connect without a session".to_string()))?;
            let url = self.config.ws_url(&session_id, &agent_name)?;
            if let Some(old) = s.sender.take() {
                old.close();
            }
            s.generation += 1;
            s.reconnect_scheduled = false;
            s.conn = ConnectionState::Connecting;
            self.notify_status(&s);
            (s.generation, url)
        };

        info!(generation, %url, "opening chat connection");
        match self.connector.connect(url).await {
            Ok(handle) => {
                self.on_open(generation, handle, initial).await;
                Ok(())
            }
            Err(err) => {
                self.on_connect_failure(generation, &err).await;
                Ok(())
            }
        }
    }

    async fn on_open(&self, generation: u64, handle: TransportHandle, initial: Option<String>) {
        let TransportHandle { sender, events } = handle;
        {
            let mut s = self.state.lock().await;
            if s.generation != generation {
                debug!(generation, "connection superseded before open");
                sender.close();
                return;
            }
            s.conn = ConnectionState::Connected;
            s.attempts = 0;
            s.reconnect_scheduled = false;
            s.sender = Some(sender.clone());
            info!(generation, "chat connection open");

            // Flush exactly one of the explicit initial message or the
            // buffered pending one.
            if let Some(text) = initial.or_else(|| s.pending.take()) {
                if sender.send(ClientFrame::Message {
                    message: text.clone(),
                }) {
                    s.log.begin_user_turn(&text);
                    s.has_sent_first_message = true;
                    self.notify_log();
                } else {
                    s.pending = Some(text);
                }
            }
            self.notify_status(&s);
        }

        let Some(inner) = self.weak.upgrade() else {
            return;
        };
        let reader = Arc::clone(&inner);
        tokio::spawn(async move { reader.run_read_loop(generation, events).await });
        tokio::spawn(async move { inner.run_heartbeat(generation).await });
    }

    async fn run_read_loop(
        self: Arc<Self>,
        generation: u64,
        mut events: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Frame(raw) => self.on_frame(generation, &raw).await,
                TransportEvent::Closed { code, reason } => {
                    self.on_close(generation, code, &reason).await;
                    return;
                }
                TransportEvent::Failed(err) => {
                    self.on_transport_failure(generation, &err).await;
                    return;
                }
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>, generation: u64) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            let sender = {
                let s = self.state.lock().await;
                if s.generation != generation || !matches!(s.conn, ConnectionState::Connected) {
                    return;
                }
                s.sender.clone()
            };
            let Some(sender) = sender else { return };
            if sender.send(ClientFrame::Ping) {
                debug!(generation, "heartbeat sent");
            } else {
                warn!(generation, "heartbeat send failed");
                self.on_transport_failure(generation, "heartbeat send failed")
                    .await;
                return;
            }
        }
    }

    async fn on_frame(&self, generation: u64, raw: &str) {
        let mut s = self.state.lock().await;
        if s.generation != generation || !matches!(s.conn, ConnectionState::Connected) {
            debug!(generation, "dropping frame from superseded connection");
            return;
        }
        let mut log_changed = false;
        for item in classify(raw) {
            match item {
                Classified::Event(ServerEvent::Pong) => debug!("heartbeat acknowledged"),
                Classified::Event(ServerEvent::AgentUpdate { agent_name }) => {
                    info!(agent = %agent_name, "server-initiated agent hand-off");
                    s.current_agent = Some(agent_name.clone());
                    let _ = self.notices.send(ClientNotice::Agent(agent_name));
                }
                Classified::Event(event) => {
                    let confirmations_before = s.log.confirmations().len();
                    s.log.apply(&event);
                    log_changed = true;
                    if s.log.confirmations().len() != confirmations_before {
                        let _ = self.notices.send(ClientNotice::Confirmations);
                    }
                }
                Classified::Malformed { excerpt } => {
                    s.log.push_decode_failure(&excerpt);
                    log_changed = true;
                }
            }
        }
        if log_changed {
            self.notify_log();
            self.notify_status(&s);
        }
    }

    async fn on_close(&self, generation: u64, code: Option<u16>, reason: &str) {
        let invalidate_session = {
            let mut s = self.state.lock().await;
            if s.generation != generation {
                debug!(generation, ?code, "ignoring close from superseded connection");
                return;
            }
            s.sender = None;
            s.log.interrupt();

            let close_reason = self.config.close_table.reason(code);
            info!(generation, ?code, reason, ?close_reason, "chat connection closed");
            match close_reason {
                CloseReason::Normal => {
                    s.conn = ConnectionState::Disconnected;
                }
                CloseReason::QuotaExceeded => {
                    s.log.push_notice(UPGRADE_NOTICE);
                    s.conn = ConnectionState::Failed(FailureReason::QuotaExceeded);
                    self.notify_log();
                }
                CloseReason::InvalidSession => {
                    s.session_id = None;
                    s.log.push_notice(SESSION_EXPIRED_NOTICE);
                    s.conn = ConnectionState::Failed(FailureReason::InvalidSession);
                    self.notify_log();
                }
                CloseReason::MissingCredentials => {
                    s.log.push_notice(MISSING_CREDENTIALS_NOTICE);
                    s.conn = ConnectionState::Failed(FailureReason::MissingCredentials);
                    self.notify_log();
                }
                CloseReason::Abnormal => {
                    self.maybe_schedule_reconnect(&mut s);
                }
            }
            self.notify_status(&s);
            matches!(close_reason, CloseReason::InvalidSession)
        };
        if invalidate_session {
            self.bootstrapper.invalidate().await;
        }
    }

    async fn on_transport_failure(&self, generation: u64, err: &str) {
        let mut s = self.state.lock().await;
        if s.generation != generation {
            debug!(generation, err, "ignoring failure from superseded connection");
            return;
        }
        warn!(generation, err, "transport failure");
        let was_connected = matches!(s.conn, ConnectionState::Connected);
        s.sender = None;
        s.log.interrupt();
        let scheduled = self.maybe_schedule_reconnect(&mut s);
        if !scheduled && was_connected && !matches!(s.conn, ConnectionState::Failed(_)) {
            s.log.push_notice(&format!("Connection error: {err}"));
            self.notify_log();
        }
        self.notify_status(&s);
    }

    async fn on_connect_failure(&self, generation: u64, err: &ClientError) {
        let mut s = self.state.lock().await;
        if s.generation != generation {
            return;
        }
        warn!(generation, %err, "connection attempt failed");
        let scheduled = self.maybe_schedule_reconnect(&mut s);
        if !scheduled && !matches!(s.conn, ConnectionState::Failed(_)) {
            s.conn = ConnectionState::Disconnected;
            s.log.push_notice(&format!("Failed to establish connection: {err}"));
            self.notify_log();
        }
        self.notify_status(&s);
    }

    /// Schedule a single-flight reconnection attempt, or transition to a
    /// terminal state when retries are exhausted. Auto-reconnect only
    /// happens for a session the user has actually used.
    fn maybe_schedule_reconnect(&self, s: &mut ClientState) -> bool {
        if s.session_id.is_none() || !s.has_sent_first_message {
            debug!("not reconnecting: session was never engaged");
            s.conn = ConnectionState::Disconnected;
            return false;
        }
        if s.reconnect_scheduled {
            debug!("reconnection already scheduled");
            return true;
        }
        if s.attempts >= self.config.retry.max_attempts {
            warn!(attempts = s.attempts, "reconnection attempts exhausted");
            s.conn = ConnectionState::Failed(FailureReason::MaxAttemptsReached);
            s.log.push_notice(MAX_ATTEMPTS_NOTICE);
            self.notify_log();
            return false;
        }
        let Some(inner) = self.weak.upgrade() else {
            return false;
        };

        s.attempts += 1;
        s.reconnect_scheduled = true;
        s.conn = ConnectionState::Reconnecting { attempt: s.attempts };
        let delay = self.config.retry.delay(s.attempts);
        info!(attempt = s.attempts, ?delay, "scheduling reconnection");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_wanted = {
                let s = inner.state.lock().await;
                s.reconnect_scheduled
                    && matches!(s.conn, ConnectionState::Reconnecting { .. })
                    && s.session_id.is_some()
            };
            if !still_wanted {
                debug!("reconnection no longer wanted");
                return;
            }
            if let Err(err) = inner.connect(None).await {
                warn!(%err, "reconnection attempt could not start");
            }
        });
        true
    }

    async fn bootstrap_and_connect(&self, agent_name: String) {
        match self.bootstrapper.create_session(&agent_name).await {
            Ok(session_id) => {
                {
                    let mut s = self.state.lock().await;
                    s.session_id = Some(session_id);
                }
                match self.connect(None).await {
                    Ok(()) | Err(ClientError::ConnectInFlight) => {}
                    Err(err) => warn!(%err, "connect after bootstrap failed"),
                }
            }
            Err(BootstrapError::Quota) => {
                let mut s = self.state.lock().await;
                s.pending = None;
                s.log.push_notice(UPGRADE_NOTICE);
                self.notify_log();
                self.notify_status(&s);
            }
            Err(BootstrapError::Failed(detail)) => {
                let mut s = self.state.lock().await;
                s.pending = None;
                s.log.push_notice(&format!("Could not start a chat session: {detail}"));
                self.notify_log();
                self.notify_status(&s);
            }
        }
    }
}

/// The chat client. Cheap to clone; all clones share one state.
pub struct ChatClient<C: Connector = WsConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ChatClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ChatClient<WsConnector> {
    /// Client over a real WebSocket transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, WsConnector)
    }
}

impl<C: Connector> ChatClient<C> {
    /// Client with a custom transport connector (tests, tunnels).
    pub fn with_connector(config: ClientConfig, connector: C) -> Result<Self> {
        let bootstrapper = Bootstrapper::new(config.session_url()?, config.init_args.clone());
        let (notices, _) = broadcast::channel(256);
        let inner = Arc::new_cyclic(|weak| Inner {
            config,
            connector,
            bootstrapper,
            state: Mutex::new(ClientState::new()),
            notices,
            weak: weak.clone(),
        });
        Ok(Self { inner })
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientNotice> {
        self.inner.notices.subscribe()
    }

    /// Select the agent to talk to. The first selection binds the session
    /// that will be created on the first send; switching later updates the
    /// label only, since the backend owns in-session hand-offs.
    pub async fn select_agent(&self, agent: Agent) {
        let mut s = self.inner.state.lock().await;
        s.current_agent = Some(agent.name.clone());
        let name = agent.name.clone();
        s.agent = Some(agent);
        drop(s);
        let _ = self.inner.notices.send(ClientNotice::Agent(name));
    }

    /// Throw away the current session and conversation and start over with
    /// `agent`. This is the explicit restart affordance after a terminal
    /// failure; it clears even a quota-exhausted bootstrap slot.
    pub async fn start_new_session(&self, agent: Agent) {
        {
            let mut s = self.inner.state.lock().await;
            if let Some(sender) = s.sender.take() {
                sender.close();
            }
            s.generation += 1;
            s.conn = ConnectionState::Disconnected;
            s.attempts = 0;
            s.reconnect_scheduled = false;
            s.has_sent_first_message = false;
            s.pending = None;
            s.session_id = None;
            s.log.clear();
            s.current_agent = Some(agent.name.clone());
            let name = agent.name.clone();
            s.agent = Some(agent);
            let _ = self.inner.notices.send(ClientNotice::Agent(name));
            self.inner.notify_log();
            self.inner.notify_status(&s);
        }
        self.inner.bootstrapper.reset().await;
    }

    /// Send a user message. Opens the connection (and creates the session)
    /// on demand; before either is ready the text is held in the single
    /// pending slot and flushed exactly once on open.
    pub async fn send(&self, text: &str) -> Result<()> {
        let action = {
            let mut s = self.inner.state.lock().await;
            if s.agent.is_none() {
                return Err(ClientError::NoAgent);
            }
            let conn = s.conn;
            let sender = s.sender.clone();
            match (conn, sender) {
                (ConnectionState::Connected, Some(sender)) => {
                    if sender.send(ClientFrame::Message {
                        message: text.to_string(),
                    }) {
                        s.log.begin_user_turn(text);
                        s.has_sent_first_message = true;
                        self.inner.notify_log();
                        self.inner.notify_status(&s);
                        SendAction::Done
                    } else {
                        // Writer died under us; buffer and let the close
                        // handling reconnect.
                        s.pending = Some(text.to_string());
                        SendAction::Done
                    }
                }
                (ConnectionState::Connecting | ConnectionState::Reconnecting { .. }, _) => {
                    s.pending = Some(text.to_string());
                    SendAction::Done
                }
                // An invalidated session was already discarded and the log
                // told the user to send again, so sending bootstraps a
                // fresh one. The other failures require an explicit
                // restart.
                (ConnectionState::Failed(reason), _)
                    if reason != FailureReason::InvalidSession =>
                {
                    return Err(ClientError::NotConnected);
                }
                _ => {
                    if s.session_id.is_some() {
                        SendAction::Connect(text.to_string())
                    } else {
                        s.pending = Some(text.to_string());
                        let name = s.current_agent.clone().unwrap_or_else(|| {
                            s.agent
                                .as_ref()
                                .map(|a| a.name.clone())
                                .unwrap_or_default()
                        });
                        SendAction::Bootstrap(name)
                    }
                }
            }
        };

        match action {
            SendAction::Done => Ok(()),
            SendAction::Connect(text) => match self.inner.connect(Some(text)).await {
                Ok(()) | Err(ClientError::ConnectInFlight) => Ok(()),
                Err(err) => Err(err),
            },
            SendAction::Bootstrap(agent_name) => {
                self.inner.bootstrap_and_connect(agent_name).await;
                Ok(())
            }
        }
    }

    /// Answer an outstanding confirmation request. Each id is answered at
    /// most once; answering an unknown id is a no-op.
    pub async fn respond_confirmation(&self, id: &str, confirmed: bool) -> Result<()> {
        let mut s = self.inner.state.lock().await;
        let sender = match (s.conn, s.sender.clone()) {
            (ConnectionState::Connected, Some(sender)) => sender,
            _ => return Err(ClientError::NotConnected),
        };
        if s.log.take_confirmation(id) {
            sender.send(ClientFrame::ConfirmationResponse {
                id: id.to_string(),
                confirmed,
            });
            info!(id, confirmed, "confirmation answered");
            let _ = self.inner.notices.send(ClientNotice::Confirmations);
        }
        Ok(())
    }

    /// Current state, cloned.
    pub async fn snapshot(&self) -> ClientSnapshot {
        let s = self.inner.state.lock().await;
        ClientSnapshot {
            messages: s.log.entries().to_vec(),
            confirmations: s.log.confirmations().to_vec(),
            status: self.inner.status_of(&s),
            connection: s.conn,
            current_agent: s.current_agent.clone(),
            session_id: s.session_id.clone(),
            reconnect_attempts: s.attempts,
            has_sent_first_message: s.has_sent_first_message,
        }
    }

    /// Tear down the live connection and abandon all scheduled work. The
    /// conversation log is kept.
    pub async fn shutdown(&self) {
        let mut s = self.inner.state.lock().await;
        if let Some(sender) = s.sender.take() {
            sender.close();
        }
        s.generation += 1;
        s.reconnect_scheduled = false;
        if !matches!(s.conn, ConnectionState::Failed(_)) {
            s.conn = ConnectionState::Disconnected;
        }
        self.inner.notify_status(&s);
    }
}
