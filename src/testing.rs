//! In-memory fakes for the transport and REST seams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use frames::{Command, Frame, HeartBeat, Inbound};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tokio::sync::Notify;

use crate::api::{ApiError, ChatApi, ChatSummary};
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionError, ConnectionManager, Socket, Transport};
use crate::message::{Message, SenderRole};
use crate::registry::TopicRegistry;
use crate::session::{CurrentUser, SessionContext, UserRole};

pub(crate) const WAIT: Duration = Duration::from_secs(3);

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(crate) fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect_delay: Duration::from_millis(20),
        heart_beat: HeartBeat::new(0, 0),
        handshake_timeout: Duration::from_secs(1),
    }
}

pub(crate) fn signed_in(role: UserRole) -> Arc<SessionContext> {
    let session = Arc::new(SessionContext::new());
    session.sign_in(CurrentUser { email: "user@bank.test".into(), role }, "jwt-test");
    session
}

pub(crate) fn registry_over(broker: &FakeBroker) -> TopicRegistry {
    let connection = ConnectionManager::new(
        "ws://broker.test/ws/websocket",
        Arc::new(broker.clone()),
        signed_in(UserRole::Client),
        fast_config(),
    );
    TopicRegistry::new(connection)
}

pub(crate) fn summary(id: i64, last_message: &str) -> ChatSummary {
    ChatSummary {
        id,
        client_email: Some(format!("client{id}@bank.test")),
        last_message: Some(last_message.to_owned()),
        ..ChatSummary::default()
    }
}

pub(crate) fn message(id: i64, content: &str) -> Message {
    Message {
        id: Some(id),
        content: content.to_owned(),
        timestamp: format!("2025-03-01T10:00:{:02}", id % 60),
        sender_email: Some("client@bank.test".to_owned()),
        sender_name: None,
        role: SenderRole::Client,
    }
}

// =============================================================================
// FAKE BROKER
// =============================================================================

struct Link {
    id: u64,
    to_client: mpsc::UnboundedSender<String>,
    /// subscription id -> destination
    subscriptions: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerState {
    opens: usize,
    refuse_opens: usize,
    reject_connect: Option<String>,
    server_heart_beat: HeartBeat,
    echo_sends: bool,
    next_link: u64,
    next_message: u64,
    next_echo_id: i64,
    heartbeats: usize,
    link: Option<Link>,
    received: Vec<Frame>,
}

impl BrokerState {
    fn deliver(&mut self, destination: &str, body: &str) -> usize {
        let Some(link) = &self.link else { return 0 };
        let to_client = link.to_client.clone();
        let targets: Vec<String> = link
            .subscriptions
            .iter()
            .filter(|(_, subscribed)| *subscribed == destination)
            .map(|(id, _)| id.clone())
            .collect();

        let mut delivered = 0;
        for id in targets {
            self.next_message += 1;
            let frame = Frame::new(Command::Message)
                .with_header("destination", destination)
                .with_header("subscription", id)
                .with_header("message-id", self.next_message.to_string())
                .with_body(body);
            if to_client.unbounded_send(frames::encode_frame(&frame)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn reply(&self, frame: &Frame) {
        if let Some(link) = &self.link {
            let _ = link.to_client.unbounded_send(frames::encode_frame(frame));
        }
    }

    fn handle(&mut self, link_id: u64, frame: Frame) {
        if self.link.as_ref().is_none_or(|link| link.id != link_id) {
            return;
        }
        self.received.push(frame.clone());
        match frame.command {
            Command::Connect | Command::Stomp => match self.reject_connect.clone() {
                Some(reason) => self.reply(&Frame::new(Command::Error).with_header("message", reason)),
                None => self.reply(
                    &Frame::new(Command::Connected)
                        .with_header("version", "1.2")
                        .with_header("heart-beat", self.server_heart_beat.header_value()),
                ),
            },
            Command::Subscribe => {
                if let (Some(id), Some(destination), Some(link)) =
                    (frame.header("id"), frame.header("destination"), self.link.as_mut())
                {
                    link.subscriptions.insert(id.to_owned(), destination.to_owned());
                }
            }
            Command::Unsubscribe => {
                if let (Some(id), Some(link)) = (frame.header("id"), self.link.as_mut()) {
                    link.subscriptions.remove(id);
                }
            }
            Command::Send if self.echo_sends => self.echo(&frame),
            Command::Disconnect => {
                if let Some(receipt) = frame.header("receipt") {
                    self.reply(&Frame::new(Command::Receipt).with_header("receipt-id", receipt));
                }
            }
            _ => {}
        }
    }

    fn echo(&mut self, frame: &Frame) {
        let Some(chat_id) = frame
            .header("destination")
            .and_then(|d| d.strip_prefix("/app/chats/"))
            .and_then(|d| d.strip_suffix("/send"))
        else {
            return;
        };
        let content = serde_json::from_str::<serde_json::Value>(&frame.body)
            .ok()
            .and_then(|v| v.get("content").and_then(serde_json::Value::as_str).map(str::to_owned))
            .unwrap_or_default();
        self.next_echo_id += 1;
        let body = serde_json::json!({
            "id": 9_000 + self.next_echo_id,
            "content": content,
            "date": "2025-03-01T12:00:00",
            "senderRole": "CLIENT",
            "senderEmail": "user@bank.test",
        })
        .to_string();
        self.deliver(&format!("/topic/chats/{chat_id}"), &body);
    }
}

/// Scriptable STOMP broker reachable through [`Transport`].
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn opens(&self) -> usize {
        self.lock().opens
    }

    pub(crate) fn refuse_next_opens(&self, count: usize) {
        self.lock().refuse_opens = count;
    }

    pub(crate) fn reject_connect(&self, reason: &str) {
        self.lock().reject_connect = Some(reason.to_owned());
    }

    pub(crate) fn set_heart_beat(&self, heart_beat: HeartBeat) {
        self.lock().server_heart_beat = heart_beat;
    }

    pub(crate) fn echo_sends(&self) {
        self.lock().echo_sends = true;
    }

    /// Heart-beat EOLs received from the client.
    pub(crate) fn heartbeats(&self) -> usize {
        self.lock().heartbeats
    }

    /// Frames with `command` received on any link, in order.
    pub(crate) fn received(&self, command: Command) -> Vec<Frame> {
        self.lock().received.iter().filter(|f| f.command == command).cloned().collect()
    }

    /// Number of live subscriptions on the current link for `destination`.
    pub(crate) fn subscriptions_to(&self, destination: &str) -> usize {
        self.lock()
            .link
            .as_ref()
            .map_or(0, |link| link.subscriptions.values().filter(|d| *d == destination).count())
    }

    pub(crate) fn publish(&self, destination: &str, body: &str) -> usize {
        self.lock().deliver(destination, body)
    }

    /// Push raw text to the client on the current link.
    pub(crate) fn send_raw(&self, text: &str) {
        if let Some(link) = &self.lock().link {
            let _ = link.to_client.unbounded_send(text.to_owned());
        }
    }

    /// Drop the current link as if the network went away.
    pub(crate) fn drop_link(&self) {
        self.lock().link = None;
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn open(&self, _url: &str) -> Result<Socket, ConnectionError> {
        let (client_tx, client_rx) = mpsc::unbounded::<String>();
        let (server_tx, server_rx) = mpsc::unbounded::<String>();
        let link_id = {
            let mut state = self.lock();
            state.opens += 1;
            if state.refuse_opens > 0 {
                state.refuse_opens -= 1;
                return Err(ConnectionError::Transport("connection refused".to_owned()));
            }
            state.next_link += 1;
            let id = state.next_link;
            state.link = Some(Link { id, to_client: server_tx, subscriptions: HashMap::new() });
            id
        };
        tokio::spawn(serve_link(self.state.clone(), link_id, client_rx));

        Ok(Socket {
            sink: Box::pin(client_tx.sink_map_err(|e| ConnectionError::Transport(e.to_string()))),
            stream: Box::pin(server_rx.map(Ok::<String, ConnectionError>)),
        })
    }
}

async fn serve_link(state: Arc<Mutex<BrokerState>>, link_id: u64, mut from_client: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = from_client.next().await {
        let Ok(items) = frames::decode(&text) else { continue };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        for item in items {
            match item {
                Inbound::Heartbeat => state.heartbeats += 1,
                Inbound::Frame(frame) => state.handle(link_id, frame),
            }
        }
    }
}

// =============================================================================
// FAKE CHAT API
// =============================================================================

pub(crate) struct FakeApiState {
    pub client_chats: Vec<ChatSummary>,
    pub client_chats_error: Option<ApiError>,
    pub next_chat_id: i64,
    pub histories: HashMap<i64, Vec<Message>>,
    pub support_history_error: Option<ApiError>,
    /// `support_messages` for these chats waits until the gate is notified.
    pub history_gates: HashMap<i64, Arc<Notify>>,
    pub unassigned: Vec<ChatSummary>,
    pub mine: Vec<ChatSummary>,
    pub unassigned_error: Option<ApiError>,
    pub mine_error: Option<ApiError>,
    pub assign_error: Option<ApiError>,
    /// Whether `assign` moves the chat from unassigned to mine.
    pub assign_commits: bool,
    pub close_error: Option<ApiError>,
    /// Whether `close` marks the chat closed.
    pub close_commits: bool,
    pub calls: Vec<String>,
}

impl Default for FakeApiState {
    fn default() -> Self {
        Self {
            client_chats: Vec::new(),
            client_chats_error: None,
            next_chat_id: 100,
            histories: HashMap::new(),
            support_history_error: None,
            history_gates: HashMap::new(),
            unassigned: Vec::new(),
            mine: Vec::new(),
            unassigned_error: None,
            mine_error: None,
            assign_error: None,
            assign_commits: true,
            close_error: None,
            close_commits: true,
            calls: Vec::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    state: Mutex<FakeApiState>,
}

pub(crate) fn status(code: u16) -> ApiError {
    ApiError::Status { status: code, body: String::new() }
}

impl FakeApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn edit(&self, f: impl FnOnce(&mut FakeApiState)) {
        f(&mut self.lock());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeApiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: String) -> MutexGuard<'_, FakeApiState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_my_chats(&self) -> Result<Vec<ChatSummary>, ApiError> {
        let state = self.record("list_my_chats".into());
        match &state.client_chats_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.client_chats.clone()),
        }
    }

    async fn start_chat(&self) -> Result<ChatSummary, ApiError> {
        let mut state = self.record("start_chat".into());
        let id = state.next_chat_id;
        state.next_chat_id += 1;
        let chat = ChatSummary { id, client_email: Some("user@bank.test".into()), ..ChatSummary::default() };
        state.client_chats.push(chat.clone());
        Ok(chat)
    }

    async fn client_messages(&self, chat_id: i64) -> Result<Vec<Message>, ApiError> {
        let state = self.record(format!("client_messages {chat_id}"));
        Ok(state.histories.get(&chat_id).cloned().unwrap_or_default())
    }

    async fn list_unassigned(&self) -> Result<Vec<ChatSummary>, ApiError> {
        let state = self.record("list_unassigned".into());
        match &state.unassigned_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.unassigned.clone()),
        }
    }

    async fn list_mine(&self) -> Result<Vec<ChatSummary>, ApiError> {
        let state = self.record("list_mine".into());
        match &state.mine_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.mine.clone()),
        }
    }

    async fn assign(&self, chat_id: i64) -> Result<(), ApiError> {
        let mut state = self.record(format!("assign {chat_id}"));
        if state.assign_commits {
            if let Some(pos) = state.unassigned.iter().position(|c| c.id == chat_id) {
                let chat = state.unassigned.remove(pos);
                state.mine.push(chat);
            }
        }
        state.assign_error.clone().map_or(Ok(()), Err)
    }

    async fn close(&self, chat_id: i64) -> Result<(), ApiError> {
        let mut guard = self.record(format!("close {chat_id}"));
        let state = &mut *guard;
        if state.close_commits {
            for chat in state.mine.iter_mut().chain(state.unassigned.iter_mut()) {
                if chat.id == chat_id {
                    chat.closed = true;
                }
            }
        }
        state.close_error.clone().map_or(Ok(()), Err)
    }

    async fn support_messages(&self, chat_id: i64) -> Result<Vec<Message>, ApiError> {
        let gate = self.record(format!("support_messages {chat_id}")).history_gates.get(&chat_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let state = self.lock();
        match &state.support_history_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.histories.get(&chat_id).cloned().unwrap_or_default()),
        }
    }
}
