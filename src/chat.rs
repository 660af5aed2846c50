//! Client-side chat session controller.
//!
//! DESIGN
//! ======
//! A client has at most one open chat. `init()` connects best-effort, finds
//! the open chat (or starts one), seeds the message log from REST history,
//! then listens on the chat's message and closed topics through one pump
//! task. When support closes the chat the pump unsubscribes the old topics,
//! resolves a replacement and announces it with a SYSTEM message. The new
//! chat gets its own pump, so a replacement that is closed again repeats the
//! same cycle.
//!
//! Every resolution runs under a generation number. Results that come back
//! after the controller moved on (replacement, re-init, shutdown) are
//! dropped instead of overwriting newer state.
//!
//! ERROR HANDLING
//! ==============
//! REST failures during resolution leave the controller in `Resolving` and
//! are returned to the caller, who may call `init()` again. Subscription
//! failures are logged: history is still shown and the pump subscribes once
//! the connection comes up.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{ApiError, ChatApi, ChatSummary, LiveEvent, classify_event};
use crate::connection::{ConnectionError, ConnectionState};
use crate::message::{CHAT_REPLACED_NOTICE, Message, MessageLog};
use crate::registry::{
    TopicEvent, TopicRegistry, TopicStream, chat_closed_topic, chat_topic, next_event, resubscribe, subscribe_logged,
};

/// Error surfaced by the chat controllers.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChatError {
    /// No chat is active, so there is nowhere to send.
    #[error("no active chat")]
    NotActive,
    /// The support console has no chat selected.
    #[error("no chat selected")]
    NoSelection,
    /// The message is empty or only whitespace.
    #[error("message is empty")]
    EmptyMessage,
    /// The controller moved on while the operation was in flight.
    #[error("operation superseded by a newer one")]
    Superseded,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChatPhase {
    #[default]
    Idle,
    Resolving,
    Active,
    Closing,
}

/// Observable state of a [`ChatSessionController`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    pub phase: ChatPhase,
    pub session: Option<ChatSummary>,
    pub messages: Vec<Message>,
}

#[derive(Default)]
struct ChatState {
    phase: ChatPhase,
    session: Option<ChatSummary>,
    log: MessageLog,
    generation: u64,
}

struct ChatInner {
    registry: TopicRegistry,
    api: Arc<dyn ChatApi>,
    connect_wait: Duration,
    state: Mutex<ChatState>,
    snapshot: watch::Sender<ChatSnapshot>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Drives the client's single support chat. Cheap to clone.
#[derive(Clone)]
pub struct ChatSessionController {
    inner: Arc<ChatInner>,
}

impl ChatSessionController {
    #[must_use]
    pub fn new(registry: TopicRegistry, api: Arc<dyn ChatApi>, connect_wait: Duration) -> Self {
        let (snapshot, _) = watch::channel(ChatSnapshot::default());
        Self {
            inner: Arc::new(ChatInner {
                registry,
                api,
                connect_wait,
                state: Mutex::new(ChatState::default()),
                snapshot,
                pump: Mutex::new(None),
            }),
        }
    }

    /// Open the client's chat: reuse the open one or start a new one.
    ///
    /// Returns the current chat at once when already active.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] if listing, starting or loading the chat
    /// fails, and [`ChatError::Superseded`] if `init()` or `shutdown()` ran
    /// again before this call finished.
    pub async fn init(&self) -> Result<ChatSummary, ChatError> {
        let generation = {
            let mut state = self.inner.lock();
            if state.phase == ChatPhase::Active
                && let Some(session) = &state.session
            {
                return Ok(session.clone());
            }
            state.generation += 1;
            state.phase = ChatPhase::Resolving;
            self.inner.publish(&state);
            state.generation
        };
        self.inner.stop_pump();

        self.inner.registry.connect_within(self.inner.connect_wait).await;
        self.inner.resolve(generation, None).await
    }

    /// Post `content` into the active chat.
    ///
    /// The message shows up in the log once the broker echoes it back.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::EmptyMessage`] for blank input,
    /// [`ChatError::NotActive`] without an active chat, and
    /// [`ChatError::Connection`] when the transport is not connected.
    pub fn send(&self, content: &str) -> Result<(), ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let chat_id = {
            let state = self.inner.lock();
            match (&state.session, state.phase) {
                (Some(session), ChatPhase::Active) => session.id,
                _ => return Err(ChatError::NotActive),
            }
        };
        self.inner.registry.send_chat_message(chat_id, content)?;
        tracing::debug!(chat_id, "chat message sent");
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ChatSnapshot> {
        self.inner.snapshot.subscribe()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<i64> {
        self.inner.lock().session.as_ref().map(|s| s.id)
    }

    #[must_use]
    pub fn phase(&self) -> ChatPhase {
        self.inner.lock().phase
    }

    /// Stop listening and drop the chat's topics. The last chat and its
    /// messages stay in the snapshot.
    pub fn shutdown(&self) {
        let chat_id = {
            let mut state = self.inner.lock();
            state.generation += 1;
            state.phase = ChatPhase::Idle;
            self.inner.publish(&state);
            state.session.as_ref().map(|s| s.id)
        };
        self.inner.stop_pump();
        if let Some(chat_id) = chat_id {
            self.inner.unsubscribe_chat(chat_id);
        }
        tracing::debug!(chat_id, "chat controller shut down");
    }
}

impl ChatInner {
    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &ChatState) {
        self.snapshot.send_replace(ChatSnapshot {
            phase: state.phase,
            session: state.session.clone(),
            messages: state.log.to_vec(),
        });
    }

    fn stop_pump(&self) {
        let handle = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn unsubscribe_chat(&self, chat_id: i64) {
        self.registry.unsubscribe(&chat_topic(chat_id));
        self.registry.unsubscribe(&chat_closed_topic(chat_id));
    }

    /// Find or start the open chat, seed its history and start listening.
    async fn resolve(self: &Arc<Self>, generation: u64, exclude: Option<i64>) -> Result<ChatSummary, ChatError> {
        let chats = self.api.list_my_chats().await?;
        let session = match chats.into_iter().find(|c| !c.closed && Some(c.id) != exclude) {
            Some(session) => session,
            None => {
                let session = self.api.start_chat().await?;
                tracing::info!(chat_id = session.id, "started new support chat");
                session
            }
        };
        let history = self.api.client_messages(session.id).await?;

        {
            let mut state = self.lock();
            if state.generation != generation {
                return Err(ChatError::Superseded);
            }
            state.session = Some(session.clone());
            state.log.seed(history);
            state.phase = ChatPhase::Active;
            self.publish(&state);
        }
        tracing::info!(chat_id = session.id, "chat active");

        let messages = subscribe_logged(&self.registry, &chat_topic(session.id));
        let closed = subscribe_logged(&self.registry, &chat_closed_topic(session.id));
        let pump = spawn_pump(Arc::downgrade(self), session.id, generation, messages, closed);
        // The previous pump may be the task running this replacement, so it is left to finish.
        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);
        Ok(session)
    }

    fn apply_live(&self, generation: u64, event: TopicEvent) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        let changed = match classify_event(event) {
            LiveEvent::Message(message) => state.log.push(message),
            LiveEvent::Notice(text) => {
                state.log.push_system(text);
                true
            }
        };
        if changed {
            self.publish(&state);
        }
    }

    /// Replace a chat that support closed with a fresh one.
    async fn replace_closed(self: &Arc<Self>, closed_id: i64, generation: u64) {
        let generation = {
            let mut state = self.lock();
            if state.generation != generation || state.session.as_ref().map(|s| s.id) != Some(closed_id) {
                return;
            }
            state.generation += 1;
            state.phase = ChatPhase::Closing;
            self.publish(&state);
            state.generation
        };
        tracing::info!(chat_id = closed_id, "chat closed by support; opening a replacement");

        self.unsubscribe_chat(closed_id);
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.log.clear();
            state.session = None;
            state.phase = ChatPhase::Resolving;
            self.publish(&state);
        }

        match self.resolve(generation, Some(closed_id)).await {
            Ok(session) => {
                let mut state = self.lock();
                if state.generation == generation {
                    state.log.push_system(CHAT_REPLACED_NOTICE);
                    self.publish(&state);
                }
                tracing::info!(old_chat_id = closed_id, chat_id = session.id, "chat replaced");
            }
            Err(ChatError::Superseded) => {}
            Err(error) => tracing::warn!(chat_id = closed_id, error = %error, "failed to open replacement chat"),
        }
    }
}

fn spawn_pump(
    inner: Weak<ChatInner>,
    chat_id: i64,
    generation: u64,
    messages: Option<TopicStream>,
    closed: Option<TopicStream>,
) -> JoinHandle<()> {
    tokio::spawn(run_pump(inner, chat_id, generation, messages, closed))
}

async fn run_pump(
    inner: Weak<ChatInner>,
    chat_id: i64,
    generation: u64,
    mut messages: Option<TopicStream>,
    mut closed: Option<TopicStream>,
) {
    let Some(mut states) = inner.upgrade().map(|i| i.registry.connection().watch_state()) else {
        return;
    };
    let connected = *states.borrow_and_update() == ConnectionState::Connected;
    if connected && let Some(inner) = inner.upgrade() {
        resubscribe(&inner.registry, &chat_topic(chat_id), &mut messages);
        resubscribe(&inner.registry, &chat_closed_topic(chat_id), &mut closed);
    }

    loop {
        tokio::select! {
            event = next_event(&mut messages) => {
                let Some(inner) = inner.upgrade() else { return };
                match event {
                    Some(event) => inner.apply_live(generation, event),
                    None => messages = None,
                }
            }
            event = next_event(&mut closed) => {
                let Some(inner) = inner.upgrade() else { return };
                match event {
                    Some(_) => {
                        inner.replace_closed(chat_id, generation).await;
                        return;
                    }
                    None => closed = None,
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    return;
                }
                let connected = *states.borrow_and_update() == ConnectionState::Connected;
                let Some(inner) = inner.upgrade() else { return };
                if connected && inner.lock().generation == generation {
                    resubscribe(&inner.registry, &chat_topic(chat_id), &mut messages);
                    resubscribe(&inner.registry, &chat_closed_topic(chat_id), &mut closed);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
