//! Support-agent queue coordinator.
//!
//! DESIGN
//! ======
//! The agent sees two server-owned lists: unassigned chats and chats
//! assigned to them. Lists are refreshed after every action, on every event
//! of the queue-wide topic and by a fixed-interval sweep that covers missed
//! pushes. Each refresh fetches both lists independently and tags the
//! results with a sequence number, so a slow fetch never overwrites a newer
//! one and one failing list never hides the other.
//!
//! One chat can be selected at a time. Selecting drops the previous chat's
//! topic before subscribing to the new one.
//!
//! Assign and close can answer with an error after the change was already
//! committed. Both actions therefore re-read the lists and decide the
//! outcome from server state; that check lives in [`verify_assign`] and
//! [`verify_close`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api::{ApiError, ChatApi, ChatSummary, LiveEvent, classify_event};
use crate::chat::ChatError;
use crate::connection::ConnectionState;
use crate::message::{Message, MessageLog};
use crate::notice::NoticeBoard;
use crate::registry::{
    TopicEvent, TopicRegistry, TopicStream, UNASSIGNED_TOPIC, chat_topic, next_event, resubscribe, subscribe_logged,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueueTab {
    #[default]
    Unassigned,
    Mine,
}

/// Observable state of a [`SupportQueueCoordinator`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub tab: QueueTab,
    /// Unassigned chats that already have a message.
    pub unassigned: Vec<ChatSummary>,
    /// Chats assigned to the agent, open ones first.
    pub mine: Vec<ChatSummary>,
    pub selected: Option<ChatSummary>,
    /// Messages of the selected chat.
    pub messages: Vec<Message>,
}

/// Outcome of one [`SupportQueueCoordinator::refresh_lists`] call, per list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub unassigned: Result<(), ApiError>,
    pub mine: Result<(), ApiError>,
}

#[derive(Default)]
struct QueueState {
    tab: QueueTab,
    unassigned: Vec<ChatSummary>,
    mine: Vec<ChatSummary>,
    selected: Option<ChatSummary>,
    log: MessageLog,
    selection: u64,
    refresh_seq: u64,
    unassigned_seq: u64,
    mine_seq: u64,
}

#[derive(Default)]
struct Tasks {
    background: Vec<JoinHandle<()>>,
    selection: Option<JoinHandle<()>>,
}

struct QueueInner {
    registry: TopicRegistry,
    api: Arc<dyn ChatApi>,
    connect_wait: Duration,
    refresh_interval: Duration,
    notices: NoticeBoard,
    state: Mutex<QueueState>,
    snapshot: watch::Sender<QueueSnapshot>,
    tasks: Mutex<Tasks>,
}

/// Drives the support console. Cheap to clone.
#[derive(Clone)]
pub struct SupportQueueCoordinator {
    inner: Arc<QueueInner>,
}

impl SupportQueueCoordinator {
    #[must_use]
    pub fn new(
        registry: TopicRegistry,
        api: Arc<dyn ChatApi>,
        connect_wait: Duration,
        refresh_interval: Duration,
        notices: NoticeBoard,
    ) -> Self {
        let (snapshot, _) = watch::channel(QueueSnapshot::default());
        Self {
            inner: Arc::new(QueueInner {
                registry,
                api,
                connect_wait,
                refresh_interval,
                notices,
                state: Mutex::new(QueueState::default()),
                snapshot,
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Connect best-effort, load both lists and start listening for queue
    /// changes. Calling it again restarts the background tasks.
    pub async fn init(&self) -> RefreshReport {
        self.inner.stop_background();
        self.inner.registry.connect_within(self.inner.connect_wait).await;
        let report = self.inner.refresh().await;

        let stream = subscribe_logged(&self.inner.registry, UNASSIGNED_TOPIC);
        let mut background = vec![tokio::spawn(run_queue_pump(Arc::downgrade(&self.inner), stream))];
        if !self.inner.refresh_interval.is_zero() {
            background.push(tokio::spawn(run_sweep(Arc::downgrade(&self.inner), self.inner.refresh_interval)));
        }
        self.inner.tasks().background = background;
        tracing::info!(interval = ?self.inner.refresh_interval, "support queue started");
        report
    }

    /// Fetch both lists. A failure of one list leaves the other applied.
    pub async fn refresh_lists(&self) -> RefreshReport {
        self.inner.refresh().await
    }

    pub fn set_tab(&self, tab: QueueTab) {
        let mut state = self.inner.lock();
        state.tab = tab;
        self.inner.publish(&state);
    }

    /// Show `chat_id`: load its history and follow its live topic.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] if the history cannot be loaded and
    /// [`ChatError::Superseded`] if another chat was selected meanwhile.
    pub async fn select(&self, chat_id: i64) -> Result<(), ChatError> {
        let (generation, previous) = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            state.selection += 1;
            let previous = state.selected.as_ref().map(|s| s.id).filter(|id| *id != chat_id);
            let summary = state
                .mine
                .iter()
                .chain(state.unassigned.iter())
                .find(|c| c.id == chat_id)
                .cloned()
                .unwrap_or_else(|| ChatSummary { id: chat_id, ..ChatSummary::default() });
            state.selected = Some(summary);
            state.log.clear();
            self.inner.publish(state);
            (state.selection, previous)
        };
        self.inner.stop_selection();
        if let Some(previous) = previous {
            self.inner.registry.unsubscribe(&chat_topic(previous));
        }

        let history = self.inner.api.support_messages(chat_id).await?;

        // Held until the pump is stored, so a newer selection either sees
        // this pump and aborts it or makes this one bail before subscribing.
        let mut tasks = self.inner.tasks();
        {
            let mut state = self.inner.lock();
            if state.selection != generation {
                return Err(ChatError::Superseded);
            }
            state.log.seed(history);
            self.inner.publish(&state);
        }

        let stream = subscribe_logged(&self.inner.registry, &chat_topic(chat_id));
        let pump = tokio::spawn(run_selection_pump(Arc::downgrade(&self.inner), chat_id, generation, stream));
        if let Some(stale) = tasks.selection.replace(pump) {
            stale.abort();
        }
        tracing::debug!(chat_id, "chat selected");
        Ok(())
    }

    /// Post `content` into the selected chat.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::EmptyMessage`] for blank input,
    /// [`ChatError::NoSelection`] without a selected chat, and
    /// [`ChatError::Connection`] when the transport is not connected.
    pub fn send(&self, content: &str) -> Result<(), ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let chat_id = self.inner.lock().selected.as_ref().map(|s| s.id).ok_or(ChatError::NoSelection)?;
        self.inner.registry.send_chat_message(chat_id, content)?;
        Ok(())
    }

    /// Take `chat_id` from the unassigned queue.
    ///
    /// On success the Mine tab opens with the chat selected.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] with the assign failure when the chat is
    /// not assigned to the agent afterwards. A confirmed assignment whose
    /// history then fails to load still succeeds.
    pub async fn assign(&self, chat_id: i64) -> Result<(), ChatError> {
        let result = self.inner.api.assign(chat_id).await;
        self.inner.refresh().await;
        let assigned = self.inner.lock().mine.iter().any(|c| c.id == chat_id);

        match verify_assign(chat_id, result, assigned) {
            Ok(()) => {
                tracing::info!(chat_id, "chat assigned");
                self.inner.notices.success(format!("Chat #{chat_id} assigned to you"));
                self.set_tab(QueueTab::Mine);
                if let Err(error) = self.select(chat_id).await {
                    tracing::warn!(chat_id, error = %error, "assigned chat could not be opened");
                }
                Ok(())
            }
            Err(error) => {
                tracing::warn!(chat_id, error = %error, "assign failed");
                self.inner.notices.error(assign_failure_text(chat_id, error.status()));
                Err(error.into())
            }
        }
    }

    /// Close `chat_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] with the close failure when the chat is
    /// still open afterwards.
    pub async fn close(&self, chat_id: i64) -> Result<(), ChatError> {
        let result = self.inner.api.close(chat_id).await;
        self.inner.refresh().await;
        let closed = {
            let state = self.inner.lock();
            state.mine.iter().chain(state.unassigned.iter()).any(|c| c.id == chat_id && c.closed)
        };

        match verify_close(chat_id, result, closed) {
            Ok(()) => {
                tracing::info!(chat_id, "chat closed");
                self.inner.mark_closed(chat_id);
                self.inner.notices.success(format!("Chat #{chat_id} closed"));
                Ok(())
            }
            Err(error) => {
                tracing::warn!(chat_id, error = %error, "close failed");
                self.inner.notices.error(close_failure_text(chat_id, error.status()));
                Err(error.into())
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<QueueSnapshot> {
        self.inner.snapshot.subscribe()
    }

    #[must_use]
    pub fn notices(&self) -> &NoticeBoard {
        &self.inner.notices
    }

    /// Stop the sweep and pumps and drop the coordinator's topics.
    pub fn shutdown(&self) {
        let selected = {
            let mut state = self.inner.lock();
            state.selection += 1;
            state.selected.as_ref().map(|s| s.id)
        };
        self.inner.stop_background();
        self.inner.stop_selection();
        self.inner.registry.unsubscribe(UNASSIGNED_TOPIC);
        if let Some(chat_id) = selected {
            self.inner.registry.unsubscribe(&chat_topic(chat_id));
        }
        tracing::debug!("support queue shut down");
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &QueueState) {
        self.snapshot.send_replace(QueueSnapshot {
            tab: state.tab,
            unassigned: state.unassigned.clone(),
            mine: state.mine.clone(),
            selected: state.selected.clone(),
            messages: state.log.to_vec(),
        });
    }

    fn stop_background(&self) {
        for handle in std::mem::take(&mut self.tasks().background) {
            handle.abort();
        }
    }

    fn stop_selection(&self) {
        if let Some(handle) = self.tasks().selection.take() {
            handle.abort();
        }
    }

    async fn refresh(&self) -> RefreshReport {
        let seq = {
            let mut state = self.lock();
            state.refresh_seq += 1;
            state.refresh_seq
        };
        let (unassigned, mine) = tokio::join!(self.api.list_unassigned(), self.api.list_mine());

        let mut guard = self.lock();
        let state = &mut *guard;
        let unassigned = unassigned.map(|list| {
            if seq > state.unassigned_seq {
                state.unassigned = visible_unassigned(list);
                state.unassigned_seq = seq;
            }
        });
        let mine = mine.map(|list| {
            if seq > state.mine_seq {
                state.mine = sort_mine(list);
                state.mine_seq = seq;
            }
        });
        if let Err(error) = &unassigned {
            tracing::warn!(error = %error, "failed to load unassigned chats");
        }
        if let Err(error) = &mine {
            tracing::warn!(error = %error, "failed to load assigned chats");
        }

        if let Some(selected) = state.selected.as_mut()
            && let Some(fresh) = state.mine.iter().chain(state.unassigned.iter()).find(|c| c.id == selected.id)
        {
            *selected = fresh.clone();
        }
        self.publish(state);
        RefreshReport { unassigned, mine }
    }

    fn mark_closed(&self, chat_id: i64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        for chat in state.mine.iter_mut().chain(state.unassigned.iter_mut()).chain(state.selected.iter_mut()) {
            if chat.id == chat_id {
                chat.closed = true;
            }
        }
        state.mine = sort_mine(std::mem::take(&mut state.mine));
        self.publish(state);
    }

    fn apply_live(&self, generation: u64, event: TopicEvent) {
        let mut state = self.lock();
        if state.selection != generation {
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
}

/// Unassigned chats without a first message are not worth showing yet.
fn visible_unassigned(list: Vec<ChatSummary>) -> Vec<ChatSummary> {
    list.into_iter().filter(ChatSummary::has_last_message).collect()
}

/// Open chats first; order within each group is kept.
fn sort_mine(mut list: Vec<ChatSummary>) -> Vec<ChatSummary> {
    list.sort_by_key(|c| c.closed);
    list
}

/// An assign that errored still counts when the chat ended up assigned.
fn verify_assign(chat_id: i64, result: Result<(), ApiError>, assigned: bool) -> Result<(), ApiError> {
    match result {
        Err(error) if assigned => {
            tracing::info!(chat_id, error = %error, "assign reported an error but the chat is assigned");
            Ok(())
        }
        other => other,
    }
}

/// A close that errored still counts when the chat was already closed.
fn verify_close(chat_id: i64, result: Result<(), ApiError>, closed: bool) -> Result<(), ApiError> {
    match result {
        Err(error) if closed || matches!(error.status(), Some(400 | 409)) => {
            tracing::info!(chat_id, error = %error, "close reported an error but the chat is closed");
            Ok(())
        }
        other => other,
    }
}

#[must_use]
pub fn assign_failure_text(chat_id: i64, status: Option<u16>) -> String {
    match status {
        Some(409) => format!("Chat #{chat_id} is already assigned to another agent"),
        Some(404) => format!("Chat #{chat_id} was not found"),
        _ => format!("Could not assign chat #{chat_id}"),
    }
}

#[must_use]
pub fn close_failure_text(chat_id: i64, status: Option<u16>) -> String {
    match status {
        Some(403) => format!("Chat #{chat_id} is not assigned to you"),
        Some(404) => format!("Chat #{chat_id} was not found"),
        _ => format!("Could not close chat #{chat_id}"),
    }
}

// =============================================================================
// BACKGROUND TASKS
// =============================================================================

async fn run_queue_pump(inner: Weak<QueueInner>, mut stream: Option<TopicStream>) {
    let Some(mut states) = inner.upgrade().map(|i| i.registry.connection().watch_state()) else {
        return;
    };
    let connected = *states.borrow_and_update() == ConnectionState::Connected;
    if connected && let Some(inner) = inner.upgrade() {
        resubscribe(&inner.registry, UNASSIGNED_TOPIC, &mut stream);
    }

    loop {
        tokio::select! {
            event = next_event(&mut stream) => {
                let Some(inner) = inner.upgrade() else { return };
                match event {
                    Some(_) => {
                        tracing::debug!("queue changed; refreshing");
                        inner.refresh().await;
                    }
                    None => stream = None,
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    return;
                }
                let connected = *states.borrow_and_update() == ConnectionState::Connected;
                let Some(inner) = inner.upgrade() else { return };
                if connected {
                    resubscribe(&inner.registry, UNASSIGNED_TOPIC, &mut stream);
                    inner.refresh().await;
                }
            }
        }
    }
}

async fn run_sweep(inner: Weak<QueueInner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        inner.refresh().await;
    }
}

async fn run_selection_pump(inner: Weak<QueueInner>, chat_id: i64, generation: u64, mut stream: Option<TopicStream>) {
    let Some(mut states) = inner.upgrade().map(|i| i.registry.connection().watch_state()) else {
        return;
    };
    let connected = *states.borrow_and_update() == ConnectionState::Connected;
    if connected && let Some(inner) = inner.upgrade() {
        resubscribe(&inner.registry, &chat_topic(chat_id), &mut stream);
    }

    loop {
        tokio::select! {
            event = next_event(&mut stream) => {
                let Some(inner) = inner.upgrade() else { return };
                match event {
                    Some(event) => inner.apply_live(generation, event),
                    None => stream = None,
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    return;
                }
                let connected = *states.borrow_and_update() == ConnectionState::Connected;
                let Some(inner) = inner.upgrade() else { return };
                if connected && inner.lock().selection == generation {
                    resubscribe(&inner.registry, &chat_topic(chat_id), &mut stream);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "support_test.rs"]
mod tests;
