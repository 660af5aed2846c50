//! Topic subscription registry.
//!
//! DESIGN
//! ======
//! Each topic has one entry: the list of listener channels plus the
//! transport subscription feeding them. Repeated `subscribe` calls add a
//! listener to the same entry and never create a second transport
//! subscription. Listener channels are unbounded, so a slow listener sees
//! every event of its topic in receipt order.
//!
//! A reconnect drops every transport subscription (the connection epoch
//! advances). The entry and its sender survive, so the next `subscribe` for
//! the topic registers a fresh transport handler that keeps feeding the
//! listeners already attached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::Frame;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::connection::{ConnectionError, ConnectionManager, FrameHandler, Subscription};

/// Queue-wide topic announcing changes to the unassigned list.
pub const UNASSIGNED_TOPIC: &str = "/topic/support/unassigned";

#[must_use]
pub fn chat_topic(chat_id: i64) -> String {
    format!("/topic/chats/{chat_id}")
}

#[must_use]
pub fn chat_closed_topic(chat_id: i64) -> String {
    format!("/topic/chats/{chat_id}/closed")
}

#[must_use]
pub fn chat_send_destination(chat_id: i64) -> String {
    format!("/app/chats/{chat_id}/send")
}

/// Payload of one MESSAGE frame on a topic.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    Json(Value),
    /// Body that is not JSON.
    Text(String),
}

impl TopicEvent {
    /// Decode a frame body as JSON, keeping it as raw text when that fails.
    #[must_use]
    pub fn from_body(body: &str) -> Self {
        serde_json::from_str(body).map_or_else(|_| Self::Text(body.to_owned()), Self::Json)
    }
}

/// Listener end of a topic.
pub struct TopicStream {
    topic: String,
    rx: mpsc::UnboundedReceiver<TopicEvent>,
}

impl TopicStream {
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the topic was unsubscribed or discarded.
    pub async fn recv(&mut self) -> Option<TopicEvent> {
        self.rx.recv().await
    }
}

type Listeners = Arc<Mutex<Vec<mpsc::UnboundedSender<TopicEvent>>>>;

fn lock_listeners(listeners: &Listeners) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<TopicEvent>>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TopicEntry {
    listeners: Listeners,
    registration: Option<Subscription>,
}

impl TopicEntry {
    fn new(registration: Subscription, listeners: Listeners) -> Self {
        Self { listeners, registration: Some(registration) }
    }

    fn stream(&self, topic: &str) -> TopicStream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_listeners(&self.listeners).push(tx);
        TopicStream { topic: topic.to_owned(), rx }
    }

    /// Drop every listener channel, ending their streams.
    fn close(&self) {
        lock_listeners(&self.listeners).clear();
    }
}

/// Topic-keyed fan-out over the single connection. Cheap to clone.
#[derive(Clone)]
pub struct TopicRegistry {
    connection: ConnectionManager,
    topics: Arc<Mutex<HashMap<String, TopicEntry>>>,
}

impl TopicRegistry {
    #[must_use]
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection, topics: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicEntry>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect().await
    }

    /// Best-effort connect that gives up waiting after `wait`. The attempt
    /// keeps running in the background. Returns whether the session is up.
    pub async fn connect_within(&self, wait: Duration) -> bool {
        match tokio::time::timeout(wait, self.connection.connect()).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "websocket connect failed; continuing without live updates");
                false
            }
            Err(_) => {
                tracing::warn!(?wait, "websocket not connected yet; continuing");
                false
            }
        }
    }

    /// Disconnect and discard every topic stream.
    pub fn disconnect(&self) {
        self.connection.disconnect();
        for (_, entry) in self.lock().drain() {
            entry.close();
        }
    }

    /// Listen on `topic`, registering with the broker on first interest.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] when the topic needs a
    /// transport registration and no session is established.
    pub fn subscribe(&self, topic: &str) -> Result<TopicStream, ConnectionError> {
        let mut topics = self.lock();
        let epoch = self.connection.epoch();

        if let Some(entry) = topics.get_mut(topic) {
            let live = entry.registration.as_ref().is_some_and(|r| r.epoch == epoch);
            if !live {
                let registration = self.connection.subscribe(topic, topic_handler(entry.listeners.clone()))?;
                tracing::info!(topic, subscription = %registration.id, "re-registered topic after reconnect");
                entry.registration = Some(registration);
            }
            return Ok(entry.stream(topic));
        }

        let listeners = Listeners::default();
        let registration = self.connection.subscribe(topic, topic_handler(listeners.clone()))?;
        tracing::info!(topic, subscription = %registration.id, "subscribed to topic");
        let entry = TopicEntry::new(registration, listeners);
        let stream = entry.stream(topic);
        topics.insert(topic.to_owned(), entry);
        Ok(stream)
    }

    /// Detach the transport handler and discard the topic's stream.
    pub fn unsubscribe(&self, topic: &str) {
        let Some(entry) = self.lock().remove(topic) else {
            return;
        };
        entry.close();
        if let Some(registration) = entry.registration {
            self.connection.unsubscribe(&registration.id);
        }
        tracing::debug!(topic, "unsubscribed from topic");
    }

    /// Whether the registry holds a stream for `topic`.
    #[must_use]
    pub fn has_topic(&self, topic: &str) -> bool {
        self.lock().contains_key(topic)
    }

    /// Publish a JSON body to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless a session is established.
    pub fn send(&self, destination: &str, body: &Value) -> Result<(), ConnectionError> {
        self.connection.send(Frame::send_json(destination, body.to_string()))
    }

    /// Post a chat message to `/app/chats/{id}/send`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless a session is established.
    pub fn send_chat_message(&self, chat_id: i64, content: &str) -> Result<(), ConnectionError> {
        self.send(&chat_send_destination(chat_id), &serde_json::json!({ "content": content }))
    }
}

pub(crate) fn subscribe_logged(registry: &TopicRegistry, topic: &str) -> Option<TopicStream> {
    match registry.subscribe(topic) {
        Ok(stream) => Some(stream),
        Err(error) => {
            tracing::warn!(topic, error = %error, "subscribe failed; will retry when connected");
            None
        }
    }
}

/// Re-attach missing or stale topic registrations after the connection comes up.
pub(crate) fn resubscribe(registry: &TopicRegistry, topic: &str, slot: &mut Option<TopicStream>) {
    match registry.subscribe(topic) {
        Ok(stream) => {
            if slot.is_none() {
                *slot = Some(stream);
            }
        }
        Err(error) => tracing::debug!(topic, error = %error, "resubscribe failed"),
    }
}

/// Next event of an optional stream. Pending forever when there is no stream.
pub(crate) async fn next_event(stream: &mut Option<TopicStream>) -> Option<TopicEvent> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

fn topic_handler(listeners: Listeners) -> FrameHandler {
    Arc::new(move |frame: &Frame| {
        let event = TopicEvent::from_body(&frame.body);
        // Listeners whose stream was dropped fall out here.
        lock_listeners(&listeners).retain(|tx| tx.send(event.clone()).is_ok());
    })
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
