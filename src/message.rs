//! Normalized chat messages and the per-conversation message log.
//!
//! Messages arrive from two places, REST history and live topic events, and
//! can overlap: the same message may be in the history page and also be
//! pushed live, or be pushed twice around a reconnect. [`MessageLog`] keeps
//! receipt order and drops repeats.

use std::time::SystemTime;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Text appended when a closed chat is replaced by a fresh one.
pub const CHAT_REPLACED_NOTICE: &str = "Support closed the previous chat. This is a new conversation.";

/// Who wrote a message. Resolved once when the message enters the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderRole {
    Client,
    Support,
    System,
    /// No role was delivered, or it was not one we know.
    Unknown,
}

impl SenderRole {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let upper = raw.trim().to_ascii_uppercase();
        match upper.strip_prefix("ROLE_").unwrap_or(upper.as_str()) {
            "CLIENT" => Self::Client,
            "SUPPORT" => Self::Support,
            "SYSTEM" => Self::System,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Message {
    /// Server id. Locally synthesized notices get a timestamp-based id.
    pub id: Option<i64>,
    pub content: String,
    /// ISO-8601 timestamp exactly as delivered.
    pub timestamp: String,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub role: SenderRole,
}

impl Message {
    /// A locally generated notice.
    #[must_use]
    pub fn system(id: i64, content: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            content: content.into(),
            timestamp: now_rfc3339(),
            sender_email: Some("system".to_owned()),
            sender_name: Some("System".to_owned()),
            role: SenderRole::System,
        }
    }

    /// Same message, by id when both sides have one, else by content and timestamp.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => self.content == other.content && self.timestamp == other.timestamp,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    last_local_id: i64,
}

impl MessageLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with a fetched history page, dropping repeats within it.
    pub fn seed(&mut self, history: Vec<Message>) {
        self.messages.clear();
        for message in history {
            self.push(message);
        }
    }

    /// Append unless an equal message is already present. Returns whether it was added.
    pub fn push(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|existing| existing.is_same(&message)) {
            tracing::debug!(id = ?message.id, "duplicate message ignored");
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Append a synthesized SYSTEM message with a fresh local id.
    pub fn push_system(&mut self, content: impl Into<String>) -> &Message {
        let id = now_millis().max(self.last_local_id + 1);
        self.last_local_id = id;
        self.messages.push(Message::system(id, content));
        &self.messages[self.messages.len() - 1]
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| i64::try_from(elapsed.as_millis()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
