//! Chat REST adapter and wire normalization.
//!
//! DESIGN
//! ======
//! [`ChatApi`] is the seam the controllers call; [`HttpChatApi`] is the
//! `reqwest` implementation. Wire DTOs stay private to this module: the
//! backend reports the sender role in one of three fields depending on the
//! endpoint, and that is resolved here into a single [`SenderRole`] so no
//! consumer has to guess.
//!
//! ERROR HANDLING
//! ==============
//! Non-2xx responses become [`ApiError::Status`] carrying the status code,
//! so the queue coordinator can classify 400/403/404/409. A 401/403 on a
//! regular endpoint also invalidates the session (see [`crate::session`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::HttpTimeouts;
use crate::message::{Message, SenderRole};
use crate::registry::TopicEvent;
use crate::session::{TokenProvider, invalidates_session, should_attach_token};

/// Error returned by [`ChatApi`] calls.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ApiError {
    /// The request could not be sent or the response body could not be read.
    #[error("request failed: {0}")]
    Request(String),
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The response body was not the expected JSON.
    #[error("invalid response body: {0}")]
    Decode(String),
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

impl ApiError {
    /// HTTP status of the failure, when the server answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Summary of one support chat as listed by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: i64,
    #[serde(default)]
    pub client_email: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub support_email: Option<String>,
    #[serde(default)]
    pub support_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub closed: bool,
}

impl ChatSummary {
    /// Client name, else client email, else the chat number.
    #[must_use]
    pub fn client_label(&self) -> String {
        self.client_name
            .as_deref()
            .or(self.client_email.as_deref())
            .filter(|label| !label.trim().is_empty())
            .map_or_else(|| format!("chat #{}", self.id), str::to_owned)
    }

    /// Whether the chat has any content to show in the unassigned queue.
    #[must_use]
    pub fn has_last_message(&self) -> bool {
        self.last_message.as_deref().is_some_and(|m| !m.trim().is_empty())
    }
}

/// Chat endpoints used by the client chat and the support console.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `GET /client/chats`
    async fn list_my_chats(&self) -> Result<Vec<ChatSummary>, ApiError>;
    /// `POST /client/chats/start`
    async fn start_chat(&self) -> Result<ChatSummary, ApiError>;
    /// `GET /client/chats/{id}/messages`
    async fn client_messages(&self, chat_id: i64) -> Result<Vec<Message>, ApiError>;
    /// `GET /support/chats/unassigned`
    async fn list_unassigned(&self) -> Result<Vec<ChatSummary>, ApiError>;
    /// `GET /support/chats`
    async fn list_mine(&self) -> Result<Vec<ChatSummary>, ApiError>;
    /// `PUT /support/chats/{id}/assign`
    async fn assign(&self, chat_id: i64) -> Result<(), ApiError>;
    /// `PUT /support/chats/{id}/close`
    async fn close(&self, chat_id: i64) -> Result<(), ApiError>;
    /// `GET /support/chats/{id}/messages`
    async fn support_messages(&self, chat_id: i64) -> Result<Vec<Message>, ApiError>;
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpChatApi {
    /// # Errors
    ///
    /// Returns [`ApiError::ClientBuild`] if the TLS backend cannot be initialized.
    pub fn new(base_url: &str, tokens: Arc<dyn TokenProvider>, timeouts: HttpTimeouts) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.request_secs))
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()
            .map_err(|e| ApiError::ClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_owned(), tokens })
    }

    async fn fetch_text(&self, method: reqwest::Method, path: &str) -> Result<String, ApiError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.request(method.clone(), url);
        if should_attach_token(path) {
            if let Some(token) = self.tokens.token() {
                request = request.bearer_auth(token);
            }
        }
        if method != reqwest::Method::GET {
            request = request.json(&serde_json::json!({}));
        }

        let response = request.send().await.map_err(|e| ApiError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| ApiError::Request(e.to_string()))?;

        if !(200..300).contains(&status) {
            if invalidates_session(path, status) {
                self.tokens.invalidate();
            }
            tracing::debug!(%method, path, status, "chat api request failed");
            return Err(ApiError::Status { status, body: text });
        }
        Ok(text)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let text = self.fetch_text(reqwest::Method::GET, path).await?;
        parse_json(&text)
    }

    async fn get_messages(&self, path: &str) -> Result<Vec<Message>, ApiError> {
        let text = self.fetch_text(reqwest::Method::GET, path).await?;
        parse_messages(&text)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_my_chats(&self) -> Result<Vec<ChatSummary>, ApiError> {
        self.get_json("/client/chats").await
    }

    async fn start_chat(&self) -> Result<ChatSummary, ApiError> {
        let text = self.fetch_text(reqwest::Method::POST, "/client/chats/start").await?;
        parse_json(&text)
    }

    async fn client_messages(&self, chat_id: i64) -> Result<Vec<Message>, ApiError> {
        self.get_messages(&format!("/client/chats/{chat_id}/messages")).await
    }

    async fn list_unassigned(&self) -> Result<Vec<ChatSummary>, ApiError> {
        self.get_json("/support/chats/unassigned").await
    }

    async fn list_mine(&self) -> Result<Vec<ChatSummary>, ApiError> {
        self.get_json("/support/chats").await
    }

    async fn assign(&self, chat_id: i64) -> Result<(), ApiError> {
        self.fetch_text(reqwest::Method::PUT, &format!("/support/chats/{chat_id}/assign"))
            .await
            .map(drop)
    }

    async fn close(&self, chat_id: i64) -> Result<(), ApiError> {
        self.fetch_text(reqwest::Method::PUT, &format!("/support/chats/{chat_id}/close"))
            .await
            .map(drop)
    }

    async fn support_messages(&self, chat_id: i64) -> Result<Vec<Message>, ApiError> {
        self.get_messages(&format!("/support/chats/{chat_id}/messages")).await
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    id: Option<i64>,
    content: String,
    #[serde(default)]
    date: Option<String>,
    /// Older payloads nest `{email, role}` here; its shape is not guaranteed.
    #[serde(default)]
    sender: Option<Value>,
    #[serde(default)]
    sender_type: Option<String>,
    #[serde(default)]
    sender_role: Option<String>,
    #[serde(default)]
    sender_email: Option<String>,
    #[serde(default)]
    sender_name: Option<String>,
}

impl WireMessage {
    fn nested(&self, field: &str) -> Option<String> {
        self.sender
            .as_ref()
            .and_then(|sender| sender.get(field))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    fn into_message(self) -> Message {
        let role = [self.sender_type.clone(), self.sender_role.clone(), self.nested("role")]
            .into_iter()
            .flatten()
            .find(|raw| !raw.trim().is_empty())
            .map_or(SenderRole::Unknown, |raw| SenderRole::parse(&raw));
        let sender_email = self.sender_email.clone().or_else(|| self.nested("email"));
        let sender_name = self.sender_name.clone().or_else(|| self.nested("name"));

        Message {
            id: self.id,
            content: self.content,
            timestamp: self.date.unwrap_or_default(),
            sender_email,
            sender_name,
            role,
        }
    }
}

// =============================================================================
// PARSING
// =============================================================================

fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, ApiError> {
    serde_json::from_str(text).map_err(|e| ApiError::Decode(e.to_string()))
}

fn parse_messages(text: &str) -> Result<Vec<Message>, ApiError> {
    let wire: Vec<WireMessage> = parse_json(text)?;
    Ok(wire.into_iter().map(WireMessage::into_message).collect())
}

/// What a live event on a chat topic turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// A chat message in the backend's message shape.
    Message(Message),
    /// Anything else; shown to the user as a SYSTEM notice.
    Notice(String),
}

/// Normalize a chat-topic event the same way as REST history.
#[must_use]
pub fn classify_event(event: TopicEvent) -> LiveEvent {
    match event {
        TopicEvent::Text(text) => LiveEvent::Notice(text),
        TopicEvent::Json(Value::String(text)) => LiveEvent::Notice(text),
        TopicEvent::Json(value) => match serde_json::from_value::<WireMessage>(value.clone()) {
            Ok(wire) => LiveEvent::Message(wire.into_message()),
            Err(_) => LiveEvent::Notice(value.to_string()),
        },
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
