//! Client library for the banking app's real-time support chat.
//!
//! One [`SupportDesk`] per signed-in user owns a STOMP-over-WebSocket
//! connection and the REST adapter. Clients get a [`ChatSessionController`]
//! for their single open chat; support agents get a
//! [`SupportQueueCoordinator`] over the unassigned and assigned queues.
//! State is observed through `tokio::sync::watch` snapshots.

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod context;
pub mod message;
pub mod notice;
pub mod registry;
pub mod session;
pub mod support;

#[cfg(test)]
mod testing;

pub use api::{ApiError, ChatApi, ChatSummary, HttpChatApi};
pub use chat::{ChatError, ChatPhase, ChatSessionController, ChatSnapshot};
pub use config::{ConfigError, SupportDeskConfig};
pub use connection::{ConnectionError, ConnectionManager, ConnectionState};
pub use context::{DeskError, SupportDesk};
pub use message::{Message, SenderRole};
pub use notice::{Notice, NoticeBoard, NoticeKind};
pub use registry::{TopicEvent, TopicRegistry};
pub use session::{CurrentUser, SessionContext, TokenProvider, UserRole};
pub use support::{QueueSnapshot, QueueTab, RefreshReport, SupportQueueCoordinator};
