//! Per-user-session composition root.
//!
//! A [`SupportDesk`] owns the one transport, connection and topic registry
//! of a signed-in user and hands out controllers that share them.
//! `dispose()` ends the user session: controllers stop and every
//! subscription is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::api::{ApiError, ChatApi, HttpChatApi};
use crate::chat::ChatSessionController;
use crate::config::{ConfigError, SupportDeskConfig};
use crate::connection::{ConnectionManager, Transport, WebSocketTransport};
use crate::notice::NoticeBoard;
use crate::registry::TopicRegistry;
use crate::session::TokenProvider;
use crate::support::SupportQueueCoordinator;

#[derive(Debug, thiserror::Error)]
pub enum DeskError {
    /// The configured URLs cannot be used.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The HTTP client could not be built.
    #[error(transparent)]
    Api(#[from] ApiError),
}

enum Controller {
    Chat(ChatSessionController),
    Queue(SupportQueueCoordinator),
}

pub struct SupportDesk {
    config: SupportDeskConfig,
    registry: TopicRegistry,
    api: Arc<dyn ChatApi>,
    notices: NoticeBoard,
    controllers: Mutex<Vec<Controller>>,
}

impl SupportDesk {
    /// Wire the production WebSocket transport and HTTP API for `session`.
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::Config`] when the base URL cannot be turned into
    /// a WebSocket URL and [`DeskError::Api`] when the HTTP client fails to build.
    pub fn new(config: SupportDeskConfig, session: Arc<dyn TokenProvider>) -> Result<Self, DeskError> {
        let api = HttpChatApi::new(&config.base_url, session.clone(), config.timeouts)?;
        Self::with_parts(config, session, Arc::new(WebSocketTransport), Arc::new(api))
    }

    /// Build over caller-supplied transport and API implementations.
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::Config`] when the base URL cannot be turned into
    /// a WebSocket URL.
    pub fn with_parts(
        config: SupportDeskConfig,
        session: Arc<dyn TokenProvider>,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
    ) -> Result<Self, DeskError> {
        let url = config.ws_url()?;
        tracing::debug!(base_url = %config.base_url, ws_url = %url, "support desk configured");
        let connection = ConnectionManager::new(url, transport, session, config.connection);
        Ok(Self {
            notices: NoticeBoard::new(config.notices),
            registry: TopicRegistry::new(connection),
            api,
            config,
            controllers: Mutex::new(Vec::new()),
        })
    }

    fn controllers(&self) -> MutexGuard<'_, Vec<Controller>> {
        self.controllers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Controller for the signed-in client's chat. Call `init()` on it to start.
    #[must_use]
    pub fn client_chat(&self) -> ChatSessionController {
        let chat = ChatSessionController::new(self.registry.clone(), self.api.clone(), self.config.connect_wait);
        self.controllers().push(Controller::Chat(chat.clone()));
        chat
    }

    /// Coordinator for the support console. Call `init()` on it to start.
    #[must_use]
    pub fn support_queue(&self) -> SupportQueueCoordinator {
        let queue = SupportQueueCoordinator::new(
            self.registry.clone(),
            self.api.clone(),
            self.config.connect_wait,
            self.config.refresh_interval,
            self.notices.clone(),
        );
        self.controllers().push(Controller::Queue(queue.clone()));
        queue
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        self.registry.connection()
    }

    #[must_use]
    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    #[must_use]
    pub fn api(&self) -> Arc<dyn ChatApi> {
        self.api.clone()
    }

    #[must_use]
    pub fn notices(&self) -> &NoticeBoard {
        &self.notices
    }

    #[must_use]
    pub fn config(&self) -> &SupportDeskConfig {
        &self.config
    }

    /// Stop every controller, disconnect and discard all subscriptions.
    pub fn dispose(&self) {
        for controller in std::mem::take(&mut *self.controllers()) {
            match controller {
                Controller::Chat(chat) => chat.shutdown(),
                Controller::Queue(queue) => queue.shutdown(),
            }
        }
        self.registry.disconnect();
        tracing::info!("support desk disposed");
    }
}

#[cfg(test)]
#[path = "context_test.rs"]
mod tests;
