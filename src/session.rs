//! Session context and bearer-token policy.
//!
//! DESIGN
//! ======
//! There is no ambient session. A [`SessionContext`] is created explicitly,
//! filled in after login, and injected as `Arc<dyn TokenProvider>` into the
//! REST adapter and the connection manager. Both read the token at the point
//! of use; the connection manager reads it once per `connect()`.
//!
//! Which requests carry the token, and which failures clear the session, are
//! decided by the two pure helpers at the bottom of this module.

use std::sync::{Mutex, PoisonError};

/// Source of the bearer token for REST calls and the STOMP handshake.
pub trait TokenProvider: Send + Sync {
    /// Current token, if signed in.
    fn token(&self) -> Option<String>;

    fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    /// Drop the stored token and user so the caller has to sign in again.
    fn invalidate(&self);
}

/// Role of the signed-in user, as issued by the auth backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Client,
    Support,
    Admin,
}

impl UserRole {
    /// Parse a role name, tolerating case and a `ROLE_` prefix.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        match upper.strip_prefix("ROLE_").unwrap_or(upper.as_str()) {
            "CLIENT" => Some(Self::Client),
            "SUPPORT" => Some(Self::Support),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub email: String,
    pub role: UserRole,
}

#[derive(Debug, Default)]
struct SessionData {
    user: Option<CurrentUser>,
    token: Option<String>,
}

/// In-memory session holding the current user and token.
#[derive(Debug, Default)]
pub struct SessionContext {
    data: Mutex<SessionData>,
}

impl SessionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the result of a successful login.
    pub fn sign_in(&self, user: CurrentUser, token: impl Into<String>) {
        let token = token.into();
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(email = %user.email, role = ?user.role, "session signed in");
        data.user = Some(user);
        data.token = Some(token).filter(|t| !t.is_empty());
    }

    pub fn sign_out(&self) {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.user = None;
        data.token = None;
    }

    #[must_use]
    pub fn current_user(&self) -> Option<CurrentUser> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).user.clone()
    }

    /// Whether the signed-in user has `role`.
    #[must_use]
    pub fn has_role(&self, role: UserRole) -> bool {
        self.current_user().is_some_and(|user| user.role == role)
    }
}

impl TokenProvider for SessionContext {
    fn token(&self) -> Option<String> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).token.clone()
    }

    fn invalidate(&self) {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        if data.token.is_some() {
            tracing::warn!("session invalidated by the server; sign in again");
        }
        data.user = None;
        data.token = None;
    }
}

// =============================================================================
// REQUEST POLICY
// =============================================================================

const AUTH_ENDPOINTS: &[&str] = &["/auth/login", "/auth/register", "/auth/logout"];

/// Login, register and logout go out without a bearer token.
#[must_use]
pub fn is_auth_endpoint(path: &str) -> bool {
    AUTH_ENDPOINTS.iter().any(|endpoint| path.contains(endpoint))
}

#[must_use]
pub fn should_attach_token(path: &str) -> bool {
    !is_auth_endpoint(path)
}

/// A 401/403 means the token is no longer accepted, except on auth endpoints
/// and on password change, where 401/403 reports a wrong credential.
#[must_use]
pub fn invalidates_session(path: &str, status: u16) -> bool {
    matches!(status, 401 | 403) && !is_auth_endpoint(path) && !path.contains("/password")
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
