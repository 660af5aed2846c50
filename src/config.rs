//! Support desk configuration parsed from environment variables.

use std::time::Duration;

use frames::HeartBeat;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_WS_PATH: &str = "/ws/websocket";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_OUTGOING_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_INCOMING_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_WAIT_MS: u64 = 1_500;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 8;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const SUCCESS_NOTICE_TTL: Duration = Duration::from_secs(3);
pub const ERROR_NOTICE_TTL: Duration = Duration::from_secs(4);

/// Error returned while building configuration.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The base URL is not an `http://` or `https://` URL.
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    /// An environment variable is set but does not hold an unsigned integer.
    #[error("invalid value for {key}: {value}")]
    InvalidNumber { key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

/// Constructor configuration for the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Pause between reconnect attempts. Zero disables reconnecting.
    pub reconnect_delay: Duration,
    /// Heart-beat intervals offered to the broker in CONNECT.
    pub heart_beat: HeartBeat,
    /// Upper bound on opening the socket and on waiting for CONNECTED.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            heart_beat: HeartBeat::new(DEFAULT_HEARTBEAT_OUTGOING_MS, DEFAULT_HEARTBEAT_INCOMING_MS),
            handshake_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Lifetimes of the auto-dismissing notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoticeConfig {
    pub success_ttl: Duration,
    pub error_ttl: Duration,
}

impl Default for NoticeConfig {
    fn default() -> Self {
        Self { success_ttl: SUCCESS_NOTICE_TTL, error_ttl: ERROR_NOTICE_TTL }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportDeskConfig {
    /// REST base URL without a trailing slash. The WebSocket URL is derived from it.
    pub base_url: String,
    /// Path of the raw WebSocket STOMP endpoint.
    pub ws_path: String,
    pub connection: ConnectionConfig,
    /// How long controllers wait for the first connect before carrying on without it.
    pub connect_wait: Duration,
    /// Interval of the support queue reconciliation sweep.
    pub refresh_interval: Duration,
    pub timeouts: HttpTimeouts,
    pub notices: NoticeConfig,
}

impl Default for SupportDeskConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            ws_path: DEFAULT_WS_PATH.to_owned(),
            connection: ConnectionConfig::default(),
            connect_wait: Duration::from_millis(DEFAULT_CONNECT_WAIT_MS),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            timeouts: HttpTimeouts {
                request_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
                connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            },
            notices: NoticeConfig::default(),
        }
    }
}

impl SupportDeskConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `SUPPORTDESK_BASE_URL`: default `http://localhost:8080`
    /// - `SUPPORTDESK_WS_PATH`: default `/ws/websocket`
    /// - `SUPPORTDESK_RECONNECT_DELAY_MS`: default 5000, 0 disables reconnect
    /// - `SUPPORTDESK_HEARTBEAT_OUTGOING_MS` / `SUPPORTDESK_HEARTBEAT_INCOMING_MS`: default 10000
    /// - `SUPPORTDESK_CONNECT_WAIT_MS`: default 1500
    /// - `SUPPORTDESK_REFRESH_INTERVAL_SECS`: default 8
    /// - `SUPPORTDESK_REQUEST_TIMEOUT_SECS`: default 30
    /// - `SUPPORTDESK_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the base URL is not HTTP(S) or a numeric
    /// variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = normalize_base_url(
            &std::env::var("SUPPORTDESK_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned()),
        )?;
        let ws_path = normalize_path(
            &std::env::var("SUPPORTDESK_WS_PATH").unwrap_or_else(|_| DEFAULT_WS_PATH.to_owned()),
        );

        let connect_secs = env_parse_u64("SUPPORTDESK_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?;
        let connection = ConnectionConfig {
            reconnect_delay: Duration::from_millis(env_parse_u64(
                "SUPPORTDESK_RECONNECT_DELAY_MS",
                DEFAULT_RECONNECT_DELAY_MS,
            )?),
            heart_beat: HeartBeat::new(
                env_parse_u64("SUPPORTDESK_HEARTBEAT_OUTGOING_MS", DEFAULT_HEARTBEAT_OUTGOING_MS)?,
                env_parse_u64("SUPPORTDESK_HEARTBEAT_INCOMING_MS", DEFAULT_HEARTBEAT_INCOMING_MS)?,
            ),
            handshake_timeout: Duration::from_secs(connect_secs),
        };
        let timeouts = HttpTimeouts {
            request_secs: env_parse_u64("SUPPORTDESK_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            connect_secs,
        };

        Ok(Self {
            base_url,
            ws_path,
            connection,
            connect_wait: Duration::from_millis(env_parse_u64("SUPPORTDESK_CONNECT_WAIT_MS", DEFAULT_CONNECT_WAIT_MS)?),
            refresh_interval: Duration::from_secs(env_parse_u64(
                "SUPPORTDESK_REFRESH_INTERVAL_SECS",
                DEFAULT_REFRESH_INTERVAL_SECS,
            )?),
            timeouts,
            notices: NoticeConfig::default(),
        })
    }

    /// Replace the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] if `base_url` is not HTTP(S).
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        self.base_url = normalize_base_url(base_url)?;
        Ok(self)
    }

    /// WebSocket URL of the STOMP endpoint: the base URL with its scheme
    /// switched to `ws`/`wss`, plus the endpoint path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] if the base URL is not HTTP(S).
    pub fn ws_url(&self) -> Result<String, ConfigError> {
        let trimmed = self.base_url.trim_end_matches('/');
        let path = normalize_path(&self.ws_path);

        if let Some(rest) = trimmed.strip_prefix("http://") {
            return Ok(format!("ws://{rest}{path}"));
        }
        if let Some(rest) = trimmed.strip_prefix("https://") {
            return Ok(format!("wss://{rest}{path}"));
        }

        Err(ConfigError::InvalidBaseUrl(self.base_url.clone()))
    }
}

fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let host = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .ok_or_else(|| ConfigError::InvalidBaseUrl(raw.to_owned()))?;
    if host.is_empty() {
        return Err(ConfigError::InvalidBaseUrl(raw.to_owned()));
    }
    Ok(trimmed.to_owned())
}

fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('/') { trimmed.to_owned() } else { format!("/{trimmed}") }
}

fn env_parse_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { key: key.to_owned(), value: raw }),
        _ => Ok(default),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
