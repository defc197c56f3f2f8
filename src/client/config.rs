//! Client configuration and error reporting hooks

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::auth::WS_PATH_PREFIX;
use crate::types::{Result, TurnstileError};

/// Receives errors that happen away from any caller: dropped connections and
/// `ERROR` messages sent by the authority.
pub trait ErrorHandler: Send + Sync {
    /// A pooled connection failed; it will be retried
    fn on_connection_error(&self, error: &TurnstileError);

    /// The authority reported a protocol problem
    fn on_server_error(&self, code: &str, message: &str);
}

/// Settings for [`Client`](super::Client)
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the authority, `ws://host:port` or `wss://host:port`
    pub url: String,
    /// Shared token, sent as the last path segment
    pub auth_token: String,
    /// Size of the connection pool; values below 1 mean 1
    pub number_of_connections: usize,
    /// Delay before redialing a dropped connection
    pub retry_connection_delay: Duration,
    /// How long `start_request` and `get_request_count` wait for a reply
    pub timeout: Duration,
    /// Heartbeat period; silence for twice this drops the connection
    pub heartbeat_interval: Duration,
    /// Dump every inbound and outbound frame at debug level
    pub log_messages: bool,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            auth_token: String::new(),
            number_of_connections: 1,
            retry_connection_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            log_messages: false,
            error_handler: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("auth_token", &"<redacted>")
            .field("number_of_connections", &self.number_of_connections)
            .field("retry_connection_delay", &self.retry_connection_delay)
            .field("timeout", &self.timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("log_messages", &self.log_messages)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl ClientConfig {
    /// Config for `url` and `auth_token` with every other field defaulted
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: auth_token.into(),
            ..Self::default()
        }
    }

    /// Full WebSocket URL: `<url>/ws/<percent-encoded token>`
    pub fn connection_url(&self) -> Result<String> {
        let base = self.url.trim_end_matches('/');

        if !(base.starts_with("ws://") || base.starts_with("wss://")) {
            return Err(TurnstileError::Config(format!(
                "URL must start with ws:// or wss://, got '{}'",
                self.url
            )));
        }

        Ok(format!(
            "{}{}{}",
            base,
            WS_PATH_PREFIX,
            urlencoding::encode(&self.auth_token)
        ))
    }

    pub(crate) fn pool_size(&self) -> usize {
        self.number_of_connections.max(1)
    }

    pub(crate) fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    pub(crate) fn report_connection_error(&self, error: &TurnstileError) {
        match &self.error_handler {
            Some(handler) => handler.on_connection_error(error),
            None => warn!(error = %error, "Connection to authority failed"),
        }
    }

    pub(crate) fn report_server_error(&self, code: &str, message: &str) {
        match &self.error_handler {
            Some(handler) => handler.on_server_error(code, message),
            None => warn!(code, message, "Authority reported an error"),
        }
    }
}
