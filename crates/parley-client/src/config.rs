//! Client configuration.

use std::time::Duration;

use parley_proto::DEFAULT_HISTORY_LIMIT;

use crate::session::SessionConfig;

/// Default message API base.
pub const DEFAULT_API_BASE: &str = "http://localhost:8080/api";

/// Default live channel base.
pub const DEFAULT_WS_BASE: &str = "ws://localhost:8080";

/// Path of the live channel under the live base; the room id is appended.
pub const LIVE_PATH: &str = "api/ws";

/// Default timeout of one message API call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the server is and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Message API base, `http://` or `https://`.
    pub api_base: String,
    /// Live channel base, `ws://` or `wss://`.
    pub ws_base: String,
    /// Bearer token sent on every request and dial.
    pub auth_token: Option<String>,
    /// Timeout of one message API call.
    pub request_timeout: Duration,
    /// History page size requested on room entry.
    pub history_limit: u32,
    /// Delivery tuning.
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_owned(),
            ws_base: DEFAULT_WS_BASE.to_owned(),
            auth_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            session: SessionConfig::default(),
        }
    }
}

/// Rejected configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A base URL has the wrong scheme.
    #[error("{field} must start with {expected}, got {value:?}")]
    Scheme {
        /// Config field.
        field: &'static str,
        /// Accepted schemes.
        expected: &'static str,
        /// Rejected value.
        value: String,
    },

    /// A limit that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// The bearer token is blank.
    #[error("auth token is empty")]
    EmptyToken,
}

impl ClientConfig {
    /// Check the configuration before connecting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme("api_base", &self.api_base, &["http://", "https://"], "http:// or https://")?;
        check_scheme("ws_base", &self.ws_base, &["ws://", "wss://"], "ws:// or wss://")?;

        if self.auth_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ConfigError::EmptyToken);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero("request_timeout"));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::Zero("history_limit"));
        }
        if self.session.notifications.max_visible == 0 {
            return Err(ConfigError::Zero("max_visible"));
        }
        if self.session.notifications.lifetime.is_zero() {
            return Err(ConfigError::Zero("notice lifetime"));
        }
        if self.session.connection.outbound_capacity == Some(0) {
            return Err(ConfigError::Zero("outbound_capacity"));
        }
        Ok(())
    }
}

fn check_scheme(
    field: &'static str,
    value: &str,
    schemes: &[&str],
    expected: &'static str,
) -> Result<(), ConfigError> {
    let lower = value.to_ascii_lowercase();
    let ok = schemes.iter().any(|s| lower.strip_prefix(s).is_some_and(|rest| !rest.is_empty()));
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Scheme { field, expected, value: value.to_owned() })
    }
}
