//! Client configuration.
//!
//! Options are plain data with documented defaults; `validate` is called once
//! when a client is constructed. Embedding applications can also load options
//! from a TOML fragment (`[client]` table style), mirroring how the rest of a
//! deployment is configured.
//!
//! All durations are milliseconds.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use aw_protocol::{ErrorInfo, WireFormat};
use serde::Deserialize;

use crate::error::Error;

/// Future returned by an auth callback: a fresh token, or the error the token
/// service reported.
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<String, ErrorInfo>> + Send>>;

/// Supplies a fresh token when the broker reports the current one expired.
pub type AuthCallback = Arc<dyn Fn() -> TokenFuture + Send + Sync>;

/// How requests and dials authenticate.
#[derive(Clone)]
pub enum AuthMode {
    /// A long-lived API key, sent as HTTP basic credentials.
    ApiKey(String),
    /// A bearer token, sent as `Authorization: Bearer <token>`.
    Token(String),
    /// A bearer token minted on demand (and re-minted on expiry).
    Callback(AuthCallback),
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::ApiKey(_) => f.write_str("AuthMode::ApiKey(..)"),
            AuthMode::Token(_) => f.write_str("AuthMode::Token(..)"),
            AuthMode::Callback(_) => f.write_str("AuthMode::Callback(..)"),
        }
    }
}

/// Client options with production defaults.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// WebSocket endpoint of the realtime broker.
    pub realtime_url: String,
    /// Base URL of the request/response API.
    pub rest_url: String,
    /// Hosts tried in rotation when the primary dial keeps failing.
    pub fallback_hosts: Vec<String>,
    pub auth: AuthMode,
    /// Identity asserted for presence operations.
    pub client_id: Option<String>,
    /// MessagePack frames instead of JSON text frames.
    pub use_binary_protocol: bool,
    /// Queue publishes while not connected instead of failing them.
    pub queue_messages: bool,
    /// Bound on the not-yet-connected publish queue.
    pub queue_capacity: usize,
    /// Bound on publishes awaiting ACK; overflow fails the oldest.
    pub pending_ack_capacity: usize,
    /// Transport dial + CONNECTED handshake deadline.
    pub connect_timeout_ms: u64,
    /// Default deadline for suspending operations (attach, publish, close).
    pub request_timeout_ms: u64,
    /// Base delay before a reconnect attempt from `Disconnected`.
    pub disconnected_retry_ms: u64,
    /// Delay between reconnect attempts from `Suspended`.
    pub suspended_retry_ms: u64,
    /// How long a dropped connection stays resumable; the broker's
    /// `ConnectionDetails` value overrides this default.
    pub connection_state_ttl_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            realtime_url: "wss://realtime.airwave.dev".to_owned(),
            rest_url: "https://rest.airwave.dev".to_owned(),
            fallback_hosts: Vec::new(),
            auth: AuthMode::Token(String::new()),
            client_id: None,
            use_binary_protocol: false,
            queue_messages: true,
            queue_capacity: 256,
            pending_ack_capacity: 1024,
            connect_timeout_ms: 15_000,
            request_timeout_ms: 10_000,
            disconnected_retry_ms: 15_000,
            suspended_retry_ms: 30_000,
            connection_state_ttl_ms: 120_000,
        }
    }
}

impl ClientOptions {
    /// Options with token auth against the given realtime/rest endpoints.
    pub fn new(
        realtime_url: impl Into<String>,
        rest_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        ClientOptions {
            realtime_url: realtime_url.into(),
            rest_url: rest_url.into(),
            auth: AuthMode::Token(token.into()),
            ..ClientOptions::default()
        }
    }

    pub fn wire_format(&self) -> WireFormat {
        if self.use_binary_protocol {
            WireFormat::MsgPack
        } else {
            WireFormat::Json
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.realtime_url.is_empty() {
            return Err(Error::BadOptions("realtime_url must be set".to_owned()));
        }
        if self.rest_url.is_empty() {
            return Err(Error::BadOptions("rest_url must be set".to_owned()));
        }
        match &self.auth {
            AuthMode::ApiKey(k) if k.is_empty() => {
                Err(Error::BadOptions("api key must not be empty".to_owned()))
            }
            AuthMode::Token(t) if t.is_empty() => {
                Err(Error::BadOptions("token must not be empty".to_owned()))
            }
            _ => Ok(()),
        }
    }

    /// Load options from a TOML fragment. Unset fields keep their defaults;
    /// exactly one of `api_key` / `token` must be present.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let raw: RawOptions =
            toml::from_str(text).map_err(|e| Error::BadOptions(e.to_string()))?;

        let defaults = ClientOptions::default();
        let auth = match (raw.api_key, raw.token) {
            (Some(key), None) => AuthMode::ApiKey(key),
            (None, Some(token)) => AuthMode::Token(token),
            (Some(_), Some(_)) => {
                return Err(Error::BadOptions(
                    "set either api_key or token, not both".to_owned(),
                ));
            }
            (None, None) => {
                return Err(Error::BadOptions(
                    "one of api_key or token is required".to_owned(),
                ));
            }
        };

        let options = ClientOptions {
            realtime_url: raw.realtime_url.unwrap_or(defaults.realtime_url),
            rest_url: raw.rest_url.unwrap_or(defaults.rest_url),
            fallback_hosts: raw.fallback_hosts.unwrap_or_default(),
            auth,
            client_id: raw.client_id,
            use_binary_protocol: raw
                .use_binary_protocol
                .unwrap_or(defaults.use_binary_protocol),
            queue_messages: raw.queue_messages.unwrap_or(defaults.queue_messages),
            queue_capacity: raw.queue_capacity.unwrap_or(defaults.queue_capacity),
            pending_ack_capacity: raw
                .pending_ack_capacity
                .unwrap_or(defaults.pending_ack_capacity),
            connect_timeout_ms: raw.connect_timeout_ms.unwrap_or(defaults.connect_timeout_ms),
            request_timeout_ms: raw.request_timeout_ms.unwrap_or(defaults.request_timeout_ms),
            disconnected_retry_ms: raw
                .disconnected_retry_ms
                .unwrap_or(defaults.disconnected_retry_ms),
            suspended_retry_ms: raw.suspended_retry_ms.unwrap_or(defaults.suspended_retry_ms),
            connection_state_ttl_ms: raw
                .connection_state_ttl_ms
                .unwrap_or(defaults.connection_state_ttl_ms),
        };
        options.validate()?;
        Ok(options)
    }
}

#[derive(Debug, Deserialize)]
struct RawOptions {
    realtime_url: Option<String>,
    rest_url: Option<String>,
    fallback_hosts: Option<Vec<String>>,
    api_key: Option<String>,
    token: Option<String>,
    client_id: Option<String>,
    use_binary_protocol: Option<bool>,
    queue_messages: Option<bool>,
    queue_capacity: Option<usize>,
    pending_ack_capacity: Option<usize>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    disconnected_retry_ms: Option<u64>,
    suspended_retry_ms: Option<u64>,
    connection_state_ttl_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_a_token() {
        let options = ClientOptions::new("wss://rt.example", "https://rest.example", "tok");
        assert!(options.validate().is_ok());
        assert_eq!(options.wire_format(), WireFormat::Json);
    }

    #[test]
    fn empty_token_is_rejected() {
        let options = ClientOptions::default();
        assert!(matches!(options.validate(), Err(Error::BadOptions(_))));
    }

    #[test]
    fn toml_fragment_overrides_defaults() {
        let options = ClientOptions::from_toml_str(
            r#"
            realtime_url = "wss://rt.example"
            token = "tok-1"
            use_binary_protocol = true
            disconnected_retry_ms = 500
            fallback_hosts = ["b.example", "c.example"]
            "#,
        )
        .unwrap();
        assert_eq!(options.realtime_url, "wss://rt.example");
        assert_eq!(options.wire_format(), WireFormat::MsgPack);
        assert_eq!(options.disconnected_retry_ms, 500);
        assert_eq!(options.fallback_hosts.len(), 2);
        // Unset fields keep defaults.
        assert_eq!(options.queue_capacity, 256);
    }

    #[test]
    fn both_key_and_token_is_an_error() {
        let err = ClientOptions::from_toml_str(
            r#"
            api_key = "app.key:secret"
            token = "tok"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadOptions(_)));
    }
}
