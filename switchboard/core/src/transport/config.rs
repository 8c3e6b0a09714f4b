//! Transport Configuration
//!
//! Configuration types for selecting and configuring one protocol adapter.
//! One [`ProtocolConfig`] is bound to exactly one adapter instance.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::BreakerConfig;

/// Error returned when a protocol name has no matching adapter
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Unknown protocol: {0}")]
pub struct UnknownProtocol(pub String);

/// Transport model selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Durable-queue message broker
    #[serde(alias = "broker", alias = "nats")]
    QueueBroker,

    /// Persistent bidirectional socket (client or server)
    #[serde(alias = "websocket", alias = "ws")]
    DuplexSocket,

    /// Stateless request/response with polling for inbound messages
    #[serde(alias = "http")]
    RequestResponse,
}

impl ProtocolKind {
    /// All kinds, in declaration order
    pub const ALL: [Self; 3] = [Self::QueueBroker, Self::DuplexSocket, Self::RequestResponse];

    /// Canonical name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueBroker => "queue_broker",
            Self::DuplexSocket => "duplex_socket",
            Self::RequestResponse => "request_response",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "queue_broker" | "broker" | "nats" => Ok(Self::QueueBroker),
            "duplex_socket" | "websocket" | "ws" => Ok(Self::DuplexSocket),
            "request_response" | "http" => Ok(Self::RequestResponse),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}

/// Role of a duplex socket adapter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SocketRole {
    /// One outbound connection
    #[default]
    Client,
    /// Accepts many inbound connections
    Server,
}

/// Metadata key selecting the duplex socket role
pub const META_MODE: &str = "mode";
/// Metadata key overriding the queue broker's inbound queue name
pub const META_QUEUE: &str = "queue";
/// Metadata key for the request/response poll period
pub const META_POLL_INTERVAL_MS: &str = "poll_interval_ms";
/// Metadata key for the request/response poll backoff after a failure
pub const META_POLL_BACKOFF_MS: &str = "poll_backoff_ms";

fn default_timeout_ms() -> u64 {
    5000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// Configuration of one protocol adapter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Which transport this configuration is for
    pub protocol: ProtocolKind,

    /// Remote host (or bind address for a socket server)
    pub host: String,

    /// Remote port (or bind port for a socket server)
    pub port: u16,

    /// Path prefix (socket path or HTTP base path)
    #[serde(default)]
    pub path: String,

    /// Use TLS (`wss://`, `https://`, `tls://`)
    #[serde(default)]
    pub tls: bool,

    /// Credential passed to the transport (bearer token, broker token)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Timeout applied to each connect try and each send
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Connect tries before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between connect tries
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Circuit breaker tuning for this protocol
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Free-form transport options
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ProtocolConfig {
    /// Create a configuration with default timeouts and retries
    pub fn new(protocol: ProtocolKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            path: String::new(),
            tls: false,
            auth_token: None,
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            breaker: BreakerConfig::default(),
            metadata: BTreeMap::new(),
        }
    }

    /// Set the path
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Enable or disable TLS
    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Set the auth token
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the per-operation timeout
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set connect retry behavior
    #[must_use]
    pub fn with_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Set circuit breaker tuning
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Add one metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Per-operation timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay between connect tries
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Look up a metadata value
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Look up a metadata value as milliseconds, falling back to `default_ms`
    pub fn meta_millis(&self, key: &str, default_ms: u64) -> Duration {
        let ms = self
            .meta(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(default_ms);
        Duration::from_millis(ms)
    }

    /// Duplex socket role from the `mode` metadata key
    pub fn socket_role(&self) -> SocketRole {
        match self.meta(META_MODE).map(str::to_lowercase).as_deref() {
            Some("server") => SocketRole::Server,
            _ => SocketRole::Client,
        }
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `scheme://host:port/path` using `tls_scheme` when TLS is enabled
    pub fn url(&self, plain_scheme: &str, tls_scheme: &str) -> String {
        let scheme = if self.tls { tls_scheme } else { plain_scheme };
        let path = self.path.trim_end_matches('/');
        if path.is_empty() {
            format!("{scheme}://{}", self.authority())
        } else if path.starts_with('/') {
            format!("{scheme}://{}{path}", self.authority())
        } else {
            format!("{scheme}://{}/{path}", self.authority())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_protocol_kind_parse_and_aliases() {
        assert_eq!("queue_broker".parse::<ProtocolKind>().unwrap(), ProtocolKind::QueueBroker);
        assert_eq!("NATS".parse::<ProtocolKind>().unwrap(), ProtocolKind::QueueBroker);
        assert_eq!("ws".parse::<ProtocolKind>().unwrap(), ProtocolKind::DuplexSocket);
        assert_eq!("duplex-socket".parse::<ProtocolKind>().unwrap(), ProtocolKind::DuplexSocket);
        assert_eq!("http".parse::<ProtocolKind>().unwrap(), ProtocolKind::RequestResponse);

        let err = "carrier_pigeon".parse::<ProtocolKind>().unwrap_err();
        assert_eq!(err, UnknownProtocol("carrier_pigeon".into()));
    }

    #[test]
    fn test_protocol_kind_display_round_trips() {
        for kind in ProtocolKind::ALL {
            assert_eq!(kind.to_string().parse::<ProtocolKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_defaults_from_toml() {
        let config: ProtocolConfig = toml::from_str(
            r#"
            protocol = "websocket"
            host = "0.0.0.0"
            port = 9000
            [metadata]
            mode = "server"
            "#,
        )
        .unwrap();

        assert_eq!(config.protocol, ProtocolKind::DuplexSocket);
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.breaker, BreakerConfig::default());
        assert_eq!(config.socket_role(), SocketRole::Server);
    }

    #[test]
    fn test_url_building() {
        let config = ProtocolConfig::new(ProtocolKind::RequestResponse, "api.local", 8080);
        assert_eq!(config.url("http", "https"), "http://api.local:8080");

        let config = config.with_path("v1/").with_tls(true);
        assert_eq!(config.url("http", "https"), "https://api.local:8080/v1");

        let config = ProtocolConfig::new(ProtocolKind::DuplexSocket, "h", 1).with_path("/ws");
        assert_eq!(config.url("ws", "wss"), "ws://h:1/ws");
    }

    #[test]
    fn test_meta_millis_falls_back_on_garbage() {
        let config = ProtocolConfig::new(ProtocolKind::RequestResponse, "h", 1)
            .with_metadata(META_POLL_INTERVAL_MS, "250")
            .with_metadata(META_POLL_BACKOFF_MS, "soon");

        assert_eq!(config.meta_millis(META_POLL_INTERVAL_MS, 1000), Duration::from_millis(250));
        assert_eq!(config.meta_millis(META_POLL_BACKOFF_MS, 5000), Duration::from_millis(5000));
        assert_eq!(config.socket_role(), SocketRole::Client);
    }
}
