//! TOML Configuration File Support
//!
//! Loads the switchboard configuration from
//! `$XDG_CONFIG_HOME/switchboard/switchboard.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`SWITCHBOARD_AGENT_ID`, `SWITCHBOARD_DEFAULT_PROTOCOL`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! agent_id = "agent-a"
//! default_protocol = "queue_broker"
//!
//! [[protocols]]
//! protocol = "queue_broker"
//! host = "localhost"
//! port = 4222
//!
//! [[protocols]]
//! protocol = "duplex_socket"
//! host = "0.0.0.0"
//! port = 8765
//! metadata = { mode = "server" }
//!
//! [[protocols]]
//! protocol = "request_response"
//! host = "api.local"
//! port = 8080
//! path = "/v1"
//! breaker = { failure_threshold = 3, recovery_timeout_secs = 10 }
//!
//! [[routes]]
//! source_protocol = "request_response"
//! target_protocol = "duplex_socket"
//! target_address = "agent-b"
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::MessageRoute;
use crate::transport::{ProtocolConfig, ProtocolKind};

/// Agent id used when nothing else names one
pub const DEFAULT_AGENT_ID: &str = "switchboard";

/// Environment variable overriding the agent id
pub const ENV_AGENT_ID: &str = "SWITCHBOARD_AGENT_ID";

/// Environment variable overriding the default protocol
pub const ENV_DEFAULT_PROTOCOL: &str = "SWITCHBOARD_DEFAULT_PROTOCOL";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Structure
// =============================================================================

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardToml {
    /// Identity of the local agent
    pub agent_id: Option<String>,

    /// Protocol used when neither preference nor route decides
    pub default_protocol: Option<ProtocolKind>,

    /// One entry per adapter to register
    pub protocols: Vec<ProtocolConfig>,

    /// Route table, in priority order
    pub routes: Vec<MessageRoute>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved switchboard configuration
#[derive(Clone, Debug)]
pub struct SwitchboardConfig {
    /// Identity of the local agent
    pub agent_id: String,

    /// Protocol used when neither preference nor route decides
    pub default_protocol: Option<ProtocolKind>,

    /// Adapters to register, in registration order
    pub protocols: Vec<ProtocolConfig>,

    /// Route table, in priority order
    pub routes: Vec<MessageRoute>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            agent_id: DEFAULT_AGENT_ID.to_string(),
            default_protocol: None,
            protocols: Vec::new(),
            routes: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SwitchboardConfig {
    /// Defaults for `agent_id`
    #[must_use]
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    /// Add one protocol
    #[must_use]
    pub fn with_protocol(mut self, config: ProtocolConfig) -> Self {
        self.protocols.push(config);
        self
    }

    /// Add one route
    #[must_use]
    pub fn with_route(mut self, route: MessageRoute) -> Self {
        self.routes.push(route);
        self
    }

    /// Set the default protocol
    #[must_use]
    pub fn with_default_protocol(mut self, kind: ProtocolKind) -> Self {
        self.default_protocol = Some(kind);
        self
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an empty agent id, a
    /// protocol kind configured twice, or a default protocol that is not
    /// configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.trim().is_empty() {
            return Err(ConfigError::ValidationError("agent_id must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for protocol in &self.protocols {
            if !seen.insert(protocol.protocol) {
                return Err(ConfigError::ValidationError(format!(
                    "protocol {} is configured more than once",
                    protocol.protocol
                )));
            }
            if protocol.host.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "protocol {} has an empty host",
                    protocol.protocol
                )));
            }
        }

        if let Some(default) = self.default_protocol {
            if !seen.contains(&default) {
                return Err(ConfigError::ValidationError(format!(
                    "default protocol {default} is not configured"
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/switchboard.toml` or
/// `~/.config/switchboard/switchboard.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("switchboard.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<SwitchboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchboardConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration reading environment overrides through `env`
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SwitchboardConfig, ConfigError> {
    let mut config = SwitchboardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SwitchboardToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                protocols = config.protocols.len(),
                routes = config.routes.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env)?;
    config.validate()?;

    Ok(config)
}

fn apply_toml_config(config: &mut SwitchboardConfig, toml: SwitchboardToml) {
    if let Some(agent_id) = toml.agent_id {
        config.agent_id = agent_id;
    }
    if toml.default_protocol.is_some() {
        config.default_protocol = toml.default_protocol;
    }
    config.protocols = toml.protocols;
    config.routes = toml.routes;
}

fn apply_env_config(
    config: &mut SwitchboardConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(agent_id) = env(ENV_AGENT_ID) {
        config.agent_id = agent_id;
        config.source = ConfigSource::Env;
    }
    if let Some(protocol) = env(ENV_DEFAULT_PROTOCOL) {
        let kind = protocol
            .parse::<ProtocolKind>()
            .map_err(|e| ConfigError::ValidationError(format!("{ENV_DEFAULT_PROTOCOL}: {e}")))?;
        config.default_protocol = Some(kind);
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides applied after loading
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Agent id override
    pub agent_id: Option<String>,

    /// Default protocol override
    pub default_protocol: Option<ProtocolKind>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set agent id override
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: String) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Set default protocol override
    #[must_use]
    pub fn with_default_protocol(mut self, kind: ProtocolKind) -> Self {
        self.default_protocol = Some(kind);
        self
    }

    /// Apply overrides and re-validate
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the overridden configuration
    /// is no longer valid.
    pub fn apply(&self, config: &mut SwitchboardConfig) -> Result<(), ConfigError> {
        if self.agent_id.is_none() && self.default_protocol.is_none() {
            return Ok(());
        }

        if let Some(ref agent_id) = self.agent_id {
            config.agent_id = agent_id.clone();
        }
        if self.default_protocol.is_some() {
            config.default_protocol = self.default_protocol;
        }
        config.source = ConfigSource::Cli;
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = SwitchboardConfig::default();
        assert_eq!(config.agent_id, DEFAULT_AGENT_ID);
        assert!(config.protocols.is_empty());
        assert!(config.default_protocol.is_none());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("switchboard/switchboard.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing
    // =========================================================================

    #[test]
    fn test_parse_full_toml() {
        let file = write_config(
            r#"
agent_id = "agent-a"
default_protocol = "broker"

[[protocols]]
protocol = "queue_broker"
host = "localhost"
port = 4222

[[protocols]]
protocol = "duplex_socket"
host = "0.0.0.0"
port = 8765
metadata = { mode = "server" }

[[protocols]]
protocol = "request_response"
host = "api.local"
port = 8080
path = "/v1"
breaker = { failure_threshold = 3 }

[[routes]]
source_protocol = "request_response"
target_protocol = "duplex_socket"
target_address = "agent-b"
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.agent_id, "agent-a");
        assert_eq!(config.default_protocol, Some(ProtocolKind::QueueBroker));
        assert_eq!(config.protocols.len(), 3);
        assert_eq!(config.protocols[1].meta("mode"), Some("server"));
        assert_eq!(config.protocols[2].breaker.failure_threshold, 3);
        assert_eq!(config.protocols[2].breaker.recovery_timeout_secs, 30);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].target_protocol, ProtocolKind::DuplexSocket);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = PathBuf::from("/nonexistent/path/switchboard.toml");
        let config = load_config_with_env(Some(path), no_env).unwrap();

        assert_eq!(config.agent_id, DEFAULT_AGENT_ID);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_config("[[protocols]\nhost = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_unknown_protocol_is_parse_error() {
        let file = write_config(
            r#"
[[protocols]]
protocol = "carrier_pigeon"
host = "coop"
port = 1
"#,
        );
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_duplicate_protocol_rejected() {
        let config = SwitchboardConfig::new("a")
            .with_protocol(ProtocolConfig::new(ProtocolKind::QueueBroker, "h", 1))
            .with_protocol(ProtocolConfig::new(ProtocolKind::QueueBroker, "h", 2));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_unconfigured_default_rejected() {
        let config = SwitchboardConfig::new("a")
            .with_protocol(ProtocolConfig::new(ProtocolKind::QueueBroker, "h", 1))
            .with_default_protocol(ProtocolKind::RequestResponse);

        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_empty_agent_id_rejected() {
        assert!(SwitchboardConfig::new("  ").validate().is_err());
    }

    // =========================================================================
    // Priority Ordering
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_config(
            r#"
agent_id = "file-agent"

[[protocols]]
protocol = "queue_broker"
host = "localhost"
port = 4222

[[protocols]]
protocol = "http"
host = "localhost"
port = 8080
"#,
        );
        let env: HashMap<&str, &str> = [
            (ENV_AGENT_ID, "env-agent"),
            (ENV_DEFAULT_PROTOCOL, "request-response"),
        ]
        .into_iter()
        .collect();

        let config = load_config_with_env(Some(file.path().to_path_buf()), |key| {
            env.get(key).map(|v| (*v).to_string())
        })
        .unwrap();

        assert_eq!(config.agent_id, "env-agent");
        assert_eq!(config.default_protocol, Some(ProtocolKind::RequestResponse));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_invalid_env_protocol_rejected() {
        let result = load_config_with_env(None, |key| {
            (key == ENV_DEFAULT_PROTOCOL).then(|| "smoke-signal".to_string())
        });
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = load_config_with_env(None, |key| {
            (key == ENV_AGENT_ID).then(|| "env-agent".to_string())
        })
        .unwrap();

        ConfigOverrides::new()
            .with_agent_id("cli-agent".to_string())
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.agent_id, "cli-agent");
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_cli_override_revalidates() {
        let mut config = SwitchboardConfig::new("a");
        let result = ConfigOverrides::new()
            .with_default_protocol(ProtocolKind::DuplexSocket)
            .apply(&mut config);
        assert!(result.is_err());
    }
}
