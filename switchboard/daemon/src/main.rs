//! Switchboard Daemon - Multi-Protocol Agent Host
//!
//! Loads an agent's switchboard configuration, attaches it to every
//! configured protocol and keeps those attachments alive until stopped.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default config file
//! switchboard-daemon
//!
//! # Explicit config file and identity
//! switchboard-daemon --config /etc/switchboard/agent.toml --agent-id planner
//!
//! # Validate configuration and exit
//! switchboard-daemon --check-config
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use switchboard_core::{
    load_config_from_path, CommunicationManager, ConfigOverrides, ProtocolKind, SwitchboardConfig,
};

use server::AgentServer;

/// Switchboard Daemon - keeps an agent connected over every configured protocol
#[derive(Parser, Debug)]
#[command(name = "switchboard-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Agent identity (overrides config file and environment)
    #[arg(short = 'a', long, value_name = "ID")]
    agent_id: Option<String>,

    /// Protocol tried when no preference or route applies
    #[arg(long, value_name = "PROTOCOL", value_parser = parse_protocol)]
    default_protocol: Option<ProtocolKind>,

    /// Seconds between health checks
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    health_interval: u64,

    /// Print the resolved configuration as JSON and exit
    #[arg(long)]
    check_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn parse_protocol(value: &str) -> Result<ProtocolKind, String> {
    value.parse().map_err(|e| format!("{e}"))
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_daemon={level},switchboard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Load the config file and environment, then apply command-line overrides
fn resolve_config(args: &Args) -> Result<SwitchboardConfig> {
    let mut config = load_config_from_path(args.config.clone())
        .context("Failed to load switchboard configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(agent_id) = &args.agent_id {
        overrides = overrides.with_agent_id(agent_id.clone());
    }
    if let Some(kind) = args.default_protocol {
        overrides = overrides.with_default_protocol(kind);
    }
    overrides
        .apply(&mut config)
        .context("Invalid command-line override")?;

    Ok(config)
}

/// JSON view of a resolved configuration, with credentials masked
fn config_summary(config: &SwitchboardConfig) -> Value {
    let protocols: Vec<Value> = config
        .protocols
        .iter()
        .map(|protocol| {
            let mut value = json!(protocol);
            if let Some(token) = value.get_mut("auth_token") {
                *token = json!("***");
            }
            value
        })
        .collect();

    json!({
        "agent_id": config.agent_id,
        "source": config.source().to_string(),
        "config_file": config.config_file_path,
        "default_protocol": config.default_protocol,
        "protocols": protocols,
        "routes": config.routes,
    })
}

/// Flip `shutdown` on SIGTERM or SIGINT
async fn watch_signals(shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    shutdown.store(true, Ordering::SeqCst);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    let config = resolve_config(&args)?;

    if args.check_config {
        println!("{}", serde_json::to_string_pretty(&config_summary(&config))?);
        return Ok(());
    }

    info!("Switchboard Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());
    info!(
        agent_id = %config.agent_id,
        source = %config.source(),
        config_path = ?config.config_file_path,
        protocols = config.protocols.len(),
        routes = config.routes.len(),
        "Configuration loaded"
    );
    if config.protocols.is_empty() {
        warn!("No protocols configured, the agent will be unreachable");
    }

    let manager = CommunicationManager::from_config(&config)?;
    let server = AgentServer::new(manager, Duration::from_secs(args.health_interval));

    // Setup signal handlers
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if let Err(e) = watch_signals(Arc::clone(&shutdown_clone)).await {
            error!(error = %e, "Signal handling unavailable, shutting down");
            shutdown_clone.store(true, Ordering::SeqCst);
        }
    });

    let result = server.run(shutdown).await;

    info!("Shutting down...");
    let stats = server.manager().stats();
    info!(
        sent = stats.messages_sent,
        failed = stats.messages_failed,
        fallbacks = stats.fallbacks_used,
        "Final message counts"
    );

    match result {
        Ok(()) => {
            info!("Switchboard daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["switchboard-daemon"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_args_defaults() {
        let args = args(&["--config", "/nonexistent/switchboard.toml"]);
        assert_eq!(args.health_interval, 30);
        assert_eq!(args.log_level, "info");
        assert!(!args.check_config);
        assert!(args.default_protocol.is_none());
    }

    #[test]
    fn test_args_protocol_aliases() {
        let args = args(&["--default-protocol", "duplex-socket"]);
        assert_eq!(args.default_protocol, Some(ProtocolKind::DuplexSocket));
    }

    #[test]
    fn test_args_reject_unknown_protocol() {
        let parsed =
            Args::try_parse_from(["switchboard-daemon", "--default-protocol", "carrier-pigeon"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_args_reject_zero_interval() {
        let parsed = Args::try_parse_from(["switchboard-daemon", "--health-interval", "0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_resolve_config_applies_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
agent_id = "from-file"

[[protocols]]
protocol = "request_response"
host = "localhost"
port = 8080
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let args = args(&[
            "--config",
            &path,
            "--agent-id",
            "from-cli",
            "--default-protocol",
            "request_response",
        ]);

        let config = resolve_config(&args).unwrap();
        assert_eq!(config.agent_id, "from-cli");
        assert_eq!(config.default_protocol, Some(ProtocolKind::RequestResponse));

        let summary = config_summary(&config);
        assert_eq!(summary["agent_id"], "from-cli");
        assert_eq!(summary["protocols"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_config_summary_masks_tokens() {
        let config = SwitchboardConfig::new("agent").with_protocol(
            switchboard_core::ProtocolConfig::new(ProtocolKind::RequestResponse, "api", 443)
                .with_auth_token("secret"),
        );

        let summary = config_summary(&config);
        assert_eq!(summary["protocols"][0]["auth_token"], "***");
        assert!(!summary.to_string().contains("secret"));
    }

    #[test]
    fn test_resolve_config_rejects_unconfigured_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "agent_id = \"lonely\"").unwrap();

        let path = file.path().to_string_lossy().to_string();
        let args = args(&["--config", &path, "--default-protocol", "queue_broker"]);
        assert!(resolve_config(&args).is_err());
    }
}
