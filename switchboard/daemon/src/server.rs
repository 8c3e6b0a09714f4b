//! Agent Server Loop
//!
//! Keeps one agent attached to every configured protocol:
//! - Connects and starts listening on startup
//! - Logs a health report every `health_interval`
//! - Reconnects protocols that dropped out, on the same tick
//! - Shuts everything down when the shutdown flag is raised

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, warn};

use switchboard_core::{
    CommunicationManager, ConnectionStatus, Envelope, OverallHealth, ProtocolAdapter,
};

/// How often the shutdown flag is checked
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Message type answered by the built-in responder
pub const PING: &str = "ping";

/// Reply to [`PING`]
pub const PONG: &str = "pong";

/// Runs one agent until shutdown
pub struct AgentServer {
    manager: Arc<CommunicationManager>,
    health_interval: Duration,
}

impl AgentServer {
    /// Wrap a configured manager
    pub fn new(manager: CommunicationManager, health_interval: Duration) -> Self {
        let manager = Arc::new(manager);
        install_ping_responder(&manager);
        Self {
            manager,
            health_interval,
        }
    }

    /// The manager driven by this server
    pub fn manager(&self) -> &Arc<CommunicationManager> {
        &self.manager
    }

    /// Connect, listen and supervise until `shutdown` is set
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let connected = self.manager.connect_all().await;
        for (kind, ok) in &connected {
            info!(protocol = %kind, connected = ok, "Initial connect");
        }
        let listening = self.manager.start_all_listening().await;
        let active = listening.values().filter(|ok| **ok).count();
        info!(
            agent_id = %self.manager.agent_id(),
            listening = active,
            protocols = listening.len(),
            "Agent online"
        );

        let mut ticker = tokio::time::interval(self.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping supervision loop");
                break;
            }

            // Use timeout so we can check shutdown
            if tokio::time::timeout(SHUTDOWN_POLL, ticker.tick()).await.is_ok() {
                self.supervise().await;
            }
        }

        self.manager.shutdown().await;
        Ok(())
    }

    async fn supervise(&self) {
        let report = self.manager.health();
        match report.overall {
            OverallHealth::Healthy => debug!(
                connected = report.connected_protocols,
                total = report.total_protocols,
                "Health check"
            ),
            overall => warn!(
                overall = %overall,
                connected = report.connected_protocols,
                total = report.total_protocols,
                report = %serde_json::to_string(&report).unwrap_or_default(),
                "Health check"
            ),
        }

        for kind in self.manager.registered_protocols() {
            let Some(adapter) = self.manager.adapter(kind) else { continue };
            if adapter.status() != ConnectionStatus::Connected {
                reconnect(adapter.as_ref()).await;
            }
        }
    }
}

async fn reconnect(adapter: &dyn ProtocolAdapter) {
    let kind = adapter.kind();
    info!(protocol = %kind, status = ?adapter.status(), "Reconnecting");

    // A dead receive loop must be cleared before a fresh one can start.
    adapter.stop_listening().await;
    if adapter.connect().await && adapter.start_listening().await {
        info!(protocol = %kind, "Protocol restored");
    } else {
        warn!(protocol = %kind, "Reconnect failed, will retry on next health check");
    }
}

/// Answer every `ping` with a `pong` addressed to its sender
fn install_ping_responder(manager: &Arc<CommunicationManager>) {
    let weak: Weak<CommunicationManager> = Arc::downgrade(manager);
    manager.add_global_handler(PING, move |envelope: Envelope| {
        let weak = weak.clone();
        async move {
            let Some(manager) = weak.upgrade() else {
                return Ok(());
            };
            let reply = envelope.reply(
                PONG,
                json!({ "received_at": envelope.timestamp }),
                manager.agent_id(),
            );
            let delivered = manager.send(&reply, &envelope.sender_id, None).await?;
            if !delivered {
                warn!(recipient = %envelope.sender_id, "Could not deliver pong");
            }
            anyhow::Ok(())
        }
    });
}
