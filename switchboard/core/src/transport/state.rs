//! Shared Adapter State
//!
//! Status, statistics and the retrying connect loop shared by every adapter.
//! Counters are atomics so receive loops and senders can update them without
//! taking a lock.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::config::{ProtocolConfig, ProtocolKind};
use super::listener::{HandlerRegistry, ListenerSlot};
use super::traits::AdapterError;

/// Connection status of an adapter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No transport held
    #[default]
    Disconnected,
    /// Initial connect in progress
    Connecting,
    /// Transport usable
    Connected,
    /// Connect retry in progress after a failed try
    Reconnecting,
    /// Connect gave up, or the receive loop hit a fatal fault
    Error,
}

impl ConnectionStatus {
    fn to_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
            Self::Error => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

/// Lock-free holder for a [`ConnectionStatus`]
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    /// Read the current status
    pub fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Replace the current status
    pub fn set(&self, status: ConnectionStatus) {
        self.0.store(status.to_u8(), Ordering::Release);
    }

    /// Move from `from` to `to` only if the status is still `from`
    pub fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        self.0
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Snapshot of one adapter's counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStats {
    /// Envelopes successfully transmitted
    pub messages_sent: u64,
    /// Envelopes received and dispatched
    pub messages_received: u64,
    /// Connect tries, successful or not
    pub connection_attempts: u64,
    /// Send failures, parse failures and loop faults
    pub errors: u64,
    /// Time of the last send, receive or connect
    pub last_activity: Option<DateTime<Utc>>,
}

impl AdapterStats {
    /// Share of operations that failed (0.0 - 1.0)
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_received + self.errors;
        if total == 0 {
            0.0
        } else {
            self.errors as f64 / total as f64
        }
    }
}

/// Atomic counters behind [`AdapterStats`]
#[derive(Debug, Default)]
pub struct StatsRecorder {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connection_attempts: AtomicU64,
    errors: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl StatsRecorder {
    fn touch(&self) {
        *self.last_activity.lock() = Some(Utc::now());
    }

    /// Count one transmitted envelope
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Count one received envelope
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Count one connect try
    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Count one error
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot
    pub fn snapshot(&self) -> AdapterStats {
        AdapterStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_activity: *self.last_activity.lock(),
        }
    }
}

/// State every adapter carries regardless of transport
pub struct AdapterShared {
    /// Identity of the local agent (own queue, poll endpoint, sender stamp)
    pub agent_id: String,
    /// Configuration bound to this adapter
    pub config: ProtocolConfig,
    /// Current connection status
    pub status: StatusCell,
    /// Counters
    pub stats: StatsRecorder,
    /// Inbound handlers by message type
    pub handlers: HandlerRegistry,
    /// Running receive loop, if any
    pub listener: ListenerSlot,
}

impl AdapterShared {
    /// Create shared state for an adapter
    pub fn new(agent_id: impl Into<String>, config: ProtocolConfig) -> Self {
        let kind = config.protocol;
        Self {
            agent_id: agent_id.into(),
            config,
            status: StatusCell::default(),
            stats: StatsRecorder::default(),
            handlers: HandlerRegistry::new(kind),
            listener: ListenerSlot::default(),
        }
    }

    /// Protocol this state belongs to
    pub fn kind(&self) -> ProtocolKind {
        self.config.protocol
    }

    /// Run `attempt` until it succeeds or the configured tries are used up
    ///
    /// Each try is bounded by the configured timeout and counted as a
    /// connection attempt. Sets `Connected` on success and `Error` when every
    /// try failed.
    pub async fn connect_with_retry<F, Fut>(&self, mut attempt: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), AdapterError>>,
    {
        let kind = self.kind();
        let tries = self.config.retry_attempts.max(1);
        let timeout = self.config.timeout();
        self.status.set(ConnectionStatus::Connecting);

        for try_number in 1..=tries {
            self.stats.record_connection_attempt();

            let result = match tokio::time::timeout(timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout(timeout)),
            };

            match result {
                Ok(()) => {
                    self.status.set(ConnectionStatus::Connected);
                    tracing::info!(protocol = %kind, attempt = try_number, "Connected");
                    return true;
                }
                Err(e) => {
                    self.stats.record_error();
                    tracing::warn!(
                        protocol = %kind,
                        attempt = try_number,
                        max_attempts = tries,
                        error = %e,
                        "Connect attempt failed"
                    );
                    if try_number < tries {
                        self.status.set(ConnectionStatus::Reconnecting);
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        self.status.set(ConnectionStatus::Error);
        tracing::error!(protocol = %kind, attempts = tries, "Giving up on connect");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn shared(retry_attempts: u32) -> AdapterShared {
        let mut config = ProtocolConfig::new(ProtocolKind::RequestResponse, "localhost", 1);
        config.retry_attempts = retry_attempts;
        config.retry_delay_ms = 1;
        config.timeout_ms = 50;
        AdapterShared::new("agent-a", config)
    }

    #[test]
    fn test_status_cell_transition() {
        let cell = StatusCell::default();
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);

        assert!(cell.transition(ConnectionStatus::Disconnected, ConnectionStatus::Connected));
        assert!(!cell.transition(ConnectionStatus::Disconnected, ConnectionStatus::Error));
        assert_eq!(cell.get(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_stats_snapshot_and_error_rate() {
        let stats = StatsRecorder::default();
        assert!(stats.snapshot().last_activity.is_none());
        assert_eq!(stats.snapshot().error_rate(), 0.0);

        stats.record_sent();
        stats.record_sent();
        stats.record_received();
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.errors, 1);
        assert!(snap.last_activity.is_some());
        assert!((snap.error_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_connect_with_retry_succeeds_on_later_try() {
        let state = shared(3);
        let tries = AtomicU32::new(0);

        let ok = state
            .connect_with_retry(|| {
                let n = tries.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AdapterError::Connection("refused".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(ok);
        assert_eq!(state.status.get(), ConnectionStatus::Connected);
        assert_eq!(state.stats.snapshot().connection_attempts, 3);
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up_with_error_status() {
        let state = shared(2);

        let ok = state
            .connect_with_retry(|| async { Err(AdapterError::Connection("down".into())) })
            .await;

        assert!(!ok);
        assert_eq!(state.status.get(), ConnectionStatus::Error);
        assert_eq!(state.stats.snapshot().connection_attempts, 2);
    }

    #[tokio::test]
    async fn test_connect_with_retry_times_out_slow_attempts() {
        let state = shared(1);

        let ok = state
            .connect_with_retry(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(!ok);
        assert_eq!(state.status.get(), ConnectionStatus::Error);
    }
}
