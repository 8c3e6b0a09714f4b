//! Per-Protocol Circuit Breaker
//!
//! ```text
//! +--------+  failure_threshold  +------+  recovery_timeout   +-----------+
//! | Closed | ------------------> | Open | ------------------> | Half-Open |
//! +--------+   failures          +------+  since last failure +-----------+
//!     ^                              ^                              |
//!     |          trial succeeds      |        trial fails           |
//!     +------------------------------+------------------------------+
//! ```
//!
//! - **Closed**: protocol eligible for selection
//! - **Open**: skipped by selection until the recovery timeout elapses
//! - **Half-Open**: exactly one trial send is allowed
//!
//! A breaker is not thread-safe on its own; the manager mutates breakers
//! under its state lock. Time is read from `tokio::time::Instant` so tests can
//! drive it with a paused clock.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::transport::ProtocolKind;

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

/// Circuit breaker tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds after the last failure before a trial is allowed
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl BreakerConfig {
    /// Recovery timeout as a duration
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Tripped, protocol skipped
    Open,
    /// Recovery timeout elapsed, one trial allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Failure tracker for one protocol
#[derive(Debug)]
pub struct CircuitBreaker {
    kind: ProtocolKind,
    config: BreakerConfig,
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(kind: ProtocolKind, config: BreakerConfig) -> Self {
        Self {
            kind,
            config,
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            trial_started: None,
        }
    }

    /// Tuning in effect
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Consecutive failures since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Current state, moving `Open` to `HalfOpen` once the timeout has elapsed
    pub fn state(&mut self) -> CircuitState {
        self.refresh(Instant::now());
        self.state
    }

    /// State as last recorded, without applying the recovery timeout
    pub fn recorded_state(&self) -> CircuitState {
        self.state
    }

    fn refresh(&mut self, now: Instant) {
        if self.state != CircuitState::Open {
            return;
        }
        let elapsed = self
            .last_failure
            .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
        if elapsed >= self.config.recovery_timeout() {
            self.state = CircuitState::HalfOpen;
            self.trial_started = None;
            tracing::info!(protocol = %self.kind, "Circuit breaker half-open, allowing one trial");
        }
    }

    fn trial_in_flight(&self, now: Instant) -> bool {
        self.trial_started
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.recovery_timeout())
    }

    /// Whether selection may pick this protocol right now
    pub fn is_selectable(&mut self) -> bool {
        let now = Instant::now();
        self.refresh(now);
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.trial_in_flight(now),
        }
    }

    /// Note that a send is about to go out on this protocol
    ///
    /// In half-open state this claims the single trial slot.
    pub fn begin_attempt(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_started = Some(Instant::now());
        }
    }

    /// Record a successful send: closes the breaker and clears failures
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!(protocol = %self.kind, "Circuit breaker closed");
        }
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.trial_started = None;
    }

    /// Record a failed send
    pub fn record_failure(&mut self) {
        let now = Instant::now();
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.trial_started = None;
                tracing::warn!(protocol = %self.kind, "Trial failed, circuit breaker re-opened");
            }
            CircuitState::Closed if self.failures >= self.config.failure_threshold => {
                self.state = CircuitState::Open;
                tracing::warn!(
                    protocol = %self.kind,
                    failures = self.failures,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }
}
