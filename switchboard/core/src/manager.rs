//! Communication Manager
//!
//! Owns the adapter registry, the route table, one circuit breaker per
//! protocol and the global handler map, and turns them into a single
//! `send(envelope, target)` entry point.
//!
//! # Protocol Selection
//!
//! For each send the first usable protocol from this list is chosen:
//!
//! 1. the explicitly preferred protocol
//! 2. the target protocol of the first matching route
//! 3. the configured default protocol
//! 4. the first protocol in registration order
//!
//! A protocol is usable when its adapter is connected and its breaker is
//! selectable. If the chosen adapter fails, exactly one more selection runs
//! with the failed protocol excluded.
//!
//! # Locking
//!
//! Breakers, routes, counters and global handlers sit behind one
//! `parking_lot::Mutex`. It is never held across an `.await`; adapter calls
//! and handler dispatch always run outside it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, SwitchboardConfig};
use crate::envelope::Envelope;
use crate::routing::{BreakerConfig, CircuitBreaker, CircuitState, MessageRoute, RouteTable};
use crate::transport::{
    create_adapter, AdapterStats, ConnectionStatus, EnvelopeHandler, ProtocolAdapter,
    ProtocolConfig, ProtocolKind, SharedHandler,
};

// ============================================================================
// Errors
// ============================================================================

/// Programming misuse of the manager
///
/// Transport failures never surface here; they are reported as `false`.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A protocol was named that has no registered adapter
    #[error("Protocol {0} is not registered")]
    UnregisteredProtocol(ProtocolKind),

    /// A protocol name has no adapter implementation
    #[error("No adapter implementation for protocol {0:?}")]
    UnsupportedProtocol(String),

    /// The configuration passed does not describe the protocol being registered
    #[error("Configuration is for {found}, expected {expected}")]
    ProtocolMismatch {
        /// Kind being registered
        expected: ProtocolKind,
        /// Kind named by the configuration
        found: ProtocolKind,
    },

    /// An adapter for this kind already exists
    #[error("Protocol {0} is already registered")]
    AlreadyRegistered(ProtocolKind),

    /// Configuration could not be used
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ============================================================================
// Statistics and Health
// ============================================================================

/// Aggregated send statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunicationStats {
    /// Identity of the local agent
    pub agent_id: String,
    /// Sends that reached a recipient
    pub messages_sent: u64,
    /// Sends that returned `false`
    pub messages_failed: u64,
    /// Sends that needed the fallback selection
    pub fallbacks_used: u64,
    /// Sends for which no protocol was usable at all
    pub no_route_failures: u64,
    /// Successful sends per protocol
    pub protocol_usage: BTreeMap<ProtocolKind, u64>,
    /// Per-adapter counters
    pub adapters: BTreeMap<ProtocolKind, AdapterStats>,
}

/// Overall health verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    /// Every protocol connected with a closed breaker
    Healthy,
    /// Some protocols usable, some not
    Degraded,
    /// No protocol usable
    Unhealthy,
}

impl std::fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one protocol
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolHealth {
    /// Adapter connection status
    pub status: ConnectionStatus,
    /// Whether the receive loop runs
    pub listening: bool,
    /// Adapter error rate (0.0 - 1.0)
    pub error_rate: f64,
    /// Breaker state
    pub circuit: CircuitState,
    /// Consecutive send failures
    pub consecutive_failures: u32,
}

impl ProtocolHealth {
    fn usable(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.circuit != CircuitState::Open
    }
}

/// Health snapshot across every registered protocol
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall verdict
    pub overall: OverallHealth,
    /// Protocols whose adapter is connected
    pub connected_protocols: usize,
    /// Registered protocols
    pub total_protocols: usize,
    /// Per-protocol detail
    pub protocols: BTreeMap<ProtocolKind, ProtocolHealth>,
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Default)]
struct Counters {
    messages_sent: u64,
    messages_failed: u64,
    fallbacks_used: u64,
    no_route_failures: u64,
    protocol_usage: BTreeMap<ProtocolKind, u64>,
}

#[derive(Default)]
struct ManagerState {
    default_protocol: Option<ProtocolKind>,
    breakers: BTreeMap<ProtocolKind, CircuitBreaker>,
    routes: RouteTable,
    counters: Counters,
    global_handlers: Vec<(String, SharedHandler)>,
}

type AdapterList = Vec<Arc<dyn ProtocolAdapter>>;

// ============================================================================
// Communication Manager
// ============================================================================

/// Entry point for sending and receiving across every registered protocol
pub struct CommunicationManager {
    agent_id: String,
    /// Registration order is selection order
    adapters: RwLock<AdapterList>,
    state: Mutex<ManagerState>,
}

impl CommunicationManager {
    /// Create an empty manager for `agent_id`
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            adapters: RwLock::new(Vec::new()),
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Build a manager from a loaded configuration
    ///
    /// Registers every configured protocol in order and installs the routes.
    /// Nothing is connected yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn from_config(config: &SwitchboardConfig) -> Result<Self, ManagerError> {
        config.validate()?;

        let manager = Self::new(config.agent_id.clone());
        for protocol in &config.protocols {
            manager.register_protocol(protocol.protocol, protocol.clone())?;
        }
        manager.set_default_protocol(config.default_protocol);
        for route in &config.routes {
            manager.add_route(route.clone());
        }

        tracing::info!(
            agent_id = %manager.agent_id,
            protocols = config.protocols.len(),
            routes = config.routes.len(),
            "Communication manager configured"
        );
        Ok(manager)
    }

    /// Identity of the local agent
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Set or clear the default protocol
    pub fn set_default_protocol(&self, kind: Option<ProtocolKind>) {
        self.state.lock().default_protocol = kind;
    }

    /// Current default protocol
    pub fn default_protocol(&self) -> Option<ProtocolKind> {
        self.state.lock().default_protocol
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Build and register the adapter for `kind`
    ///
    /// Returns `Ok(false)` if `kind` is already registered; the existing
    /// adapter is kept.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::ProtocolMismatch` if `config` describes another
    /// protocol.
    pub fn register_protocol(
        &self,
        kind: ProtocolKind,
        config: ProtocolConfig,
    ) -> Result<bool, ManagerError> {
        if config.protocol != kind {
            return Err(ManagerError::ProtocolMismatch {
                expected: kind,
                found: config.protocol,
            });
        }
        if self.is_registered(kind) {
            tracing::warn!(
                protocol = %kind,
                "Protocol already registered, keeping existing adapter"
            );
            return Ok(false);
        }

        let breaker = config.breaker.clone();
        let adapter = create_adapter(&self.agent_id, config);
        match self.register_adapter(adapter, breaker) {
            Ok(()) => Ok(true),
            Err(ManagerError::AlreadyRegistered(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Register a protocol given by name
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::UnsupportedProtocol` if no adapter implements
    /// `name`, otherwise as [`Self::register_protocol`].
    pub fn register_protocol_named(
        &self,
        name: &str,
        config: ProtocolConfig,
    ) -> Result<bool, ManagerError> {
        let kind = name
            .parse::<ProtocolKind>()
            .map_err(|e| ManagerError::UnsupportedProtocol(e.0))?;
        self.register_protocol(kind, config)
    }

    /// Register a pre-built adapter
    ///
    /// Every global handler added so far is installed on it.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::AlreadyRegistered` if an adapter of the same
    /// kind exists.
    pub fn register_adapter(
        &self,
        adapter: Arc<dyn ProtocolAdapter>,
        breaker: BreakerConfig,
    ) -> Result<(), ManagerError> {
        let kind = adapter.kind();
        let mut adapters = self.adapters.write();
        if adapters.iter().any(|a| a.kind() == kind) {
            return Err(ManagerError::AlreadyRegistered(kind));
        }

        let mut state = self.state.lock();
        for (message_type, handler) in &state.global_handlers {
            adapter.add_handler(message_type, Arc::clone(handler));
        }
        state.breakers.insert(kind, CircuitBreaker::new(kind, breaker));
        adapters.push(adapter);

        tracing::info!(protocol = %kind, "Protocol registered");
        Ok(())
    }

    /// Whether an adapter for `kind` exists
    pub fn is_registered(&self, kind: ProtocolKind) -> bool {
        self.adapters.read().iter().any(|a| a.kind() == kind)
    }

    /// Registered kinds in registration order
    pub fn registered_protocols(&self) -> Vec<ProtocolKind> {
        self.adapters.read().iter().map(|a| a.kind()).collect()
    }

    /// The adapter registered for `kind`
    pub fn adapter(&self, kind: ProtocolKind) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters.read().iter().find(|a| a.kind() == kind).cloned()
    }

    fn snapshot(&self) -> AdapterList {
        self.adapters.read().clone()
    }

    // ------------------------------------------------------------------------
    // Routes and Handlers
    // ------------------------------------------------------------------------

    /// Append a route
    pub fn add_route(&self, route: MessageRoute) {
        self.state.lock().routes.add(route);
    }

    /// All routes in priority order
    pub fn routes(&self) -> Vec<MessageRoute> {
        self.state.lock().routes.routes().to_vec()
    }

    /// Register a handler on every current and future adapter
    pub fn add_global_handler<H>(&self, message_type: &str, handler: H)
    where
        H: EnvelopeHandler + 'static,
    {
        let handler: SharedHandler = Arc::new(handler);
        let adapters = self.adapters.read();
        self.state
            .lock()
            .global_handlers
            .push((message_type.to_string(), Arc::clone(&handler)));

        for adapter in adapters.iter() {
            adapter.add_handler(message_type, Arc::clone(&handler));
        }
        tracing::debug!(message_type, adapters = adapters.len(), "Global handler added");
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect every adapter; one failure does not stop the others
    pub async fn connect_all(&self) -> BTreeMap<ProtocolKind, bool> {
        let mut results = BTreeMap::new();
        for adapter in self.snapshot() {
            let ok = adapter.connect().await;
            if !ok {
                tracing::warn!(protocol = %adapter.kind(), "Connect failed");
            }
            results.insert(adapter.kind(), ok);
        }
        results
    }

    /// Disconnect every adapter
    pub async fn disconnect_all(&self) -> BTreeMap<ProtocolKind, bool> {
        let mut results = BTreeMap::new();
        for adapter in self.snapshot() {
            results.insert(adapter.kind(), adapter.disconnect().await);
        }
        results
    }

    /// Start every adapter's receive loop
    pub async fn start_all_listening(&self) -> BTreeMap<ProtocolKind, bool> {
        let mut results = BTreeMap::new();
        for adapter in self.snapshot() {
            let ok = adapter.start_listening().await;
            if !ok {
                tracing::warn!(protocol = %adapter.kind(), "Could not start listening");
            }
            results.insert(adapter.kind(), ok);
        }
        results
    }

    /// Stop every adapter's receive loop
    pub async fn stop_all_listening(&self) -> BTreeMap<ProtocolKind, bool> {
        let mut results = BTreeMap::new();
        for adapter in self.snapshot() {
            results.insert(adapter.kind(), adapter.stop_listening().await);
        }
        results
    }

    /// Stop listening, then disconnect everything
    pub async fn shutdown(&self) {
        self.stop_all_listening().await;
        self.disconnect_all().await;
        tracing::info!(agent_id = %self.agent_id, "Communication manager shut down");
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send `envelope` to `target`
    ///
    /// Returns `Ok(false)` when no protocol is usable or both the chosen
    /// protocol and its fallback fail.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::UnregisteredProtocol` if `preferred` names a
    /// protocol with no adapter.
    pub async fn send(
        &self,
        envelope: &Envelope,
        target: &str,
        preferred: Option<ProtocolKind>,
    ) -> Result<bool, ManagerError> {
        let adapters = self.snapshot();
        if let Some(kind) = preferred {
            if !adapters.iter().any(|a| a.kind() == kind) {
                return Err(ManagerError::UnregisteredProtocol(kind));
            }
        }

        let Some(first) = self.select(&adapters, target, preferred, None) else {
            let mut state = self.state.lock();
            state.counters.no_route_failures += 1;
            state.counters.messages_failed += 1;
            tracing::warn!(recipient = %target, "No usable protocol");
            return Ok(false);
        };

        if self.attempt(&first, envelope, target).await {
            return Ok(true);
        }

        let Some(fallback) = self.select(&adapters, target, preferred, Some(first.kind())) else {
            self.state.lock().counters.messages_failed += 1;
            tracing::warn!(
                recipient = %target,
                protocol = %first.kind(),
                "Send failed, no fallback available"
            );
            return Ok(false);
        };

        self.state.lock().counters.fallbacks_used += 1;
        tracing::info!(
            recipient = %target,
            failed = %first.kind(),
            fallback = %fallback.kind(),
            "Falling back to another protocol"
        );

        if self.attempt(&fallback, envelope, target).await {
            Ok(true)
        } else {
            self.state.lock().counters.messages_failed += 1;
            tracing::warn!(recipient = %target, "Fallback send failed");
            Ok(false)
        }
    }

    /// Pick a protocol and claim its breaker attempt, all under one lock
    fn select(
        &self,
        adapters: &[Arc<dyn ProtocolAdapter>],
        target: &str,
        preferred: Option<ProtocolKind>,
        exclude: Option<ProtocolKind>,
    ) -> Option<Arc<dyn ProtocolAdapter>> {
        let mut state = self.state.lock();

        let route_kinds: Vec<ProtocolKind> = state
            .routes
            .matching(target)
            .map(|route| route.target_protocol)
            .collect();
        let find = |kind: ProtocolKind| adapters.iter().find(|a| a.kind() == kind);

        let candidates = preferred
            .into_iter()
            .chain(route_kinds)
            .chain(state.default_protocol)
            .filter_map(find)
            .chain(adapters.iter());

        let mut chosen = None;
        for adapter in candidates {
            let kind = adapter.kind();
            if Some(kind) == exclude || adapter.status() != ConnectionStatus::Connected {
                continue;
            }
            if let Some(breaker) = state.breakers.get_mut(&kind) {
                if breaker.is_selectable() {
                    breaker.begin_attempt();
                    chosen = Some(Arc::clone(adapter));
                    break;
                }
            }
        }

        let adapter = chosen?;
        tracing::debug!(recipient = %target, protocol = %adapter.kind(), "Protocol selected");
        Some(adapter)
    }

    async fn attempt(
        &self,
        adapter: &Arc<dyn ProtocolAdapter>,
        envelope: &Envelope,
        target: &str,
    ) -> bool {
        let kind = adapter.kind();
        let ok = adapter.send(envelope, target).await;

        let mut state = self.state.lock();
        if let Some(breaker) = state.breakers.get_mut(&kind) {
            if ok {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
        if ok {
            state.counters.messages_sent += 1;
            *state.counters.protocol_usage.entry(kind).or_default() += 1;
        }
        ok
    }

    // ------------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------------

    /// Current breaker state of `kind`
    pub fn breaker_state(&self, kind: ProtocolKind) -> Option<CircuitState> {
        self.state.lock().breakers.get_mut(&kind).map(CircuitBreaker::state)
    }

    /// Aggregated statistics
    pub fn stats(&self) -> CommunicationStats {
        let adapters: BTreeMap<ProtocolKind, AdapterStats> = self
            .snapshot()
            .iter()
            .map(|a| (a.kind(), a.stats()))
            .collect();

        let state = self.state.lock();
        let counters = &state.counters;
        CommunicationStats {
            agent_id: self.agent_id.clone(),
            messages_sent: counters.messages_sent,
            messages_failed: counters.messages_failed,
            fallbacks_used: counters.fallbacks_used,
            no_route_failures: counters.no_route_failures,
            protocol_usage: counters.protocol_usage.clone(),
            adapters,
        }
    }

    /// Health across every protocol
    pub fn health(&self) -> HealthReport {
        let adapters = self.snapshot();
        let mut state = self.state.lock();

        let protocols: BTreeMap<ProtocolKind, ProtocolHealth> = adapters
            .iter()
            .map(|adapter| {
                let kind = adapter.kind();
                let (circuit, consecutive_failures) =
                    state.breakers.get_mut(&kind).map_or((CircuitState::Closed, 0), |b| {
                        (b.state(), b.consecutive_failures())
                    });
                let health = ProtocolHealth {
                    status: adapter.status(),
                    listening: adapter.is_listening(),
                    error_rate: adapter.stats().error_rate(),
                    circuit,
                    consecutive_failures,
                };
                (kind, health)
            })
            .collect();
        drop(state);

        let total_protocols = protocols.len();
        let connected_protocols = protocols
            .values()
            .filter(|p| p.status == ConnectionStatus::Connected)
            .count();
        let usable = protocols.values().filter(|p| p.usable()).count();
        let all_closed = protocols.values().all(|p| p.circuit == CircuitState::Closed);

        let overall = if usable == 0 {
            OverallHealth::Unhealthy
        } else if connected_protocols == total_protocols && all_closed {
            OverallHealth::Healthy
        } else {
            OverallHealth::Degraded
        };

        HealthReport {
            overall,
            connected_protocols,
            total_protocols,
            protocols,
        }
    }
}

impl std::fmt::Debug for CommunicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationManager")
            .field("agent_id", &self.agent_id)
            .field("protocols", &self.registered_protocols())
            .finish_non_exhaustive()
    }
}
