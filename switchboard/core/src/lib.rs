//! Switchboard Core - Multi-Protocol Agent Communication
//!
//! A transport-agnostic messaging layer: agents exchange [`Envelope`]s over
//! whichever protocol is healthy, without caring which one carried them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    CommunicationManager                      │
//! │  ┌────────────┐  ┌────────────────┐  ┌────────────────────┐  │
//! │  │ RouteTable │  │ CircuitBreaker │  │  Global Handlers   │  │
//! │  │            │  │  (per proto)   │  │                    │  │
//! │  └────────────┘  └────────────────┘  └────────────────────┘  │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ ProtocolAdapter
//!          ┌─────────────────────┼─────────────────────┐
//!          │                     │                     │
//!   ┌──────┴───────┐     ┌───────┴──────┐     ┌────────┴────────┐
//!   │ Queue Broker │     │ Duplex Socket│     │ Request/Response│
//!   │   (NATS)     │     │ (WebSocket)  │     │     (HTTP)      │
//!   └──────────────┘     └──────────────┘     └─────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`CommunicationManager`]: registry, selection, fallback and health
//! - [`Envelope`]: the message record every adapter carries verbatim
//! - [`ProtocolAdapter`]: capability contract of one transport
//! - [`ProtocolConfig`]: configuration bound to one adapter
//! - [`SwitchboardConfig`]: file/env configuration for a whole agent
//!
//! # Quick Start
//!
//! ```ignore
//! use switchboard_core::{CommunicationManager, Envelope, ProtocolConfig, ProtocolKind};
//!
//! let manager = CommunicationManager::new("agent-a");
//! manager.register_protocol(
//!     ProtocolKind::RequestResponse,
//!     ProtocolConfig::new(ProtocolKind::RequestResponse, "api.local", 8080),
//! )?;
//! manager.add_global_handler("task", |envelope: Envelope| async move {
//!     tracing::info!(content = %envelope.content, "Got task");
//!     anyhow::Ok(())
//! });
//!
//! manager.connect_all().await;
//! manager.start_all_listening().await;
//!
//! let envelope = Envelope::new("task", serde_json::json!({"n": 1}), "agent-a");
//! let delivered = manager.send(&envelope, "agent-b", None).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`envelope`]: message envelope and wire encoding
//! - [`transport`]: adapter contract, listener machinery and the three adapters
//! - [`routing`]: circuit breaker and route table
//! - [`manager`]: the communication manager
//! - [`config`]: TOML configuration loading

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod envelope;
pub mod manager;
pub mod routing;
pub mod transport;

// Re-exports for convenience
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, SwitchboardConfig,
};
pub use envelope::{Envelope, Priority};
pub use manager::{
    CommunicationManager, CommunicationStats, HealthReport, ManagerError, OverallHealth,
    ProtocolHealth,
};
pub use routing::{BreakerConfig, CircuitBreaker, CircuitState, MessageRoute, RouteTable};
pub use transport::{
    create_adapter, AdapterError, AdapterStats, BrokerClient, ConnectionStatus,
    DuplexSocketAdapter, EnvelopeHandler, MemoryBroker, NatsBroker, ProtocolAdapter,
    ProtocolConfig, ProtocolKind, QueueBrokerAdapter, RequestResponseAdapter, SharedHandler,
    SocketRole,
};
