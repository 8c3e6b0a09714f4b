//! Transport Layer
//!
//! One adapter contract over three structurally different transports:
//! - `QueueBroker`: durable queues on a message broker (NATS JetStream)
//! - `DuplexSocket`: persistent WebSocket, as client or server
//! - `RequestResponse`: HTTP with polling for inbound messages
//!
//! # Design Philosophy
//!
//! Adapters hide their connection lifecycle and delivery model behind
//! [`ProtocolAdapter`]. Every operation reports success as a `bool`; failures
//! are logged and counted in [`AdapterStats`], never raised. Receive loops
//! are cancellable tasks feeding a single dispatch task per adapter.

pub mod config;
pub mod duplex_socket;
pub mod factory;
pub mod listener;
pub mod queue_broker;
pub mod request_response;
pub mod state;
pub mod traits;

// Re-exports for convenience
pub use config::{ProtocolConfig, ProtocolKind, SocketRole, UnknownProtocol};
pub use duplex_socket::{ClientId, DuplexSocketAdapter, SocketFrame, BROADCAST};
pub use factory::create_adapter;
pub use listener::{DispatchOutcome, STOP_GRACE};
pub use queue_broker::{BrokerClient, MemoryBroker, NatsBroker, QueueBrokerAdapter};
pub use request_response::RequestResponseAdapter;
pub use state::{AdapterStats, ConnectionStatus};
pub use traits::{AdapterError, EnvelopeHandler, ProtocolAdapter, SharedHandler};
