//! Transport Factory
//!
//! Builds the adapter variant matching a [`ProtocolConfig`].

use std::sync::Arc;

use super::config::{ProtocolConfig, ProtocolKind};
use super::duplex_socket::DuplexSocketAdapter;
use super::queue_broker::QueueBrokerAdapter;
use super::request_response::RequestResponseAdapter;
use super::traits::ProtocolAdapter;

/// Create the adapter for `config.protocol`, bound to `agent_id`
///
/// The queue broker variant talks to NATS JetStream; use
/// [`QueueBrokerAdapter::with_broker`] to run it over another broker.
pub fn create_adapter(agent_id: &str, config: ProtocolConfig) -> Arc<dyn ProtocolAdapter> {
    match config.protocol {
        ProtocolKind::QueueBroker => Arc::new(QueueBrokerAdapter::new(agent_id, config)),
        ProtocolKind::DuplexSocket => Arc::new(DuplexSocketAdapter::new(agent_id, config)),
        ProtocolKind::RequestResponse => Arc::new(RequestResponseAdapter::new(agent_id, config)),
    }
}
