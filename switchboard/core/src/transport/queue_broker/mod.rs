//! Queue-Broker Adapter
//!
//! Persistent, durable-queue transport. One send is one publish to the
//! target's queue, one receive is one consume from this agent's own queue.
//!
//! The broker itself sits behind [`BrokerClient`] so the adapter logic is
//! the same for a real NATS JetStream server ([`NatsBroker`]) and the
//! in-process [`MemoryBroker`].
//!
//! # Delivery rules
//!
//! - Messages are published persistent, with the numeric priority derived from
//!   the envelope priority (low=1, normal=5, high=8, critical=10)
//! - A payload that does not decode is rejected without requeue
//! - A handler failure rejects without requeue; unhandled types are acked
//! - A fatal consume error moves the adapter to `Error` and ends the loop

mod memory;
mod nats;

pub use memory::MemoryBroker;
pub use nats::NatsBroker;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::{ProtocolConfig, ProtocolKind, META_QUEUE};
use super::listener::{Inbound, ListenerHandle};
use super::state::{AdapterShared, AdapterStats, ConnectionStatus};
use super::traits::{AdapterError, ProtocolAdapter, SharedHandler};
use crate::envelope::Envelope;

/// Header carrying the numeric priority
pub const PRIORITY_HEADER: &str = "X-Priority";
/// Header carrying the delivery mode
pub const DELIVERY_MODE_HEADER: &str = "X-Delivery-Mode";

// ============================================================================
// Broker Seam
// ============================================================================

/// One message to publish
#[derive(Clone, Debug)]
pub struct Publication {
    /// Destination queue (routing key)
    pub queue: String,
    /// Encoded envelope
    pub payload: Bytes,
    /// Numeric priority (1-10)
    pub priority: u8,
    /// Survive broker restarts
    pub persistent: bool,
    /// Extra transport headers
    pub headers: BTreeMap<String, String>,
}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledge: Send {
    /// Confirm successful processing
    async fn ack(self: Box<Self>) -> Result<(), AdapterError>;

    /// Refuse the message, optionally putting it back on the queue
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), AdapterError>;
}

/// One consumed message awaiting settlement
pub struct Delivery {
    /// Raw payload
    pub payload: Bytes,
    /// Settles the delivery
    pub acker: Box<dyn Acknowledge>,
}

/// Stream of deliveries from one queue
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AdapterError>>;

/// Broker operations the adapter needs
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open the logical connection
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Close the logical connection
    async fn close(&self) -> Result<(), AdapterError>;

    /// Declare a durable queue (no-op if it exists)
    async fn declare_queue(&self, queue: &str) -> Result<(), AdapterError>;

    /// Publish one message
    async fn publish(&self, publication: Publication) -> Result<(), AdapterError>;

    /// Start consuming from a declared queue
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AdapterError>;
}

// ============================================================================
// Adapter
// ============================================================================

/// Queue-broker protocol adapter
pub struct QueueBrokerAdapter {
    shared: Arc<AdapterShared>,
    broker: Arc<dyn BrokerClient>,
    queue: String,
}

impl QueueBrokerAdapter {
    /// Create an adapter talking to a NATS JetStream server
    pub fn new(agent_id: impl Into<String>, config: ProtocolConfig) -> Self {
        let broker = Arc::new(NatsBroker::new(&config));
        Self::with_broker(agent_id, config, broker)
    }

    /// Create an adapter over any broker implementation
    pub fn with_broker(
        agent_id: impl Into<String>,
        config: ProtocolConfig,
        broker: Arc<dyn BrokerClient>,
    ) -> Self {
        let agent_id = agent_id.into();
        let queue = config
            .meta(META_QUEUE)
            .map_or_else(|| agent_id.clone(), str::to_string);
        Self {
            shared: Arc::new(AdapterShared::new(agent_id, config)),
            broker,
            queue,
        }
    }

    /// Name of this adapter's own inbound queue
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn publish(&self, envelope: &Envelope, target: &str) -> Result<(), AdapterError> {
        if self.shared.status.get() != ConnectionStatus::Connected {
            return Err(AdapterError::NotConnected);
        }

        let stamped = envelope.stamped(&self.shared.agent_id);
        let mut headers = BTreeMap::new();
        if let Some(correlation_id) = &stamped.correlation_id {
            headers.insert("X-Correlation-Id".to_string(), correlation_id.clone());
        }

        let publication = Publication {
            queue: target.to_string(),
            payload: Bytes::from(stamped.to_wire()?),
            priority: stamped.priority.broker_priority(),
            persistent: true,
            headers,
        };

        let timeout = self.shared.config.timeout();
        tokio::time::timeout(timeout, self.broker.publish(publication))
            .await
            .map_err(|_| AdapterError::Timeout(timeout))?
    }
}

impl Drop for QueueBrokerAdapter {
    fn drop(&mut self) {
        self.shared.listener.abandon();
    }
}

#[async_trait]
impl ProtocolAdapter for QueueBrokerAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::QueueBroker
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.status.get()
    }

    fn is_listening(&self) -> bool {
        self.shared.listener.is_running()
    }

    async fn connect(&self) -> bool {
        if self.shared.status.get() == ConnectionStatus::Connected {
            return true;
        }

        let broker = &self.broker;
        let queue = &self.queue;
        self.shared
            .connect_with_retry(|| async move {
                broker.connect().await?;
                broker.declare_queue(queue).await
            })
            .await
    }

    async fn disconnect(&self) -> bool {
        self.shared.listener.stop(self.kind()).await;

        if let Err(e) = self.broker.close().await {
            tracing::warn!(protocol = %self.kind(), error = %e, "Error closing broker connection");
        }
        self.shared.status.set(ConnectionStatus::Disconnected);
        tracing::info!(protocol = %self.kind(), "Disconnected");
        true
    }

    async fn send(&self, envelope: &Envelope, target: &str) -> bool {
        match self.publish(envelope, target).await {
            Ok(()) => {
                self.shared.stats.record_sent();
                tracing::debug!(
                    protocol = %self.kind(),
                    recipient = %target,
                    message_type = %envelope.message_type,
                    priority = %envelope.priority,
                    "Published"
                );
                true
            }
            Err(e) => {
                self.shared.stats.record_error();
                tracing::warn!(protocol = %self.kind(), recipient = %target, error = %e, "Publish failed");
                false
            }
        }
    }

    async fn start_listening(&self) -> bool {
        if self.is_listening() {
            return true;
        }
        if self.shared.status.get() != ConnectionStatus::Connected {
            tracing::warn!(protocol = %self.kind(), "Cannot listen while not connected");
            return false;
        }

        let deliveries = match self.broker.consume(&self.queue).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.shared.stats.record_error();
                tracing::warn!(protocol = %self.kind(), queue = %self.queue, error = %e, "Consume failed");
                return false;
            }
        };

        let shared = Arc::clone(&self.shared);
        self.shared.listener.start_with(move || {
            let mut handle = ListenerHandle::start(Arc::clone(&shared));
            let token = handle.token();
            let inbound = handle.inbound();
            handle.spawn(consume_loop(shared, deliveries, inbound, token));
            handle
        });

        tracing::info!(protocol = %self.kind(), queue = %self.queue, "Listening");
        true
    }

    async fn stop_listening(&self) -> bool {
        self.shared.listener.stop(self.kind()).await
    }

    fn add_handler(&self, message_type: &str, handler: SharedHandler) {
        self.shared.handlers.insert(message_type, handler);
    }

    fn stats(&self) -> AdapterStats {
        self.shared.stats.snapshot()
    }
}

// ============================================================================
// Consume Loop
// ============================================================================

async fn consume_loop(
    shared: Arc<AdapterShared>,
    mut deliveries: DeliveryStream,
    inbound: mpsc::Sender<Inbound>,
    token: CancellationToken,
) {
    let kind = shared.kind();

    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if !settle(&shared, delivery, &inbound, &token).await {
                    break;
                }
            }
            Some(Err(e)) => {
                shared.stats.record_error();
                shared.status.set(ConnectionStatus::Error);
                tracing::error!(protocol = %kind, error = %e, "Consume loop failed");
                break;
            }
            None => {
                shared.status.set(ConnectionStatus::Error);
                tracing::error!(protocol = %kind, "Consumer stream ended");
                break;
            }
        }
    }

    tracing::debug!(protocol = %kind, "Consume loop exited");
}

/// Decode, dispatch and settle one delivery. Returns `false` to stop the loop.
async fn settle(
    shared: &AdapterShared,
    delivery: Delivery,
    inbound: &mpsc::Sender<Inbound>,
    token: &CancellationToken,
) -> bool {
    let kind = shared.kind();
    let Delivery { payload, acker } = delivery;

    let envelope = match Envelope::from_wire(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            shared.stats.record_error();
            tracing::warn!(protocol = %kind, error = %e, "Rejecting undecodable message");
            if let Err(e) = acker.reject(false).await {
                tracing::warn!(protocol = %kind, error = %e, "Reject failed");
            }
            return true;
        }
    };

    let (item, done) = Inbound::with_completion(envelope);
    if inbound.send(item).await.is_err() {
        if let Err(e) = acker.reject(true).await {
            shared.stats.record_error();
            tracing::warn!(protocol = %kind, error = %e, "Failed to requeue message");
        }
        return false;
    }

    let outcome = tokio::select! {
        biased;
        // Dropping the acker unsettled puts the message back on the queue.
        () = token.cancelled() => return false,
        outcome = done => outcome,
    };

    let settled = match outcome {
        Ok(outcome) if outcome.should_ack() => acker.ack().await,
        Ok(_) => acker.reject(false).await,
        Err(_) => acker.reject(true).await,
    };
    if let Err(e) = settled {
        shared.stats.record_error();
        tracing::warn!(protocol = %kind, error = %e, "Failed to settle message");
    }
    true
}
