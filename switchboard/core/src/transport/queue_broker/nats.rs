//! NATS JetStream broker
//!
//! Each queue maps to one file-backed work-queue stream with a single subject,
//! consumed through a durable explicit-ack pull consumer.

use std::collections::HashSet;

use async_nats::jetstream::{
    self,
    consumer::{self, AckPolicy, DeliverPolicy},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind, Context as JetStreamContext,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::RwLock;

use super::{
    Acknowledge, BrokerClient, Delivery, DeliveryStream, Publication, DELIVERY_MODE_HEADER,
    PRIORITY_HEADER,
};
use crate::transport::config::ProtocolConfig;
use crate::transport::traits::AdapterError;

/// Subject prefix for every queue
const SUBJECT_PREFIX: &str = "switchboard.queue";

/// Stream name prefix for every queue
const STREAM_PREFIX: &str = "SWITCHBOARD";

/// JetStream-backed broker client
pub struct NatsBroker {
    url: String,
    auth_token: Option<String>,
    connect_timeout: std::time::Duration,
    context: RwLock<Option<JetStreamContext>>,
    declared: Mutex<HashSet<String>>,
}

impl NatsBroker {
    /// Create a client for the server named by `config` (not yet connected)
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            url: config.url("nats", "tls"),
            auth_token: config.auth_token.clone(),
            connect_timeout: config.timeout(),
            context: RwLock::new(None),
            declared: Mutex::new(HashSet::new()),
        }
    }

    /// Server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Subject messages for `queue` are published on
    pub fn subject(queue: &str) -> String {
        format!("{SUBJECT_PREFIX}.{queue}")
    }

    /// Stream backing `queue`
    ///
    /// Stream names may not contain `.`, `*`, `>` or whitespace.
    pub fn stream_name(queue: &str) -> String {
        let sanitized: String = queue
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{STREAM_PREFIX}_{sanitized}")
    }

    fn durable_name(queue: &str) -> String {
        format!("{}_consumer", Self::stream_name(queue).to_lowercase())
    }

    async fn context(&self) -> Result<JetStreamContext, AdapterError> {
        self.context
            .read()
            .await
            .clone()
            .ok_or(AdapterError::NotConnected)
    }

    async fn ensure_stream(
        &self,
        context: &JetStreamContext,
        queue: &str,
    ) -> Result<(), AdapterError> {
        if self.declared.lock().contains(queue) {
            return Ok(());
        }

        let stream_name = Self::stream_name(queue);
        let config = StreamConfig {
            name: stream_name.clone(),
            description: Some(format!("switchboard queue {queue}")),
            subjects: vec![Self::subject(queue)],
            retention: RetentionPolicy::WorkQueue,
            storage: StorageType::File,
            ..Default::default()
        };

        context
            .get_or_create_stream(config)
            .await
            .map_err(|e| AdapterError::Connection(format!("declare {stream_name}: {e}")))?;

        tracing::debug!(stream = %stream_name, queue, "Stream ready");
        self.declared.lock().insert(queue.to_string());
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for NatsBroker {
    async fn connect(&self) -> Result<(), AdapterError> {
        let options = match &self.auth_token {
            Some(token) => async_nats::ConnectOptions::with_token(token.clone()),
            None => async_nats::ConnectOptions::new(),
        }
        .connection_timeout(self.connect_timeout);

        let client = options
            .connect(self.url.as_str())
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        *self.context.write().await = Some(jetstream::new(client));
        tracing::debug!(url = %self.url, "Connected to NATS");
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.context.write().await.take();
        self.declared.lock().clear();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), AdapterError> {
        let context = self.context().await?;
        self.ensure_stream(&context, queue).await
    }

    async fn publish(&self, publication: Publication) -> Result<(), AdapterError> {
        let context = self.context().await?;
        self.ensure_stream(&context, &publication.queue).await?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(PRIORITY_HEADER, publication.priority.to_string().as_str());
        if publication.persistent {
            headers.insert(DELIVERY_MODE_HEADER, "persistent");
        }
        for (name, value) in &publication.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        context
            .publish_with_headers(Self::subject(&publication.queue), headers, publication.payload)
            .await
            .map_err(|e| AdapterError::Send(e.to_string()))?
            .await
            .map_err(|e| AdapterError::Send(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AdapterError> {
        let context = self.context().await?;
        self.ensure_stream(&context, queue).await?;

        let consumer_config = consumer::pull::Config {
            durable_name: Some(Self::durable_name(queue)),
            filter_subject: Self::subject(queue),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        };

        let consumer = context
            .get_stream(Self::stream_name(queue))
            .await
            .map_err(|e| AdapterError::Listen(e.to_string()))?
            .get_or_create_consumer(&Self::durable_name(queue), consumer_config)
            .await
            .map_err(|e| AdapterError::Listen(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| AdapterError::Listen(e.to_string()))?;

        let deliveries = messages.map(|message| -> Result<Delivery, AdapterError> {
            let message = message.map_err(|e| AdapterError::Listen(e.to_string()))?;
            Ok(Delivery {
                payload: message.payload.clone(),
                acker: Box::new(NatsAck(message)),
            })
        });

        Ok(Box::pin(deliveries))
    }
}

struct NatsAck(jetstream::Message);

#[async_trait]
impl Acknowledge for NatsAck {
    async fn ack(self: Box<Self>) -> Result<(), AdapterError> {
        self.0
            .ack()
            .await
            .map_err(|e| AdapterError::Send(e.to_string()))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), AdapterError> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        self.0
            .ack_with(kind)
            .await
            .map_err(|e| AdapterError::Send(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::config::ProtocolKind;

    #[test]
    fn test_stream_and_subject_names() {
        assert_eq!(NatsBroker::subject("agent-b"), "switchboard.queue.agent-b");
        assert_eq!(NatsBroker::stream_name("agent.b 1"), "SWITCHBOARD_AGENT_B_1");
        assert_eq!(NatsBroker::durable_name("agent-b"), "switchboard_agent-b_consumer");
    }

    #[test]
    fn test_url_from_config() {
        let config = ProtocolConfig::new(ProtocolKind::QueueBroker, "broker.local", 4222);
        assert_eq!(NatsBroker::new(&config).url(), "nats://broker.local:4222");

        let config = config.with_tls(true);
        assert_eq!(NatsBroker::new(&config).url(), "tls://broker.local:4222");
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let config = ProtocolConfig::new(ProtocolKind::QueueBroker, "127.0.0.1", 4222);
        let broker = NatsBroker::new(&config);

        assert!(matches!(
            broker.declare_queue("q").await,
            Err(AdapterError::NotConnected)
        ));
        assert!(broker.close().await.is_ok());
    }
}
