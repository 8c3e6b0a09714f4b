//! Request-Response Adapter
//!
//! Stateless HTTP transport with no native push channel.
//!
//! # Endpoints
//!
//! - `GET  {base}/health` - liveness check used by `connect`
//! - `POST {base}/agents/{target}/messages` - send one envelope
//! - `GET  {base}/agents/{self}/messages` - poll for inbound envelopes
//!
//! Poll responses are either a JSON array of envelopes or an object of the
//! form `{ "messages": [...] }`. The poll loop runs every `poll_interval_ms`
//! (default 1000) and waits `poll_backoff_ms` (default 5000) after a failed
//! poll instead of giving up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::{ProtocolConfig, ProtocolKind, META_POLL_BACKOFF_MS, META_POLL_INTERVAL_MS};
use super::listener::{Inbound, ListenerHandle};
use super::state::{AdapterShared, AdapterStats, ConnectionStatus};
use super::traits::{AdapterError, ProtocolAdapter, SharedHandler};
use crate::envelope::Envelope;

/// Default poll period
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default wait after a failed poll
pub const DEFAULT_POLL_BACKOFF_MS: u64 = 5000;

/// HTTP client shared by the adapter and its poll loop
#[derive(Clone)]
struct HttpEndpoint {
    client: Client,
    base: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpEndpoint {
    fn new(config: &ProtocolConfig) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(config.timeout())
                .build()
                .unwrap_or_default(),
            base: config.url("http", "https"),
            auth_token: config.auth_token.clone(),
            timeout: config.timeout(),
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, AdapterError> {
        let mut url =
            Url::parse(&self.base).map_err(|e| AdapterError::Connection(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| AdapterError::Connection(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.timeout(self.timeout);
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn health(&self) -> Result<(), AdapterError> {
        let url = self.url(&["health"])?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdapterError::Connection(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    async fn post(&self, target: &str, envelope: &Envelope) -> Result<(), AdapterError> {
        envelope.validate()?;
        let url = self.url(&["agents", target, "messages"])?;

        let response = self
            .authorize(self.client.post(url))
            .json(envelope)
            .send()
            .await
            .map_err(|e| AdapterError::Send(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdapterError::Send(format!("POST returned {}", response.status())))
        }
    }

    async fn fetch(&self, agent_id: &str) -> Result<Vec<Value>, AdapterError> {
        let url = self.url(&["agents", agent_id, "messages"])?;

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| AdapterError::Listen(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AdapterError::Listen(format!("poll returned {}", response.status())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Parse(e.to_string()))?;
        pending_messages(body)
    }
}

/// Pull the message list out of a poll response body
fn pending_messages(body: Value) -> Result<Vec<Value>, AdapterError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("messages") {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(AdapterError::Parse("`messages` is not an array".into())),
        },
        Value::Null => Ok(Vec::new()),
        _ => Err(AdapterError::Parse("unexpected poll response shape".into())),
    }
}

/// Request-response protocol adapter
pub struct RequestResponseAdapter {
    shared: Arc<AdapterShared>,
    http: HttpEndpoint,
}

impl RequestResponseAdapter {
    /// Create an adapter for the HTTP service named by `config`
    pub fn new(agent_id: impl Into<String>, config: ProtocolConfig) -> Self {
        let http = HttpEndpoint::new(&config);
        Self {
            shared: Arc::new(AdapterShared::new(agent_id, config)),
            http,
        }
    }

    /// Base URL every endpoint hangs off
    pub fn base_url(&self) -> &str {
        &self.http.base
    }
}

impl Drop for RequestResponseAdapter {
    fn drop(&mut self) {
        self.shared.listener.abandon();
    }
}

#[async_trait]
impl ProtocolAdapter for RequestResponseAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::RequestResponse
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

        let http = &self.http;
        self.shared.connect_with_retry(|| http.health()).await
    }

    async fn disconnect(&self) -> bool {
        self.shared.listener.stop(self.kind()).await;
        self.shared.status.set(ConnectionStatus::Disconnected);
        tracing::info!(protocol = %self.kind(), "Disconnected");
        true
    }

    async fn send(&self, envelope: &Envelope, target: &str) -> bool {
        let result = if self.shared.status.get() == ConnectionStatus::Connected {
            let stamped = envelope.stamped(&self.shared.agent_id);
            self.http.post(target, &stamped).await
        } else {
            Err(AdapterError::NotConnected)
        };

        match result {
            Ok(()) => {
                self.shared.stats.record_sent();
                tracing::debug!(
                    protocol = %self.kind(),
                    recipient = %target,
                    message_type = %envelope.message_type,
                    "Posted"
                );
                true
            }
            Err(e) => {
                self.shared.stats.record_error();
                tracing::warn!(protocol = %self.kind(), recipient = %target, error = %e, "POST failed");
                false
            }
        }
    }

    async fn start_listening(&self) -> bool {
        if self.is_listening() {
            return true;
        }
        if self.shared.status.get() != ConnectionStatus::Connected {
            tracing::warn!(protocol = %self.kind(), "Cannot poll while not connected");
            return false;
        }

        let config = &self.shared.config;
        let interval = config.meta_millis(META_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS);
        let backoff = config.meta_millis(META_POLL_BACKOFF_MS, DEFAULT_POLL_BACKOFF_MS);

        let shared = Arc::clone(&self.shared);
        let http = self.http.clone();
        self.shared.listener.start_with(move || {
            let mut handle = ListenerHandle::start(Arc::clone(&shared));
            let token = handle.token();
            let inbound = handle.inbound();
            handle.spawn(poll_loop(shared, http, inbound, token, interval, backoff));
            handle
        });

        tracing::info!(
            protocol = %self.kind(),
            interval_ms = interval.as_millis() as u64,
            "Polling for messages"
        );
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

async fn poll_loop(
    shared: Arc<AdapterShared>,
    http: HttpEndpoint,
    inbound: mpsc::Sender<Inbound>,
    token: CancellationToken,
    interval: Duration,
    backoff: Duration,
) {
    let kind = shared.kind();

    loop {
        let fetched = tokio::select! {
            biased;
            () = token.cancelled() => break,
            fetched = http.fetch(&shared.agent_id) => fetched,
        };

        let delay = match fetched {
            Ok(items) => {
                for item in items {
                    match Envelope::from_value(item) {
                        Ok(envelope) => {
                            if inbound.send(Inbound::fire_and_forget(envelope)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            shared.stats.record_error();
                            tracing::warn!(protocol = %kind, error = %e, "Dropping malformed message");
                        }
                    }
                }
                interval
            }
            Err(e) => {
                shared.stats.record_error();
                tracing::warn!(
                    protocol = %kind,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Poll failed, backing off"
                );
                backoff
            }
        };

        tokio::select! {
            biased;
            () = token.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(protocol = %kind, "Poll loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_messages_shapes() {
        assert_eq!(pending_messages(json!([1, 2])).unwrap().len(), 2);
        assert_eq!(pending_messages(json!({"messages": [1]})).unwrap().len(), 1);
        assert!(pending_messages(json!({})).unwrap().is_empty());
        assert!(pending_messages(Value::Null).unwrap().is_empty());
        assert!(pending_messages(json!({"messages": 3})).is_err());
        assert!(pending_messages(json!("nope")).is_err());
    }

    #[test]
    fn test_endpoint_urls() {
        let config = ProtocolConfig::new(ProtocolKind::RequestResponse, "api.local", 8080)
            .with_path("/v1");
        let http = HttpEndpoint::new(&config);

        assert_eq!(http.url(&["health"]).unwrap().as_str(), "http://api.local:8080/v1/health");
        assert_eq!(
            http.url(&["agents", "agent b", "messages"]).unwrap().as_str(),
            "http://api.local:8080/v1/agents/agent%20b/messages"
        );

        let root = HttpEndpoint::new(&ProtocolConfig::new(ProtocolKind::RequestResponse, "h", 1));
        assert_eq!(root.url(&["health"]).unwrap().as_str(), "http://h:1/health");
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let adapter = RequestResponseAdapter::new(
            "agent-a",
            ProtocolConfig::new(ProtocolKind::RequestResponse, "127.0.0.1", 1),
        );
        assert!(!adapter.send(&Envelope::new("t", json!(1), "a"), "agent-b").await);
        assert_eq!(adapter.stats().errors, 1);
        assert!(!adapter.start_listening().await);
    }
}
