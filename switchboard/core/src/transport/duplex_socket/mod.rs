//! Duplex-Socket Adapter
//!
//! Persistent bidirectional WebSocket transport, operable as a client (one
//! outbound socket) or a server (many inbound sockets tracked by client id).
//! The role comes from the `mode` metadata key.
//!
//! Every message travels as one JSON text frame:
//!
//! ```text
//! { "type": "envelope", "target": "agent-b", "message": { ...envelope... } }
//! ```
//!
//! Frames of any other `type` are ignored. Frames that are not valid JSON or
//! carry an invalid envelope are counted as errors and dropped.

mod client;
mod server;

pub use server::ClientId;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::{ProtocolConfig, ProtocolKind, SocketRole};
use super::listener::ListenerHandle;
use super::state::{AdapterShared, AdapterStats, ConnectionStatus};
use super::traits::{AdapterError, ProtocolAdapter, SharedHandler};
use crate::envelope::Envelope;
use client::ClientEndpoint;
use server::ServerEndpoint;

/// Target naming every connected client (server mode)
pub const BROADCAST: &str = "broadcast";

/// Frame `type` carrying an envelope
pub const ENVELOPE_FRAME: &str = "envelope";

/// Wire frame wrapping one envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SocketFrame {
    /// Frame type, always `envelope` for frames this adapter writes
    #[serde(rename = "type")]
    pub frame_type: String,

    /// Intended recipient
    #[serde(default)]
    pub target: Option<String>,

    /// The envelope itself
    pub message: Envelope,
}

impl SocketFrame {
    /// Wrap an envelope for `target`
    pub fn envelope(message: Envelope, target: &str) -> Self {
        Self {
            frame_type: ENVELOPE_FRAME.to_string(),
            target: Some(target.to_string()),
            message,
        }
    }

    /// Encode as a text frame body
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Parse` if the envelope is incomplete.
    pub fn encode(&self) -> Result<String, AdapterError> {
        self.message.validate()?;
        serde_json::to_string(self).map_err(|e| AdapterError::Parse(e.to_string()))
    }

    /// Decode a text frame body
    ///
    /// Returns `Ok(None)` for well-formed frames of another type.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Parse` on malformed JSON or an invalid envelope.
    pub fn decode(text: &str) -> Result<Option<Envelope>, AdapterError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| AdapterError::Parse(e.to_string()))?;

        match value.get("type").and_then(Value::as_str) {
            Some(ENVELOPE_FRAME) => {}
            Some(_) => return Ok(None),
            None => return Err(AdapterError::Parse("frame without type".into())),
        }

        let message = value
            .get("message")
            .cloned()
            .ok_or_else(|| AdapterError::Parse("envelope frame without message".into()))?;
        Envelope::from_value(message).map(Some)
    }
}

/// Decode one inbound frame, counting failures
fn decode_inbound(shared: &AdapterShared, text: &str) -> Option<Envelope> {
    match SocketFrame::decode(text) {
        Ok(Some(envelope)) => Some(envelope),
        Ok(None) => {
            tracing::debug!(protocol = %shared.kind(), "Ignoring non-envelope frame");
            None
        }
        Err(e) => {
            shared.stats.record_error();
            tracing::warn!(protocol = %shared.kind(), error = %e, "Dropping malformed frame");
            None
        }
    }
}

enum Endpoint {
    Client(ClientEndpoint),
    Server(ServerEndpoint),
}

/// Duplex-socket protocol adapter
pub struct DuplexSocketAdapter {
    shared: Arc<AdapterShared>,
    endpoint: Endpoint,
}

impl DuplexSocketAdapter {
    /// Create an adapter in the role named by the `mode` metadata key
    pub fn new(agent_id: impl Into<String>, config: ProtocolConfig) -> Self {
        let endpoint = match config.socket_role() {
            SocketRole::Client => Endpoint::Client(ClientEndpoint::new(&config)),
            SocketRole::Server => Endpoint::Server(ServerEndpoint::new(&config)),
        };
        Self {
            shared: Arc::new(AdapterShared::new(agent_id, config)),
            endpoint,
        }
    }

    /// Role this adapter plays
    pub fn role(&self) -> SocketRole {
        match self.endpoint {
            Endpoint::Client(_) => SocketRole::Client,
            Endpoint::Server(_) => SocketRole::Server,
        }
    }

    /// Bound address (server mode, after connect)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Client(_) => None,
            Endpoint::Server(server) => server.local_addr(),
        }
    }

    /// Ids of the currently connected clients (server mode)
    pub fn connected_clients(&self) -> Vec<ClientId> {
        match &self.endpoint {
            Endpoint::Client(_) => Vec::new(),
            Endpoint::Server(server) => server.client_ids(),
        }
    }

    async fn transmit(&self, envelope: &Envelope, target: &str) -> Result<(), AdapterError> {
        if self.shared.status.get() != ConnectionStatus::Connected {
            return Err(AdapterError::NotConnected);
        }

        let frame = SocketFrame::envelope(envelope.stamped(&self.shared.agent_id), target);
        let text = frame.encode()?;
        let timeout = self.shared.config.timeout();

        let write = async {
            match &self.endpoint {
                Endpoint::Client(client) => client.write(text).await,
                Endpoint::Server(server) => server.write(target, text).await,
            }
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| AdapterError::Timeout(timeout))?
    }
}

impl Drop for DuplexSocketAdapter {
    fn drop(&mut self) {
        self.shared.listener.abandon();
    }
}

#[async_trait]
impl ProtocolAdapter for DuplexSocketAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::DuplexSocket
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

        let shared = &self.shared;
        let endpoint = &self.endpoint;
        shared
            .connect_with_retry(|| async move {
                match endpoint {
                    Endpoint::Client(client) => client.open(&shared.config).await,
                    Endpoint::Server(server) => server.bind().await,
                }
            })
            .await
    }

    async fn disconnect(&self) -> bool {
        self.shared.listener.stop(self.kind()).await;

        match &self.endpoint {
            Endpoint::Client(client) => client.close().await,
            Endpoint::Server(server) => server.close(),
        }
        self.shared.status.set(ConnectionStatus::Disconnected);
        tracing::info!(protocol = %self.kind(), "Disconnected");
        true
    }

    async fn send(&self, envelope: &Envelope, target: &str) -> bool {
        match self.transmit(envelope, target).await {
            Ok(()) => {
                self.shared.stats.record_sent();
                tracing::debug!(
                    protocol = %self.kind(),
                    recipient = %target,
                    message_type = %envelope.message_type,
                    "Frame written"
                );
                true
            }
            Err(e) => {
                self.shared.stats.record_error();
                tracing::warn!(protocol = %self.kind(), recipient = %target, error = %e, "Socket send failed");
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

        let shared = Arc::clone(&self.shared);
        let mut spawn_result = Ok(());
        self.shared.listener.start_with(|| {
            let mut handle = ListenerHandle::start(Arc::clone(&shared));
            spawn_result = match &self.endpoint {
                Endpoint::Client(client) => client.spawn_receiver(&mut handle, shared),
                Endpoint::Server(server) => server.spawn_acceptor(&mut handle, shared),
            };
            handle
        });

        match spawn_result {
            Ok(()) => {
                tracing::info!(protocol = %self.kind(), role = ?self.role(), "Listening");
                true
            }
            Err(e) => {
                self.shared.listener.stop(self.kind()).await;
                tracing::warn!(protocol = %self.kind(), error = %e, "Cannot start listening");
                false
            }
        }
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
