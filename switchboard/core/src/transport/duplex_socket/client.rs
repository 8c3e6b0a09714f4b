//! Client role: one outbound WebSocket

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::decode_inbound;
use crate::transport::config::ProtocolConfig;
use crate::transport::listener::{Inbound, ListenerHandle};
use crate::transport::state::{AdapterShared, ConnectionStatus};
use crate::transport::traits::AdapterError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Parking place for the read half while no receive loop owns it
type SourceSlot = Arc<Mutex<Option<WsSource>>>;

pub(super) struct ClientEndpoint {
    url: String,
    sink: AsyncMutex<Option<WsSink>>,
    source: SourceSlot,
}

impl ClientEndpoint {
    pub(super) fn new(config: &ProtocolConfig) -> Self {
        Self {
            url: config.url("ws", "wss"),
            sink: AsyncMutex::new(None),
            source: Arc::new(Mutex::new(None)),
        }
    }

    pub(super) async fn open(&self, config: &ProtocolConfig) -> Result<(), AdapterError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AdapterError::Connection(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock() = Some(source);

        tracing::debug!(url = %self.url, "WebSocket connected");
        Ok(())
    }

    pub(super) async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!(url = %self.url, error = %e, "Error closing WebSocket");
            }
        }
        self.source.lock().take();
    }

    pub(super) async fn write(&self, text: String) -> Result<(), AdapterError> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(AdapterError::NotConnected)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| AdapterError::Send(e.to_string()))
    }

    /// Spawn the receive loop over the parked read half
    pub(super) fn spawn_receiver(
        &self,
        handle: &mut ListenerHandle,
        shared: Arc<AdapterShared>,
    ) -> Result<(), AdapterError> {
        let source = self.source.lock().take().ok_or(AdapterError::NotConnected)?;
        let slot = Arc::clone(&self.source);
        let token = handle.token();
        let inbound = handle.inbound();

        handle.spawn(async move {
            let kind = shared.kind();
            let mut source = source;

            loop {
                let next = tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        // Park the read half so listening can resume.
                        *slot.lock() = Some(source);
                        return;
                    }
                    next = source.next() => next,
                };

                match next {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(envelope) = decode_inbound(&shared, &text) {
                            if inbound.send(Inbound::fire_and_forget(envelope)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8_lossy(&bytes);
                        if let Some(envelope) = decode_inbound(&shared, &text) {
                            if inbound.send(Inbound::fire_and_forget(envelope)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        shared.status.set(ConnectionStatus::Disconnected);
                        tracing::info!(protocol = %kind, "Server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        shared.stats.record_error();
                        shared.status.set(ConnectionStatus::Error);
                        tracing::error!(protocol = %kind, error = %e, "WebSocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}
