//! Server role: accepts many WebSocket clients
//!
//! Each accepted client gets an id and one task that both reads its frames
//! and writes frames queued for it. Clients are also reachable under the
//! `sender_id` of the last envelope they sent.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::{decode_inbound, BROADCAST};
use crate::transport::config::ProtocolConfig;
use crate::transport::listener::{Inbound, ListenerHandle};
use crate::transport::state::AdapterShared;
use crate::transport::traits::AdapterError;

/// Frames queued per client before writes start failing
const CLIENT_QUEUE_CAPACITY: usize = 100;

/// How long stopping waits for clients to close, within the listener grace
const CLIENT_DRAIN: Duration = Duration::from_millis(500);

/// Identifier assigned to an accepted client
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a new random id (`client_<hex>`)
    pub fn new() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(format!("client_{}", hex::encode(bytes)))
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, mpsc::Sender<Message>>,
    aliases: HashMap<String, ClientId>,
}

impl Registry {
    fn resolve(&self, target: &str) -> Option<mpsc::Sender<Message>> {
        if let Some(tx) = self.clients.get(target) {
            return Some(tx.clone());
        }
        self.aliases
            .get(target)
            .and_then(|id| self.clients.get(id))
            .cloned()
    }

    fn remove(&mut self, id: &ClientId) {
        self.clients.remove(id);
        self.aliases.retain(|_, owner| owner != id);
    }

    fn clear(&mut self) {
        self.clients.clear();
        self.aliases.clear();
    }
}

type SharedRegistry = Arc<RwLock<Registry>>;

/// Parking place for the bound listener while no accept loop owns it
type ListenerSlot = Arc<Mutex<Option<TcpListener>>>;

pub(super) struct ServerEndpoint {
    bind_addr: String,
    listener: ListenerSlot,
    local_addr: Mutex<Option<SocketAddr>>,
    registry: SharedRegistry,
}

impl ServerEndpoint {
    pub(super) fn new(config: &ProtocolConfig) -> Self {
        Self {
            bind_addr: config.authority(),
            listener: Arc::new(Mutex::new(None)),
            local_addr: Mutex::new(None),
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    pub(super) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub(super) fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.registry.read().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(super) async fn bind(&self) -> Result<(), AdapterError> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        let addr = listener.local_addr()?;

        *self.local_addr.lock() = Some(addr);
        *self.listener.lock() = Some(listener);
        tracing::info!(addr = %addr, "WebSocket server bound");
        Ok(())
    }

    pub(super) fn close(&self) {
        self.listener.lock().take();
        self.registry.write().clear();
    }

    /// Queue a frame for `target` (a client id, a learned alias, or `broadcast`)
    ///
    /// Frames for unknown or departed clients are dropped silently.
    pub(super) async fn write(&self, target: &str, text: String) -> Result<(), AdapterError> {
        let recipients: Vec<mpsc::Sender<Message>> = {
            let registry = self.registry.read();
            if target == BROADCAST {
                registry.clients.values().cloned().collect()
            } else {
                registry.resolve(target).into_iter().collect()
            }
        };

        if recipients.is_empty() {
            tracing::debug!(recipient = %target, "No connected client for target, dropping frame");
            return Ok(());
        }

        for tx in recipients {
            if tx.send(Message::Text(text.clone())).await.is_err() {
                tracing::debug!(recipient = %target, "Client went away before the frame was written");
            }
        }
        Ok(())
    }

    /// Spawn the accept loop over the parked listener
    pub(super) fn spawn_acceptor(
        &self,
        handle: &mut ListenerHandle,
        shared: Arc<AdapterShared>,
    ) -> Result<(), AdapterError> {
        let listener = self.listener.lock().take().ok_or(AdapterError::NotConnected)?;
        let slot = Arc::clone(&self.listener);
        let registry = Arc::clone(&self.registry);
        let token = handle.token();
        let inbound = handle.inbound();

        handle.spawn(async move {
            let kind = shared.kind();
            let mut connections = JoinSet::new();

            loop {
                let accepted = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    Some(_) = connections.join_next(), if !connections.is_empty() => continue,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_client(
                            stream,
                            peer,
                            Arc::clone(&shared),
                            Arc::clone(&registry),
                            inbound.clone(),
                            token.clone(),
                        ));
                    }
                    Err(e) => {
                        shared.stats.record_error();
                        tracing::warn!(protocol = %kind, error = %e, "Accept failed");
                    }
                }
            }

            // Let every client run its close branch and leave the registry.
            let drained = tokio::time::timeout(CLIENT_DRAIN, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(protocol = %kind, "Clients did not close in time, aborting");
                connections.shutdown().await;
            }
            registry.write().clear();

            // Park the listener so listening can resume.
            *slot.lock() = Some(listener);
        });

        Ok(())
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<AdapterShared>,
    registry: SharedRegistry,
    inbound: mpsc::Sender<Inbound>,
    token: CancellationToken,
) {
    let kind = shared.kind();

    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            shared.stats.record_error();
            tracing::warn!(protocol = %kind, peer = %peer, error = %e, "Handshake failed");
            return;
        }
    };

    let id = ClientId::new();
    let (tx, mut outgoing) = mpsc::channel::<Message>(CLIENT_QUEUE_CAPACITY);
    registry.write().clients.insert(id.clone(), tx);
    tracing::info!(protocol = %kind, client = %id, peer = %peer, "Client connected");

    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => {
                let _ = sink.close().await;
                break;
            }
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!(protocol = %kind, client = %id, error = %e, "Write failed");
                    break;
                }
            }
            next = source.next() => {
                let text = match next {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(protocol = %kind, client = %id, error = %e, "Read failed");
                        break;
                    }
                };

                let Some(envelope) = decode_inbound(&shared, &text) else { continue };
                if !envelope.sender_id.is_empty() {
                    registry
                        .write()
                        .aliases
                        .insert(envelope.sender_id.clone(), id.clone());
                }
                if inbound.send(Inbound::fire_and_forget(envelope)).await.is_err() {
                    break;
                }
            }
        }
    }

    registry.write().remove(&id);
    tracing::info!(protocol = %kind, client = %id, "Client disconnected");
}
