//! Listener and Dispatch Machinery
//!
//! Every adapter's receive side is built from the same pieces:
//!
//! ```text
//! receive task(s) --Inbound--> mpsc --> dispatch task --> handler
//!        ^                                   |
//!        |                                   v
//!  CancellationToken              completion (ack / reject)
//! ```
//!
//! Receive tasks decode wire payloads and push [`Inbound`] items. The single
//! dispatch task looks up the handler by message type and runs it outside any
//! adapter lock. `stop` cancels the token, then joins each task under a grace
//! timeout and aborts whatever is still running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::ProtocolKind;
use super::state::AdapterShared;
use super::traits::SharedHandler;
use crate::envelope::Envelope;

/// Grace period granted to receive tasks after cancellation
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Capacity of the receive-to-dispatch queue
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Result of dispatching one envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A registered handler accepted the envelope
    Handled,
    /// No handler for the type; the default handler logged it
    Unhandled,
    /// The handler returned an error
    Failed,
}

impl DispatchOutcome {
    /// Whether the transport should acknowledge the message
    #[must_use]
    pub fn should_ack(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// One decoded envelope on its way to dispatch
pub struct Inbound {
    /// The decoded envelope
    pub envelope: Envelope,
    /// Notified with the dispatch outcome, if the transport needs it
    pub completion: Option<oneshot::Sender<DispatchOutcome>>,
}

impl Inbound {
    /// Envelope whose outcome nobody waits for
    pub fn fire_and_forget(envelope: Envelope) -> Self {
        Self {
            envelope,
            completion: None,
        }
    }

    /// Envelope plus a receiver that yields the outcome
    pub fn with_completion(envelope: Envelope) -> (Self, oneshot::Receiver<DispatchOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                envelope,
                completion: Some(tx),
            },
            rx,
        )
    }
}

// ============================================================================
// Handler Registry
// ============================================================================

/// Handlers by message type
pub struct HandlerRegistry {
    kind: ProtocolKind,
    handlers: RwLock<HashMap<String, SharedHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry for one adapter
    pub fn new(kind: ProtocolKind) -> Self {
        Self {
            kind,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the handler for `message_type`
    pub fn insert(&self, message_type: &str, handler: SharedHandler) {
        let replaced = self
            .handlers
            .write()
            .insert(message_type.to_string(), handler)
            .is_some();
        tracing::debug!(protocol = %self.kind, message_type, replaced, "Handler registered");
    }

    /// Whether a handler exists for `message_type`
    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.read().contains_key(message_type)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Run the handler for this envelope's type
    ///
    /// Unregistered types fall through to the default handler, which only logs.
    pub async fn dispatch(&self, envelope: Envelope) -> DispatchOutcome {
        let handler = self.handlers.read().get(&envelope.message_type).cloned();

        let Some(handler) = handler else {
            tracing::debug!(
                protocol = %self.kind,
                message_type = %envelope.message_type,
                sender = %envelope.sender_id,
                "No handler registered, dropping message"
            );
            return DispatchOutcome::Unhandled;
        };

        let message_type = envelope.message_type.clone();
        match handler.handle(envelope).await {
            Ok(()) => DispatchOutcome::Handled,
            Err(e) => {
                tracing::warn!(
                    protocol = %self.kind,
                    message_type = %message_type,
                    error = %e,
                    "Handler failed"
                );
                DispatchOutcome::Failed
            }
        }
    }
}

// ============================================================================
// Listener Handle
// ============================================================================

/// A running receive side: cancellation token, receive tasks and dispatcher
pub struct ListenerHandle {
    token: CancellationToken,
    receivers: Vec<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    inbound: mpsc::Sender<Inbound>,
}

impl ListenerHandle {
    /// Start the dispatch task and return a handle ready for receive tasks
    pub fn start(shared: Arc<AdapterShared>) -> Self {
        let (inbound, mut rx) = mpsc::channel::<Inbound>(INBOUND_QUEUE_CAPACITY);

        let dispatcher = tokio::spawn(async move {
            while let Some(Inbound {
                envelope,
                completion,
            }) = rx.recv().await
            {
                shared.stats.record_received();

                let outcome = shared.handlers.dispatch(envelope).await;
                if outcome == DispatchOutcome::Failed {
                    shared.stats.record_error();
                }
                if let Some(tx) = completion {
                    let _ = tx.send(outcome);
                }
            }
            tracing::debug!(protocol = %shared.kind(), "Dispatcher drained");
        });

        Self {
            token: CancellationToken::new(),
            receivers: Vec::new(),
            dispatcher: Some(dispatcher),
            inbound,
        }
    }

    /// Token receive tasks must watch
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Sender receive tasks push decoded envelopes into
    pub fn inbound(&self) -> mpsc::Sender<Inbound> {
        self.inbound.clone()
    }

    /// Spawn one receive task under this handle
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.receivers.push(tokio::spawn(task));
    }

    /// Whether any receive task is still running
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && self.receivers.iter().any(|task| !task.is_finished())
    }

    /// Cancel everything and join under `grace`, aborting stragglers
    pub async fn shutdown(mut self, kind: ProtocolKind, grace: Duration) {
        self.token.cancel();
        // Dispatcher exits once every sender is gone.
        drop(self.inbound);

        let deadline = tokio::time::Instant::now() + grace;
        let tasks = self.receivers.drain(..).chain(self.dispatcher.take());

        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!(protocol = %kind, "Receive task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

// ============================================================================
// Listener Slot
// ============================================================================

/// Holder for at most one running [`ListenerHandle`]
#[derive(Default)]
pub struct ListenerSlot {
    current: Mutex<Option<ListenerHandle>>,
}

impl ListenerSlot {
    /// Whether a receive loop is currently running
    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(ListenerHandle::is_running)
    }

    /// Install a listener built by `build` unless one is already running
    ///
    /// Returns `false` when a listener was already running (nothing is built).
    /// A finished listener left behind by a loop fault is replaced.
    pub fn start_with(&self, build: impl FnOnce() -> ListenerHandle) -> bool {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(ListenerHandle::is_running) {
            return false;
        }
        if let Some(stale) = current.take() {
            stale.token.cancel();
        }
        *current = Some(build());
        true
    }

    /// Cancel the running listener without waiting for it
    ///
    /// Used when the owning adapter is dropped.
    pub fn abandon(&self) {
        if let Some(handle) = self.current.lock().take() {
            handle.token.cancel();
        }
    }

    /// Stop the running listener, if any
    ///
    /// Safe to call concurrently and repeatedly; callers that find the slot
    /// empty return immediately.
    pub async fn stop(&self, kind: ProtocolKind) -> bool {
        let handle = self.current.lock().take();
        match handle {
            Some(handle) => {
                handle.shutdown(kind, STOP_GRACE).await;
                tracing::info!(protocol = %kind, "Stopped listening");
            }
            None => {
                tracing::debug!(protocol = %kind, "Not listening");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::transport::config::ProtocolConfig;

    fn shared() -> Arc<AdapterShared> {
        Arc::new(AdapterShared::new(
            "agent-a",
            ProtocolConfig::new(ProtocolKind::QueueBroker, "localhost", 4222),
        ))
    }

    #[tokio::test]
    async fn test_dispatch_outcomes() {
        let registry = HandlerRegistry::new(ProtocolKind::QueueBroker);
        registry.insert("ok", Arc::new(|_env: Envelope| async { anyhow::Ok(()) }));
        registry.insert(
            "boom",
            Arc::new(|_env: Envelope| async { Err::<(), _>(anyhow::anyhow!("boom")) }),
        );

        let env = |t: &str| Envelope::new(t, json!(1), "a");
        assert_eq!(registry.dispatch(env("ok")).await, DispatchOutcome::Handled);
        assert_eq!(registry.dispatch(env("boom")).await, DispatchOutcome::Failed);
        assert_eq!(registry.dispatch(env("other")).await, DispatchOutcome::Unhandled);
        assert!(DispatchOutcome::Unhandled.should_ack());
        assert!(!DispatchOutcome::Failed.should_ack());
    }

    #[tokio::test]
    async fn test_listener_dispatches_and_reports_completion() {
        let shared = shared();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        shared.handlers.insert(
            "ping",
            Arc::new(move |_env: Envelope| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
        );

        let mut handle = ListenerHandle::start(Arc::clone(&shared));
        let tx = handle.inbound();
        let token = handle.token();
        handle.spawn(async move { token.cancelled().await });

        let (inbound, done) = Inbound::with_completion(Envelope::new("ping", json!(1), "a"));
        tx.send(inbound).await.unwrap();
        assert_eq!(done.await.unwrap(), DispatchOutcome::Handled);
        drop(tx);

        assert!(handle.is_running());
        handle.shutdown(ProtocolKind::QueueBroker, STOP_GRACE).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(shared.stats.snapshot().messages_received, 1);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_unresponsive_task() {
        let mut handle = ListenerHandle::start(shared());
        // Ignores the token entirely.
        handle.spawn(std::future::pending());

        let started = tokio::time::Instant::now();
        handle
            .shutdown(ProtocolKind::DuplexSocket, Duration::from_millis(50))
            .await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_slot_stop_is_idempotent() {
        let slot = ListenerSlot::default();
        assert!(!slot.is_running());

        let shared = shared();
        let started = slot.start_with(|| {
            let mut handle = ListenerHandle::start(Arc::clone(&shared));
            let token = handle.token();
            handle.spawn(async move { token.cancelled().await });
            handle
        });
        assert!(started);
        assert!(slot.is_running());
        assert!(!slot.start_with(|| unreachable!()));

        assert!(slot.stop(ProtocolKind::QueueBroker).await);
        assert!(!slot.is_running());
        assert!(slot.stop(ProtocolKind::QueueBroker).await);
        assert!(!slot.is_running());
    }
}
