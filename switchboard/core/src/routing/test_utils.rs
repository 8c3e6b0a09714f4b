//! Routing Test Utilities
//!
//! A scriptable in-process adapter for exercising protocol selection and the
//! circuit breakers without any real transport.
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::routing::test_utils::MockAdapter;
//!
//! let broker = MockAdapter::connected(ProtocolKind::QueueBroker);
//! broker.fail_sends(true);
//!
//! // After the test, check which adapter actually saw the send
//! assert_eq!(broker.send_count(), 1);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::transport::state::{StatsRecorder, StatusCell};
use crate::transport::{
    AdapterStats, ConnectionStatus, EnvelopeHandler, ProtocolAdapter, ProtocolKind, SharedHandler,
};

/// Scriptable adapter recording every call
pub struct MockAdapter {
    kind: ProtocolKind,
    status: StatusCell,
    stats: StatsRecorder,
    listening: AtomicBool,
    connect_succeeds: AtomicBool,
    send_succeeds: AtomicBool,
    sent: Mutex<Vec<(Envelope, String)>>,
    handlers: Mutex<HashMap<String, SharedHandler>>,
}

impl MockAdapter {
    /// A disconnected mock whose connects and sends succeed
    pub fn new(kind: ProtocolKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            status: StatusCell::default(),
            stats: StatsRecorder::default(),
            listening: AtomicBool::new(false),
            connect_succeeds: AtomicBool::new(true),
            send_succeeds: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// A mock that is already connected
    pub fn connected(kind: ProtocolKind) -> Arc<Self> {
        let mock = Self::new(kind);
        mock.status.set(ConnectionStatus::Connected);
        mock
    }

    /// Make subsequent sends fail (or succeed again)
    pub fn fail_sends(&self, fail: bool) {
        self.send_succeeds.store(!fail, Ordering::SeqCst);
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn fail_connects(&self, fail: bool) {
        self.connect_succeeds.store(!fail, Ordering::SeqCst);
    }

    /// Force the connection status
    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.set(status);
    }

    /// Number of times `send` reached this adapter
    pub fn send_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Targets of every send, in order
    pub fn sent_targets(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, target)| target.clone()).collect()
    }

    /// Whether a handler is registered for `message_type`
    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.lock().contains_key(message_type)
    }

    /// Invoke the registered handler as if `envelope` had arrived
    pub async fn deliver(&self, envelope: Envelope) -> anyhow::Result<bool> {
        let handler = self.handlers.lock().get(&envelope.message_type).cloned();
        match handler {
            Some(handler) => {
                self.stats.record_received();
                handler.handle(envelope).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> bool {
        self.stats.record_connection_attempt();
        if self.connect_succeeds.load(Ordering::SeqCst) {
            self.status.set(ConnectionStatus::Connected);
            true
        } else {
            self.status.set(ConnectionStatus::Error);
            false
        }
    }

    async fn disconnect(&self) -> bool {
        self.listening.store(false, Ordering::SeqCst);
        self.status.set(ConnectionStatus::Disconnected);
        true
    }

    async fn send(&self, envelope: &Envelope, target: &str) -> bool {
        self.sent.lock().push((envelope.clone(), target.to_string()));
        if self.send_succeeds.load(Ordering::SeqCst) {
            self.stats.record_sent();
            true
        } else {
            self.stats.record_error();
            false
        }
    }

    async fn start_listening(&self) -> bool {
        if self.status.get() != ConnectionStatus::Connected {
            return false;
        }
        self.listening.store(true, Ordering::SeqCst);
        true
    }

    async fn stop_listening(&self) -> bool {
        self.listening.store(false, Ordering::SeqCst);
        true
    }

    fn add_handler(&self, message_type: &str, handler: SharedHandler) {
        self.handlers.lock().insert(message_type.to_string(), handler);
    }

    fn stats(&self) -> AdapterStats {
        self.stats.snapshot()
    }
}
