//! Transport Traits
//!
//! The capability contract every protocol adapter implements, plus the
//! handler trait used for inbound dispatch.
//!
//! Adapter methods never return errors: every transport failure is logged,
//! counted in the adapter's statistics and reported as `false`. Errors of type
//! [`AdapterError`] only travel *inside* an adapter (between its transport
//! seam and its public methods).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::config::ProtocolKind;
use super::state::{AdapterStats, ConnectionStatus};
use crate::envelope::Envelope;

/// Errors raised inside adapters
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Establishing the underlying transport failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Publishing, writing or posting a message failed
    #[error("Send failed: {0}")]
    Send(String),

    /// An inbound payload could not be decoded into an envelope
    #[error("Parse error: {0}")]
    Parse(String),

    /// The receive loop hit an unexpected fault
    #[error("Listen error: {0}")]
    Listen(String),

    /// The operation did not finish within the configured timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The adapter is not connected
    #[error("Not connected")]
    NotConnected,

    /// IO error from the underlying transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Callback invoked for decoded inbound envelopes of one message type
///
/// Closures of the shape `Fn(Envelope) -> impl Future<Output = anyhow::Result<()>>`
/// implement this trait automatically.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Handle one inbound envelope
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self)(envelope).await
    }
}

/// Shared handler reference stored in registries
pub type SharedHandler = Arc<dyn EnvelopeHandler>;

/// Capability contract for one transport
///
/// All methods take `&self` so the manager can keep adapters behind an `Arc`
/// and send while a receive loop is running. Implementations keep their
/// mutable state behind interior locks.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Which transport this adapter speaks
    fn kind(&self) -> ProtocolKind;

    /// Current connection status
    fn status(&self) -> ConnectionStatus;

    /// Whether a receive loop is currently running
    fn is_listening(&self) -> bool;

    /// Establish the transport
    ///
    /// Idempotent when already connected. Retries up to the configured
    /// attempt count; on final failure the status is left at `Error`.
    async fn connect(&self) -> bool;

    /// Release the transport. Never fails when already disconnected.
    async fn disconnect(&self) -> bool;

    /// Serialize and transmit one envelope to `target`
    ///
    /// Returns `false` on any transport error and counts the error.
    async fn send(&self, envelope: &Envelope, target: &str) -> bool;

    /// Start the background receive loop
    async fn start_listening(&self) -> bool;

    /// Stop the background receive loop
    ///
    /// Idempotent. Returns once in-flight receives are cancelled or drained,
    /// bounded by a short grace timeout.
    async fn stop_listening(&self) -> bool;

    /// Register the handler for one inbound message type
    fn add_handler(&self, message_type: &str, handler: SharedHandler);

    /// Snapshot of this adapter's counters
    fn stats(&self) -> AdapterStats;
}

impl fmt::Debug for dyn ProtocolAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolAdapter")
            .field("kind", &self.kind())
            .field("status", &self.status())
            .field("listening", &self.is_listening())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_adapter_error_display() {
        let err = AdapterError::Connection("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = AdapterError::from(io_err);
        assert!(err.to_string().contains("IO error"));

        let err = AdapterError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }

    #[tokio::test]
    async fn test_closure_is_a_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: SharedHandler = Arc::new(move |_env: Envelope| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        handler
            .handle(Envelope::new("ping", json!(1), "a"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
