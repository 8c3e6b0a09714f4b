//! In-process broker
//!
//! Durable, priority-ordered queues shared between every adapter holding a
//! clone of the same [`MemoryBroker`]. Used for embedded mode and tests.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Acknowledge, BrokerClient, Delivery, DeliveryStream, Publication};
use crate::transport::traits::AdapterError;

#[derive(Debug, Eq, PartialEq)]
struct Queued {
    priority: u8,
    seq: u64,
    payload: Bytes,
}

impl Ord for Queued {
    // Highest priority first, then oldest first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    messages: BinaryHeap<Queued>,
    notify: Arc<Notify>,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    available: AtomicBool,
    seq: AtomicU64,
    dead_letters: AtomicU64,
}

impl Inner {
    fn ensure_available(&self) -> Result<(), AdapterError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(AdapterError::Connection("broker unavailable".into()))
        }
    }

    fn push(&self, queue: &str, priority: u8, seq: u64, payload: Bytes) {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.messages.push(Queued {
            priority,
            seq,
            payload,
        });
        state.notify.notify_one();
    }
}

/// Shared in-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty, available broker
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                seq: AtomicU64::new(0),
                dead_letters: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate a broker outage (or recovery)
    ///
    /// While unavailable every operation fails and open consumers end with an
    /// error.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
        if !available {
            for state in self.inner.queues.lock().values() {
                state.notify.notify_waiters();
                state.notify.notify_one();
            }
        }
    }

    /// Whether `queue` has been declared
    pub fn is_declared(&self, queue: &str) -> bool {
        self.inner.queues.lock().contains_key(queue)
    }

    /// Number of messages waiting in `queue`
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, |state| state.messages.len())
    }

    /// Priority and payload of the next message in `queue`, without consuming it
    pub fn peek(&self, queue: &str) -> Option<(u8, Bytes)> {
        self.inner
            .queues
            .lock()
            .get(queue)
            .and_then(|state| state.messages.peek())
            .map(|queued| (queued.priority, queued.payload.clone()))
    }

    /// Enqueue a raw payload, bypassing envelope encoding
    pub fn inject(&self, queue: &str, priority: u8, payload: Bytes) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.push(queue, priority, seq, payload);
    }

    /// Messages rejected without requeue
    pub fn dead_letter_count(&self) -> u64 {
        self.inner.dead_letters.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self) -> Result<(), AdapterError> {
        self.inner.ensure_available()
    }

    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), AdapterError> {
        self.inner.ensure_available()?;
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<(), AdapterError> {
        self.inner.ensure_available()?;
        self.inject(&publication.queue, publication.priority, publication.payload);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AdapterError> {
        self.inner.ensure_available()?;
        let inner = Arc::clone(&self.inner);
        let queue = queue.to_string();

        let stream = futures::stream::unfold((inner, queue), |(inner, queue)| async move {
            loop {
                if let Err(e) = inner.ensure_available() {
                    return Some((Err(e), (inner, queue)));
                }

                let notify = {
                    let mut queues = inner.queues.lock();
                    let state = queues.entry(queue.clone()).or_default();
                    match state.messages.pop() {
                        Some(queued) => {
                            let delivery = Delivery {
                                payload: queued.payload.clone(),
                                acker: Box::new(MemoryAck {
                                    inner: Arc::clone(&inner),
                                    queue: queue.clone(),
                                    queued: Some(queued),
                                }),
                            };
                            drop(queues);
                            return Some((Ok(delivery), (inner, queue)));
                        }
                        None => Arc::clone(&state.notify),
                    }
                };

                notify.notified().await;
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Settlement handle; dropped unsettled, the message goes back on its queue
struct MemoryAck {
    inner: Arc<Inner>,
    queue: String,
    queued: Option<Queued>,
}

impl MemoryAck {
    fn requeue(&mut self) {
        if let Some(queued) = self.queued.take() {
            self.inner
                .push(&self.queue, queued.priority, queued.seq, queued.payload);
        }
    }
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), AdapterError> {
        let mut this = self;
        this.queued.take();
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), AdapterError> {
        let mut this = self;
        if requeue {
            this.requeue();
        } else if this.queued.take().is_some() {
            this.inner.dead_letters.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        self.requeue();
    }
}
