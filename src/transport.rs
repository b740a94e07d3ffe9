//! Event transport: the interface that moves committed events to
//! asynchronous consumers, and an in-memory implementation.
//!
//! The transport is messaging, not storage. Durability lives in the event
//! store; delivery is at-least-once unless a transport documents
//! stronger, so consumers must be idempotent. Per-aggregate-stream order
//! is preserved; no cross-stream order is promised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::BackendError;
use crate::event::Event;

/// A cancellable stream of events for one consumer.
#[async_trait]
pub trait EventSubscription: Send {
    /// Number of events currently available without blocking.
    async fn depth(&self) -> usize;

    /// Wait for and return the next event. `Ok(None)` means the transport
    /// was closed and the stream is fully drained.
    async fn next(&mut self) -> Result<Option<Event>, BackendError>;
}

/// Moves committed events to subscribed consumers.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Publish a batch of events to all subscriptions.
    async fn publish(&self, events: &[Event]) -> Result<(), BackendError>;

    /// Open a subscription for a processor.
    async fn subscribe(
        &self,
        processor_id: &str,
    ) -> Result<Box<dyn EventSubscription>, BackendError>;
}

struct TransportShared {
    events: Mutex<Vec<Event>>,
    closed: AtomicBool,
    notify: Notify,
}

/// In-memory transport: one global, ordered buffer shared by every
/// subscription.
///
/// The default for tests and single-process deployments. Subscriptions
/// start at the head of the buffer, so a consumer created after events
/// were published still observes them. [`close`](InMemoryEventTransport::close)
/// lets consumers drain and terminate, which keeps executor tests
/// deterministic.
#[derive(Clone)]
pub struct InMemoryEventTransport {
    shared: Arc<TransportShared>,
}

impl Default for InMemoryEventTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TransportShared {
                events: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Stop accepting events and let subscriptions drain to completion.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Total number of events ever published.
    pub fn published(&self) -> usize {
        self.shared.events.lock().expect("transport lock poisoned").len()
    }
}

impl std::fmt::Debug for InMemoryEventTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventTransport")
            .field("published", &self.published())
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl EventTransport for InMemoryEventTransport {
    async fn publish(&self, events: &[Event]) -> Result<(), BackendError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BackendError::permanent("transport is closed"));
        }
        {
            let mut buffer = self.shared.events.lock().expect("transport lock poisoned");
            buffer.extend_from_slice(events);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        _processor_id: &str,
    ) -> Result<Box<dyn EventSubscription>, BackendError> {
        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            index: 0,
        }))
    }
}

/// Index-based cursor over the transport's global buffer.
struct InMemorySubscription {
    shared: Arc<TransportShared>,
    index: usize,
}

#[async_trait]
impl EventSubscription for InMemorySubscription {
    async fn depth(&self) -> usize {
        let events = self.shared.events.lock().expect("transport lock poisoned");
        events.len().saturating_sub(self.index)
    }

    async fn next(&mut self) -> Result<Option<Event>, BackendError> {
        loop {
            // Register for wakeup before checking the buffer so a publish
            // between the check and the await cannot be missed.
            let notified = self.shared.notify.notified();
            {
                let events = self.shared.events.lock().expect("transport lock poisoned");
                if self.index < events.len() {
                    let event = events[self.index].clone();
                    self.index += 1;
                    return Ok(Some(event));
                }
                if self.shared.closed.load(Ordering::SeqCst) {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_fixtures::MoneyDeposited;
    use crate::event::EventData;
    use uuid::Uuid;

    fn event(stream: Uuid, seq: u64, amount: u64) -> Event {
        Event::new(stream, seq, EventData::new(MoneyDeposited { amount }))
    }

    #[tokio::test]
    async fn subscription_sees_prior_events() {
        let transport = InMemoryEventTransport::new();
        let stream = Uuid::new_v4();
        transport.publish(&[event(stream, 1, 10)]).await.unwrap();

        let mut sub = transport.subscribe("p1").await.unwrap();
        assert_eq!(sub.depth().await, 1);
        let received = sub.next().await.unwrap().expect("event available");
        assert_eq!(received.sequence_number, 1);
        assert_eq!(sub.depth().await, 0);
    }

    #[tokio::test]
    async fn next_blocks_until_publish() {
        let transport = InMemoryEventTransport::new();
        let mut sub = transport.subscribe("p1").await.unwrap();

        let publisher = transport.clone();
        let stream = Uuid::new_v4();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish(&[event(stream, 1, 5)]).await.unwrap();
        });

        let received = sub.next().await.unwrap().expect("event should arrive");
        assert_eq!(received.sequence_number, 1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn close_lets_subscribers_drain_then_end() {
        let transport = InMemoryEventTransport::new();
        let stream = Uuid::new_v4();
        transport
            .publish(&[event(stream, 1, 1), event(stream, 2, 2)])
            .await
            .unwrap();
        transport.close();

        let mut sub = transport.subscribe("p1").await.unwrap();
        assert!(sub.next().await.unwrap().is_some());
        assert!(sub.next().await.unwrap().is_some());
        assert!(sub.next().await.unwrap().is_none(), "drained stream ends");
    }

    #[tokio::test]
    async fn publish_after_close_is_rejected() {
        let transport = InMemoryEventTransport::new();
        transport.close();
        let err = transport
            .publish(&[event(Uuid::new_v4(), 1, 1)])
            .await
            .expect_err("closed transport must reject publishes");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn per_stream_order_is_preserved() {
        let transport = InMemoryEventTransport::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        transport.publish(&[event(a, 1, 1)]).await.unwrap();
        transport.publish(&[event(b, 1, 1)]).await.unwrap();
        transport.publish(&[event(a, 2, 2)]).await.unwrap();

        let mut sub = transport.subscribe("p1").await.unwrap();
        let mut a_sequences = Vec::new();
        while let Some(event) = {
            if sub.depth().await == 0 {
                None
            } else {
                sub.next().await.unwrap()
            }
        } {
            if event.aggregate_id == a {
                a_sequences.push(event.sequence_number);
            }
        }
        assert_eq!(a_sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn independent_subscriptions_have_independent_cursors() {
        let transport = InMemoryEventTransport::new();
        let stream = Uuid::new_v4();
        transport.publish(&[event(stream, 1, 1)]).await.unwrap();

        let mut first = transport.subscribe("p1").await.unwrap();
        let mut second = transport.subscribe("p2").await.unwrap();
        assert!(first.next().await.unwrap().is_some());
        // p2's cursor is unaffected by p1's consumption.
        assert_eq!(second.depth().await, 1);
        assert!(second.next().await.unwrap().is_some());
    }
}
