//! Event bus: coordinates persistence, upcasting, and delivery.
//!
//! `publish` runs write-side upcasting, appends to the store under the
//! optimistic version gate, then hands the batch to the delivery
//! strategy. `load_events` runs read-side upcasting and, under the eager
//! strategy, rewrites upgraded events back to stores that support it.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BackendError, DispatchError};
use crate::event::Event;
use crate::processor::DynProcessor;
use crate::store::EventStore;
use crate::transport::{EventSubscription, EventTransport};
use crate::upcasting::UpcastingPipeline;

/// Strategy for delivering committed events to processors.
#[async_trait]
pub trait EventDelivery: Send + Sync {
    /// Deliver a committed batch.
    async fn deliver(&self, events: &[Event]) -> Result<(), DispatchError>;

    /// Open a subscription for asynchronous consumption.
    async fn subscribe(
        &self,
        processor_id: &str,
    ) -> Result<Box<dyn EventSubscription>, BackendError>;
}

/// Synchronous delivery: subscribers run in the command's own scope.
///
/// Every registered processor's handler is invoked in registration order
/// before the command returns; a subscriber failure fails the command.
/// Events are also published to the transport so that executors and other
/// late consumers can still subscribe.
pub struct SynchronousDelivery {
    transport: Arc<dyn EventTransport>,
    processors: Vec<Arc<dyn DynProcessor>>,
}

impl SynchronousDelivery {
    /// Create a synchronous delivery over `transport` fanning out to
    /// `processors` in order.
    pub fn new(transport: Arc<dyn EventTransport>, processors: Vec<Arc<dyn DynProcessor>>) -> Self {
        Self {
            transport,
            processors,
        }
    }
}

#[async_trait]
impl EventDelivery for SynchronousDelivery {
    async fn deliver(&self, events: &[Event]) -> Result<(), DispatchError> {
        self.transport
            .publish(events)
            .await
            .map_err(DispatchError::Backend)?;

        for event in events {
            for processor in &self.processors {
                processor
                    .handle(event)
                    .await
                    .map_err(DispatchError::Subscriber)?;
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        processor_id: &str,
    ) -> Result<Box<dyn EventSubscription>, BackendError> {
        self.transport.subscribe(processor_id).await
    }
}

/// Asynchronous delivery: publish to the transport and return.
///
/// Processors consume on their own loop through
/// [`EventProcessorExecutor`](crate::executor::EventProcessorExecutor);
/// their failures are invisible to the command caller.
pub struct AsynchronousDelivery {
    transport: Arc<dyn EventTransport>,
}

impl AsynchronousDelivery {
    /// Create an asynchronous delivery over `transport`.
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl EventDelivery for AsynchronousDelivery {
    async fn deliver(&self, events: &[Event]) -> Result<(), DispatchError> {
        self.transport
            .publish(events)
            .await
            .map_err(DispatchError::Backend)
    }

    async fn subscribe(
        &self,
        processor_id: &str,
    ) -> Result<Box<dyn EventSubscription>, BackendError> {
        self.transport.subscribe(processor_id).await
    }
}

/// Entry point for publishing and loading events.
pub struct EventBus {
    store: Arc<dyn EventStore>,
    delivery: Arc<dyn EventDelivery>,
    pipeline: Arc<UpcastingPipeline>,
}

impl EventBus {
    /// Wire a bus from its collaborators.
    pub fn new(
        store: Arc<dyn EventStore>,
        delivery: Arc<dyn EventDelivery>,
        pipeline: Arc<UpcastingPipeline>,
    ) -> Self {
        Self {
            store,
            delivery,
            pipeline,
        }
    }

    /// Upcast (per strategy), append under the version gate, deliver.
    ///
    /// # Errors
    ///
    /// `StoreError::Conflict` through [`DispatchError::Store`] when the
    /// stream moved; subscriber errors through
    /// [`DispatchError::Subscriber`] under synchronous delivery.
    pub async fn publish(
        &self,
        stream_id: Uuid,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, DispatchError> {
        let events = self.pipeline.write_upcast(events)?;
        let committed = self
            .store
            .append(stream_id, expected_version, events.clone())
            .await?;
        self.delivery.deliver(&events).await?;
        Ok(committed)
    }

    /// Load a stream tail with schema evolution applied.
    ///
    /// Under the eager strategy, events whose payload type changed are
    /// rewritten back to the store when it supports rewriting; otherwise
    /// eager degrades to lazy persistence.
    pub async fn load_events(
        &self,
        stream_id: Uuid,
        min_version: u64,
    ) -> Result<Vec<Event>, DispatchError> {
        let raw = self.store.load(stream_id, min_version, None).await?;
        let upcasted = self.pipeline.read_upcast(raw.clone())?;

        if self.pipeline.rewrite_on_load() && self.store.supports_rewrite() {
            let upgraded: Vec<Event> = raw
                .iter()
                .zip(upcasted.iter())
                .filter(|(before, after)| before.payload.type_tag() != after.payload.type_tag())
                .map(|(_, after)| after.clone())
                .collect();
            if !upgraded.is_empty() {
                tracing::debug!(
                    stream_id = %stream_id,
                    count = upgraded.len(),
                    "rewriting upgraded events"
                );
                self.store.rewrite(stream_id, upgraded).await?;
            }
        }

        Ok(upcasted)
    }

    /// Open a subscription through the delivery strategy.
    pub async fn subscribe(
        &self,
        processor_id: &str,
    ) -> Result<Box<dyn EventSubscription>, BackendError> {
        self.delivery.subscribe(processor_id).await
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("strategy", &self.pipeline.strategy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProcessorError, StoreError};
    use crate::event::test_fixtures::{MoneyDeposited, MoneyWithdrawn};
    use crate::event::{EventData, PayloadRegistry};
    use crate::processor::test_fixtures::{DepositLog, WithdrawalRejector};
    use crate::processor::ProcessorRunner;
    use crate::store::InMemoryEventStore;
    use crate::transport::InMemoryEventTransport;
    use crate::upcasting::test_fixtures::{
        v1_to_v2, v2_to_v3, MoneyDepositedV1, MoneyDepositedV2, MoneyDepositedV3,
    };
    use crate::upcasting::UpcastingStrategy;

    fn full_registry() -> Arc<PayloadRegistry> {
        let mut registry = PayloadRegistry::new();
        registry.register::<MoneyDeposited>();
        registry.register::<MoneyWithdrawn>();
        registry.register::<MoneyDepositedV1>();
        registry.register::<MoneyDepositedV2>();
        registry.register::<MoneyDepositedV3>();
        Arc::new(registry)
    }

    fn deposit(stream: Uuid, seq: u64, amount: u64) -> Event {
        Event::new(stream, seq, EventData::new(MoneyDeposited { amount }))
    }

    #[tokio::test]
    async fn sync_delivery_invokes_subscribers_before_returning() {
        let transport = Arc::new(InMemoryEventTransport::new());
        let log = Arc::new(DepositLog::default());
        let delivery = Arc::new(SynchronousDelivery::new(
            transport.clone(),
            vec![Arc::new(ProcessorRunner::new(log.clone()))],
        ));
        let bus = EventBus::new(
            Arc::new(InMemoryEventStore::new(full_registry())),
            delivery,
            Arc::new(UpcastingPipeline::empty()),
        );

        let stream = Uuid::new_v4();
        bus.publish(stream, 0, vec![deposit(stream, 1, 10)])
            .await
            .expect("publish should succeed");

        assert_eq!(log.amounts(), vec![10]);
        assert_eq!(transport.published(), 1);
    }

    #[tokio::test]
    async fn sync_subscriber_failure_fails_the_publish() {
        let transport = Arc::new(InMemoryEventTransport::new());
        let delivery = Arc::new(SynchronousDelivery::new(
            transport,
            vec![Arc::new(ProcessorRunner::new(Arc::new(WithdrawalRejector)))],
        ));
        let store = Arc::new(InMemoryEventStore::new(full_registry()));
        let bus = EventBus::new(store.clone(), delivery, Arc::new(UpcastingPipeline::empty()));

        let stream = Uuid::new_v4();
        let withdrawal = Event::new(stream, 1, EventData::new(MoneyWithdrawn { amount: 1 }));
        let err = bus
            .publish(stream, 0, vec![withdrawal])
            .await
            .expect_err("subscriber failure must surface");
        assert!(matches!(
            err,
            DispatchError::Subscriber(ProcessorError::Permanent(_))
        ));
        // The append itself happened; the inconsistency is healed by
        // processors re-reading from their checkpoint.
        assert_eq!(store.stream_length(stream), 1);
    }

    #[tokio::test]
    async fn async_delivery_skips_inline_processors() {
        let transport = Arc::new(InMemoryEventTransport::new());
        let delivery = Arc::new(AsynchronousDelivery::new(transport.clone()));
        let bus = EventBus::new(
            Arc::new(InMemoryEventStore::new(full_registry())),
            delivery,
            Arc::new(UpcastingPipeline::empty()),
        );

        let stream = Uuid::new_v4();
        bus.publish(stream, 0, vec![deposit(stream, 1, 10)])
            .await
            .expect("publish should succeed");
        assert_eq!(transport.published(), 1);
    }

    #[tokio::test]
    async fn publish_propagates_conflicts() {
        let bus = EventBus::new(
            Arc::new(InMemoryEventStore::new(full_registry())),
            Arc::new(AsynchronousDelivery::new(Arc::new(
                InMemoryEventTransport::new(),
            ))),
            Arc::new(UpcastingPipeline::empty()),
        );

        let stream = Uuid::new_v4();
        bus.publish(stream, 0, vec![deposit(stream, 1, 1)])
            .await
            .expect("first publish succeeds");
        let err = bus
            .publish(stream, 0, vec![deposit(stream, 1, 1)])
            .await
            .expect_err("stale version must conflict");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn lazy_load_upcasts_without_rewriting() {
        let store = Arc::new(InMemoryEventStore::new(full_registry()));
        let pipeline = Arc::new(
            UpcastingPipeline::new(UpcastingStrategy::Lazy, vec![v1_to_v2(), v2_to_v3()])
                .expect("pipeline builds"),
        );
        let bus = EventBus::new(
            store.clone(),
            Arc::new(AsynchronousDelivery::new(Arc::new(
                InMemoryEventTransport::new(),
            ))),
            pipeline,
        );

        let stream = Uuid::new_v4();
        let v1 = Event::new(stream, 1, EventData::new(MoneyDepositedV1 { amount: 100 }));
        bus.publish(stream, 0, vec![v1]).await.expect("publish");

        let loaded = bus.load_events(stream, 0).await.expect("load");
        assert_eq!(loaded[0].payload.type_tag(), "MoneyDeposited.v3");

        // Lazy: storage still holds the original schema.
        let raw = store.load(stream, 0, None).await.expect("raw load");
        assert_eq!(raw[0].payload.type_tag(), "MoneyDeposited.v1");
    }

    #[tokio::test]
    async fn eager_load_rewrites_upgraded_events() {
        let store = Arc::new(InMemoryEventStore::new(full_registry()));
        let pipeline = Arc::new(
            UpcastingPipeline::new(UpcastingStrategy::Eager, vec![v1_to_v2(), v2_to_v3()])
                .expect("pipeline builds"),
        );
        let bus = EventBus::new(
            store.clone(),
            Arc::new(AsynchronousDelivery::new(Arc::new(
                InMemoryEventTransport::new(),
            ))),
            pipeline,
        );

        // Seed a V1 event directly so the write path cannot upgrade it.
        let stream = Uuid::new_v4();
        let v1 = Event::new(stream, 1, EventData::new(MoneyDepositedV1 { amount: 100 }));
        store.append(stream, 0, vec![v1]).await.expect("seed");

        let loaded = bus.load_events(stream, 0).await.expect("load");
        assert_eq!(loaded[0].payload.type_tag(), "MoneyDeposited.v3");

        // Eager + rewrite-capable store: storage was migrated in place.
        let raw = store.load(stream, 0, None).await.expect("raw load");
        assert_eq!(raw[0].payload.type_tag(), "MoneyDeposited.v3");
        assert_eq!(raw[0].sequence_number, 1);
    }

    #[tokio::test]
    async fn eager_degrades_to_lazy_without_rewrite_support() {
        /// Store wrapper that hides rewrite capability.
        struct ReadOnlyRewrite(Arc<InMemoryEventStore>);

        #[async_trait]
        impl EventStore for ReadOnlyRewrite {
            async fn append(
                &self,
                stream_id: Uuid,
                expected_version: u64,
                events: Vec<Event>,
            ) -> Result<u64, StoreError> {
                self.0.append(stream_id, expected_version, events).await
            }

            async fn load(
                &self,
                stream_id: Uuid,
                min_version: u64,
                max_version: Option<u64>,
            ) -> Result<Vec<Event>, StoreError> {
                self.0.load(stream_id, min_version, max_version).await
            }
        }

        let inner = Arc::new(InMemoryEventStore::new(full_registry()));
        let stream = Uuid::new_v4();
        let v1 = Event::new(stream, 1, EventData::new(MoneyDepositedV1 { amount: 1 }));
        inner.append(stream, 0, vec![v1]).await.expect("seed");

        let pipeline = Arc::new(
            UpcastingPipeline::new(UpcastingStrategy::Eager, vec![v1_to_v2()])
                .expect("pipeline builds"),
        );
        let bus = EventBus::new(
            Arc::new(ReadOnlyRewrite(inner.clone())),
            Arc::new(AsynchronousDelivery::new(Arc::new(
                InMemoryEventTransport::new(),
            ))),
            pipeline,
        );

        let loaded = bus.load_events(stream, 0).await.expect("load");
        assert_eq!(loaded[0].payload.type_tag(), "MoneyDeposited.v2");

        // Storage untouched: eager degraded to lazy.
        let raw = inner.load(stream, 0, None).await.expect("raw load");
        assert_eq!(raw[0].payload.type_tag(), "MoneyDeposited.v1");
    }
}
