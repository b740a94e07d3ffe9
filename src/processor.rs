//! Event processors: the read side's event-handling base.
//!
//! A processor registers typed handlers once in
//! [`EventProcessor::configure`]; routing is permissive, so events with no
//! matching handler are skipped silently (processors only see the subset
//! of the stream they care about). Handlers may request just the payload
//! or the whole envelope.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProcessorError;
use crate::event::{Event, EventPayload};
use crate::routing::{BoxFuture, HandlerMap};

/// A consumer of committed events: side-effect handler, read model, or
/// saga building block.
///
/// Handlers are expected to be idempotent: asynchronous delivery is
/// at-least-once, and the executor re-presents unacknowledged events
/// after a restart. The typical pattern is an upsert on a natural key.
pub trait EventProcessor: Send + Sync + 'static {
    /// Stable processor id, used for subscriptions and checkpoints.
    const PROCESSOR_ID: &'static str;

    /// Register event handlers. Called once per registration.
    fn configure(handlers: &mut EventHandlers<Self>)
    where
        Self: Sized;
}

type EventHandlerFn<P> =
    Box<dyn for<'a> Fn(&'a P, &'a Event) -> BoxFuture<'a, Result<(), ProcessorError>> + Send + Sync>;

/// Registration surface handed to [`EventProcessor::configure`].
pub struct EventHandlers<P> {
    handlers: HandlerMap<EventHandlerFn<P>>,
}

impl<P: EventProcessor> Default for EventHandlers<P> {
    fn default() -> Self {
        Self {
            handlers: HandlerMap::new(),
        }
    }
}

impl<P: EventProcessor> EventHandlers<P> {
    /// Register a synchronous handler receiving just the payload.
    pub fn on<T, F>(&mut self, handler: F)
    where
        T: EventPayload,
        F: Fn(&P, &T) -> Result<(), ProcessorError> + Send + Sync + 'static,
    {
        self.on_envelope(move |processor, _event, payload: &T| handler(processor, payload));
    }

    /// Register a synchronous handler receiving the envelope and payload.
    pub fn on_envelope<T, F>(&mut self, handler: F)
    where
        T: EventPayload,
        F: Fn(&P, &Event, &T) -> Result<(), ProcessorError> + Send + Sync + 'static,
    {
        self.handlers.insert(
            TypeId::of::<T>(),
            T::TYPE_TAG,
            Box::new(move |processor, event| {
                let result = match event.payload.downcast_ref::<T>() {
                    Some(payload) => handler(processor, event, payload),
                    None => Ok(()),
                };
                Box::pin(async move { result })
            }),
        );
    }

    /// Register an asynchronous handler.
    ///
    /// The handler returns a boxed future borrowing the processor and the
    /// event, so implementations write `Box::pin(async move { ... })`.
    pub fn on_async<T, F>(&mut self, handler: F)
    where
        T: EventPayload,
        F: for<'a> Fn(&'a P, &'a Event, &'a T) -> BoxFuture<'a, Result<(), ProcessorError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(
            TypeId::of::<T>(),
            T::TYPE_TAG,
            Box::new(move |processor, event| {
                match event.payload.downcast_ref::<T>() {
                    Some(payload) => handler(processor, event, payload),
                    None => Box::pin(async { Ok(()) }),
                }
            }),
        );
    }

    pub(crate) fn duplicates(&self) -> &[String] {
        self.handlers.duplicates()
    }

    fn resolve(&self, type_id: TypeId) -> Option<&EventHandlerFn<P>> {
        self.handlers.resolve(type_id)
    }
}

impl<P> fmt::Debug for EventHandlers<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// Type-erased processor handle used by synchronous delivery and the
/// executor.
#[async_trait]
pub trait DynProcessor: Send + Sync {
    /// The processor's stable id.
    fn processor_id(&self) -> &'static str;

    /// Route one event to the processor's handler, if any.
    async fn handle(&self, event: &Event) -> Result<(), ProcessorError>;
}

/// Binds a processor instance to its handler table.
pub struct ProcessorRunner<P: EventProcessor> {
    processor: Arc<P>,
    handlers: EventHandlers<P>,
}

impl<P: EventProcessor> ProcessorRunner<P> {
    /// Build the handler table for `P` and bind it to an instance.
    pub fn new(processor: Arc<P>) -> Self {
        let mut handlers = EventHandlers::default();
        P::configure(&mut handlers);
        Self {
            processor,
            handlers,
        }
    }

    /// The wrapped processor instance.
    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    pub(crate) fn duplicate_names(&self) -> Vec<String> {
        self.handlers.duplicates().to_vec()
    }
}

impl<P: EventProcessor> fmt::Debug for ProcessorRunner<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRunner")
            .field("processor_id", &P::PROCESSOR_ID)
            .finish()
    }
}

#[async_trait]
impl<P: EventProcessor> DynProcessor for ProcessorRunner<P> {
    fn processor_id(&self) -> &'static str {
        P::PROCESSOR_ID
    }

    async fn handle(&self, event: &Event) -> Result<(), ProcessorError> {
        match self.handlers.resolve(event.payload.type_id()) {
            Some(handler) => handler(self.processor.as_ref(), event).await,
            None => {
                // Permissive routing: this processor is not interested.
                tracing::trace!(
                    processor_id = P::PROCESSOR_ID,
                    payload_type = event.payload.type_tag(),
                    "no handler, skipping event"
                );
                Ok(())
            }
        }
    }
}
