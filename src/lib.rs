//! Command Query Responsibility Segregation with event sourcing.
//!
//! `chronicle` turns business logic expressed as commands, events,
//! aggregates, and projections into a running pipeline: commands are
//! routed to a single aggregate instance, aggregate state is rebuilt
//! from an append-only event stream, writes are gated by optimistic
//! concurrency, and committed events reach downstream processors either
//! synchronously or through an event transport.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Aggregate`] | Domain model: handles commands, emits events, applies them to state |
//! | [`ApplicationBuilder`] | Wiring: registries, validation, and the running [`Application`] |
//! | [`CommandBus`] / [`QueryBus`] | Typed dispatch through an ordered middleware chain |
//! | [`EventStore`] | Append-only persistence with per-stream version gating |
//! | [`EventProcessor`] | Event consumer: side effects, read models, workflow steps |
//! | [`Projection`] | Event processor that also serves queries |
//! | [`Saga`] | Stateful, correlated processor with at-most-once steps |
//! | [`UpcastingPipeline`] | Schema evolution for persisted events |
//!
//! # Quick Start
//!
//! ```
//! use chronicle::{
//!     Aggregate, AggregateHandlers, ApplicationBuilder, Command, DomainError, EventPayload,
//! };
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! // 1. Define state, commands, and event payloads.
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Account {
//!     balance: u64,
//! }
//!
//! #[derive(Debug)]
//! struct Deposit {
//!     account_id: Uuid,
//!     amount: u64,
//! }
//!
//! impl Command for Deposit {
//!     type Response = u64;
//!     fn aggregate_id(&self) -> Uuid {
//!         self.account_id
//!     }
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Deposited {
//!     amount: u64,
//! }
//!
//! impl EventPayload for Deposited {
//!     const TYPE_TAG: &'static str = "Deposited";
//! }
//!
//! // 2. Register handlers and appliers explicitly.
//! impl Aggregate for Account {
//!     const AGGREGATE_TYPE: &'static str = "account";
//!
//!     fn configure(handlers: &mut AggregateHandlers<Self>) {
//!         handlers.command(|root, cmd: &Deposit| {
//!             if cmd.amount == 0 {
//!                 return Err(DomainError::new("amount must be positive"));
//!             }
//!             root.emit(Deposited { amount: cmd.amount });
//!             Ok(root.state().balance)
//!         });
//!         handlers.apply(|state, event: &Deposited| state.balance += event.amount);
//!     }
//! }
//!
//! // 3. Build the application and dispatch.
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let app = ApplicationBuilder::new()
//!     .register_payload::<Deposited>()
//!     .register_aggregate::<Account>()
//!     .build()?;
//!
//! let result = app
//!     .dispatch(Deposit {
//!         account_id: Uuid::new_v4(),
//!         amount: 100,
//!     })
//!     .await?;
//! assert_eq!(result.response(), Some(100));
//! # Ok(())
//! # }
//! ```
//!
//! # Delivery modes
//!
//! With [`DeliveryMode::Synchronous`] (the default) every registered
//! processor runs inside the command's scope and a processor failure
//! fails the command. With [`DeliveryMode::Asynchronous`] committed
//! events only reach the [`EventTransport`]; run
//! [`Application::run_processors`] to consume them with checkpointing,
//! lag measurement, catchup, and dead-lettering.

pub mod aggregate;
pub mod application;
pub mod cache;
pub mod checkpoint;
pub mod command;
pub mod command_bus;
pub mod context;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod executor;
pub mod idempotency;
pub mod middleware;
pub mod processor;
pub mod projection;
pub mod query_bus;
pub mod repository;
pub mod routing;
pub mod saga;
pub mod snapshot;
pub mod store;
pub mod testing;
pub mod transport;
pub mod upcasting;

pub use aggregate::{Aggregate, AggregateHandlers, AggregateRoot};
pub use application::{
    Application, ApplicationBuilder, DeliveryMode, Lifecycle, ProcessorOptions,
};
pub use cache::{AggregateCache, CacheStrategy, InMemoryAggregateCache, NullAggregateCache};
pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, ProcessorCheckpoint};
pub use command::{Command, CommandResult};
pub use command_bus::{CommandBus, CommandBusHandle};
pub use context::ExecutionContext;
pub use error::{
    BackendError, BuildError, DispatchError, DomainError, ProcessorError, StoreError, UpcastError,
};
pub use event::{Event, EventData, EventPayload, PayloadRegistry, PersistedEvent};
pub use event_bus::{AsynchronousDelivery, EventBus, EventDelivery, SynchronousDelivery};
pub use executor::{
    CatchupCondition, CatchupOutcome, CatchupStrategy, DeadLetterSink, EventProcessorExecutor,
    ExecutorConfig, FileDeadLetterSink, InMemoryDeadLetterSink, Lag, NoCatchup, ProcessorExecutor,
};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, NullIdempotencyStore};
pub use middleware::{
    ConcurrencyRetryMiddleware, ContextPropagationMiddleware, DispatchEnvelope,
    IdempotencyMiddleware, LoggingMiddleware, MessageKind, Middleware, Next, Outcome,
};
pub use processor::{DynProcessor, EventHandlers, EventProcessor, ProcessorRunner};
pub use projection::{Projection, ProjectionRunner, QueryHandlers};
pub use query_bus::{Query, QueryBus};
pub use repository::{AggregateConfig, AggregateRepository};
pub use routing::BoxFuture;
pub use saga::{InMemorySagaStateStore, Saga, SagaRunner, SagaStateStore, SagaSteps, StepResult};
pub use snapshot::{
    FileSnapshotStore, InMemorySnapshotStore, NullSnapshotStore, Snapshot, SnapshotStore,
    SnapshotStrategy,
};
pub use store::{EventStore, InMemoryEventStore};
pub use testing::{AggregateScenario, ProjectionScenario, SagaScenario};
pub use transport::{EventSubscription, EventTransport, InMemoryEventTransport};
pub use upcasting::{FnUpcaster, Upcaster, UpcastingPipeline, UpcastingStrategy};
