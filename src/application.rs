//! Application wiring: registries, build-time validation, lifecycle.
//!
//! The builder collects explicit registrations (payloads, aggregates,
//! processors, projections, sagas, middleware, upcasters, lifecycle
//! hooks) and `build()` validates the whole configuration before
//! producing a running [`Application`]: no duplicate command or query
//! handlers, no duplicate processor ids, an acyclic upcaster graph.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::aggregate::Aggregate;
use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::command::{Command, CommandResult};
use crate::command_bus::{
    AggregateCommandExecutor, CommandBus, CommandBusHandle, CommandExecutor,
};
use crate::error::{BackendError, BuildError, DispatchError, ProcessorError};
use crate::event::{EventPayload, PayloadRegistry};
use crate::event_bus::{AsynchronousDelivery, EventBus, EventDelivery, SynchronousDelivery};
use crate::executor::{
    CatchupCondition, CatchupStrategy, DeadLetterSink, EventProcessorExecutor, ExecutorConfig,
    NoCatchup, ProcessorExecutor,
};
use crate::middleware::Middleware;
use crate::processor::{DynProcessor, EventProcessor, ProcessorRunner};
use crate::projection::{Projection, ProjectionRunner};
use crate::query_bus::{Query, QueryBus, QueryExecutor};
use crate::repository::{AggregateConfig, AggregateRepository};
use crate::saga::{InMemorySagaStateStore, Saga, SagaRunner, SagaStateStore};
use crate::store::{EventStore, InMemoryEventStore};
use crate::transport::{EventTransport, InMemoryEventTransport};
use crate::upcasting::{Upcaster, UpcastingPipeline, UpcastingStrategy};

/// How committed events reach processors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Subscribers run inside the command's scope; their failures fail
    /// the command. The default for single-process deployments.
    #[default]
    Synchronous,
    /// Events go to the transport only; processors consume on their own
    /// loop via [`Application::run_processors`].
    Asynchronous,
}

/// A dependency participating in the application lifecycle.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Called on startup, in registration order.
    async fn on_startup(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Called on shutdown, in reverse registration order. Failures are
    /// logged and shutdown continues.
    async fn on_shutdown(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Executor policies for one processor registration.
pub struct ProcessorOptions<P> {
    /// When to trigger catchup.
    pub condition: CatchupCondition,
    /// How to catch up when triggered.
    pub strategy: Arc<dyn CatchupStrategy<P>>,
    /// Where permanently failed events go.
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
    /// Batch size and retry budget.
    pub config: ExecutorConfig,
}

impl<P: Send + Sync + 'static> Default for ProcessorOptions<P> {
    fn default() -> Self {
        Self {
            condition: CatchupCondition::Never,
            strategy: Arc::new(NoCatchup),
            dead_letters: None,
            config: ExecutorConfig::default(),
        }
    }
}

struct BuildContext {
    checkpoints: Arc<dyn CheckpointStore>,
    saga_store: Arc<dyn SagaStateStore>,
}

struct BuiltProcessor {
    id: &'static str,
    runner: Arc<dyn DynProcessor>,
    executor: Arc<dyn ProcessorExecutor>,
    queries: Vec<(TypeId, &'static str, Arc<dyn QueryExecutor>)>,
}

type AggregateBuild = Box<
    dyn FnOnce(
            &Arc<EventBus>,
            &mut HashMap<TypeId, Arc<dyn CommandExecutor>>,
        ) -> Result<(), BuildError>
        + Send,
>;

type ProcessorBuild = Box<dyn FnOnce(&BuildContext) -> Result<BuiltProcessor, BuildError> + Send>;

type StoreFactory = Box<dyn FnOnce(Arc<PayloadRegistry>) -> Arc<dyn EventStore> + Send>;

/// Fluent configuration for an [`Application`].
pub struct ApplicationBuilder {
    registry: PayloadRegistry,
    store_factory: Option<StoreFactory>,
    transport: Arc<dyn EventTransport>,
    delivery_mode: DeliveryMode,
    upcasters: Vec<Arc<dyn Upcaster>>,
    upcasting_strategy: UpcastingStrategy,
    middleware: Vec<Arc<dyn Middleware>>,
    aggregates: Vec<AggregateBuild>,
    processors: Vec<ProcessorBuild>,
    lifecycle: Vec<Arc<dyn Lifecycle>>,
    checkpoints: Arc<dyn CheckpointStore>,
    saga_store: Arc<dyn SagaStateStore>,
    command_bus_handle: CommandBusHandle,
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationBuilder {
    /// Start an empty configuration with in-memory defaults: in-memory
    /// event store, transport, checkpoints, and saga state; synchronous
    /// delivery; lazy upcasting.
    pub fn new() -> Self {
        Self {
            registry: PayloadRegistry::new(),
            store_factory: None,
            transport: Arc::new(InMemoryEventTransport::new()),
            delivery_mode: DeliveryMode::Synchronous,
            upcasters: Vec::new(),
            upcasting_strategy: UpcastingStrategy::Lazy,
            middleware: Vec::new(),
            aggregates: Vec::new(),
            processors: Vec::new(),
            lifecycle: Vec::new(),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            saga_store: Arc::new(InMemorySagaStateStore::new()),
            command_bus_handle: CommandBusHandle::new(),
        }
    }

    /// Register a payload type so stores can decode it by tag.
    ///
    /// Every payload that can appear in storage must be registered,
    /// superseded schema versions included.
    pub fn register_payload<P: EventPayload>(mut self) -> Self {
        self.registry.register::<P>();
        self
    }

    /// Use a custom event store. The factory receives the completed
    /// payload registry.
    pub fn event_store(
        mut self,
        factory: impl FnOnce(Arc<PayloadRegistry>) -> Arc<dyn EventStore> + Send + 'static,
    ) -> Self {
        self.store_factory = Some(Box::new(factory));
        self
    }

    /// Use a custom event transport.
    pub fn transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Choose how committed events reach processors.
    pub fn delivery(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Register an upcaster edge in the schema-evolution graph.
    pub fn register_upcaster(mut self, upcaster: Arc<dyn Upcaster>) -> Self {
        self.upcasters.push(upcaster);
        self
    }

    /// Choose when upcasting runs (lazy by default).
    pub fn upcasting_strategy(mut self, strategy: UpcastingStrategy) -> Self {
        self.upcasting_strategy = strategy;
        self
    }

    /// Register a middleware. Order matters: the first registered wraps
    /// everything that follows.
    pub fn register_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Register an aggregate type with default policies (no snapshots,
    /// no caching).
    pub fn register_aggregate<A: Aggregate>(self) -> Self {
        self.register_aggregate_with::<A>(AggregateConfig::default())
    }

    /// Register an aggregate type with explicit backends and policies.
    pub fn register_aggregate_with<A: Aggregate>(mut self, config: AggregateConfig<A>) -> Self {
        self.aggregates.push(Box::new(move |event_bus, executors| {
            let repository = Arc::new(AggregateRepository::<A>::new(
                Arc::clone(event_bus),
                config,
            ));

            let duplicates = repository.handlers().duplicate_names();
            if let Some(first) = duplicates.first() {
                return Err(BuildError::DuplicateHandler {
                    registry: A::AGGREGATE_TYPE,
                    message_type: first.clone(),
                });
            }

            let executor: Arc<dyn CommandExecutor> =
                Arc::new(AggregateCommandExecutor::new(Arc::clone(&repository)));
            for (type_id, name) in repository.handlers().command_types() {
                if executors.insert(type_id, Arc::clone(&executor)).is_some() {
                    return Err(BuildError::DuplicateCommandHandler { command: name });
                }
            }
            Ok(())
        }));
        self
    }

    /// Register an event processor with default executor policies.
    pub fn register_processor<P: EventProcessor>(self, processor: P) -> Self {
        self.register_processor_with(processor, ProcessorOptions::default())
    }

    /// Register an event processor with explicit executor policies.
    pub fn register_processor_with<P: EventProcessor>(
        mut self,
        processor: P,
        options: ProcessorOptions<P>,
    ) -> Self {
        let processor = Arc::new(processor);
        self.processors.push(Box::new(move |ctx| {
            let runner = Arc::new(ProcessorRunner::new(Arc::clone(&processor)));
            check_duplicates(P::PROCESSOR_ID, runner.duplicate_names())?;

            let mut executor =
                EventProcessorExecutor::new(processor, Arc::clone(&ctx.checkpoints))
                    .with_condition(options.condition)
                    .with_strategy(options.strategy)
                    .with_config(options.config);
            if let Some(sink) = options.dead_letters {
                executor = executor.with_dead_letter_sink(sink);
            }

            Ok(BuiltProcessor {
                id: P::PROCESSOR_ID,
                runner,
                executor: Arc::new(executor),
                queries: Vec::new(),
            })
        }));
        self
    }

    /// Register a projection: an event processor that also serves
    /// queries through the query bus.
    pub fn register_projection<P: Projection>(self, projection: P) -> Self {
        self.register_projection_with(projection, ProcessorOptions::default())
    }

    /// Register a projection with explicit executor policies.
    pub fn register_projection_with<P: Projection>(
        mut self,
        projection: P,
        options: ProcessorOptions<P>,
    ) -> Self {
        let projection = Arc::new(projection);
        self.processors.push(Box::new(move |ctx| {
            let runner = Arc::new(ProjectionRunner::new(Arc::clone(&projection)));
            check_duplicates(P::PROCESSOR_ID, runner.duplicate_names())?;

            let queries = runner
                .query_types()
                .into_iter()
                .map(|(type_id, name)| {
                    (type_id, name, Arc::clone(&runner) as Arc<dyn QueryExecutor>)
                })
                .collect();

            let mut executor =
                EventProcessorExecutor::new(projection, Arc::clone(&ctx.checkpoints))
                    .with_condition(options.condition)
                    .with_strategy(options.strategy)
                    .with_config(options.config);
            if let Some(sink) = options.dead_letters {
                executor = executor.with_dead_letter_sink(sink);
            }

            Ok(BuiltProcessor {
                id: P::PROCESSOR_ID,
                runner,
                executor: Arc::new(executor),
                queries,
            })
        }));
        self
    }

    /// Register a saga. Its state lives in the configured saga state
    /// store; compensations dispatch through the builder's
    /// [`command_bus_handle`](ApplicationBuilder::command_bus_handle).
    pub fn register_saga<S: Saga>(mut self, saga: S) -> Self {
        let saga = Arc::new(saga);
        self.processors.push(Box::new(move |ctx| {
            let runner = Arc::new(SagaRunner::new(saga, Arc::clone(&ctx.saga_store)));
            check_duplicates(S::SAGA_TYPE, runner.duplicate_names())?;

            let executor = EventProcessorExecutor::from_parts(
                Arc::clone(&runner),
                Arc::clone(&runner) as Arc<dyn DynProcessor>,
                S::SAGA_TYPE,
                Arc::clone(&ctx.checkpoints),
            );

            Ok(BuiltProcessor {
                id: S::SAGA_TYPE,
                runner,
                executor: Arc::new(executor),
                queries: Vec::new(),
            })
        }));
        self
    }

    /// Register a lifecycle dependency.
    pub fn register_lifecycle(mut self, dependency: Arc<dyn Lifecycle>) -> Self {
        self.lifecycle.push(dependency);
        self
    }

    /// Use a custom checkpoint store for processor executors.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    /// Use a custom saga state store.
    pub fn saga_state_store(mut self, store: Arc<dyn SagaStateStore>) -> Self {
        self.saga_store = store;
        self
    }

    /// A handle to the command bus this builder will produce.
    ///
    /// Hand it to sagas and processors constructed before `build()`;
    /// the builder binds it when the bus exists.
    pub fn command_bus_handle(&self) -> CommandBusHandle {
        self.command_bus_handle.clone()
    }

    /// Validate the configuration and produce a running application.
    ///
    /// # Errors
    ///
    /// [`BuildError`] on duplicate command/query handlers, duplicate
    /// handler registrations inside one component, duplicate processor
    /// ids, or a cyclic upcaster graph.
    pub fn build(self) -> Result<Application, BuildError> {
        let registry = Arc::new(self.registry);
        let pipeline = Arc::new(UpcastingPipeline::new(
            self.upcasting_strategy,
            self.upcasters,
        )?);
        let store: Arc<dyn EventStore> = match self.store_factory {
            Some(factory) => factory(Arc::clone(&registry)),
            None => Arc::new(InMemoryEventStore::new(Arc::clone(&registry))),
        };

        let ctx = BuildContext {
            checkpoints: self.checkpoints,
            saga_store: self.saga_store,
        };
        let mut built = Vec::with_capacity(self.processors.len());
        for make in self.processors {
            built.push(make(&ctx)?);
        }
        let mut seen_ids = std::collections::HashSet::new();
        for processor in &built {
            if !seen_ids.insert(processor.id) {
                return Err(BuildError::DuplicateProcessor {
                    id: processor.id.to_owned(),
                });
            }
        }

        let delivery: Arc<dyn EventDelivery> = match self.delivery_mode {
            DeliveryMode::Synchronous => Arc::new(SynchronousDelivery::new(
                Arc::clone(&self.transport),
                built.iter().map(|p| Arc::clone(&p.runner)).collect(),
            )),
            DeliveryMode::Asynchronous => {
                Arc::new(AsynchronousDelivery::new(Arc::clone(&self.transport)))
            }
        };
        let event_bus = Arc::new(EventBus::new(store, delivery, pipeline));

        let mut command_executors = HashMap::new();
        for register in self.aggregates {
            register(&event_bus, &mut command_executors)?;
        }
        let command_bus = Arc::new(CommandBus::new(self.middleware.clone(), command_executors));
        self.command_bus_handle.bind(Arc::clone(&command_bus));

        let mut query_executors: HashMap<TypeId, Arc<dyn QueryExecutor>> = HashMap::new();
        for processor in &built {
            for (type_id, name, executor) in &processor.queries {
                if query_executors
                    .insert(*type_id, Arc::clone(executor))
                    .is_some()
                {
                    return Err(BuildError::DuplicateQueryHandler { query: *name });
                }
            }
        }
        let query_bus = Arc::new(QueryBus::new(self.middleware, query_executors));

        Ok(Application {
            command_bus,
            query_bus,
            event_bus,
            executors: built.into_iter().map(|p| p.executor).collect(),
            lifecycle: self.lifecycle,
        })
    }
}

impl std::fmt::Debug for ApplicationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationBuilder")
            .field("delivery_mode", &self.delivery_mode)
            .field("aggregates", &self.aggregates.len())
            .field("processors", &self.processors.len())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

fn check_duplicates(registry: &'static str, duplicates: Vec<String>) -> Result<(), BuildError> {
    match duplicates.into_iter().next() {
        Some(message_type) => Err(BuildError::DuplicateHandler {
            registry,
            message_type,
        }),
        None => Ok(()),
    }
}

/// A wired, runnable CQRS application.
pub struct Application {
    command_bus: Arc<CommandBus>,
    query_bus: Arc<QueryBus>,
    event_bus: Arc<EventBus>,
    executors: Vec<Arc<dyn ProcessorExecutor>>,
    lifecycle: Vec<Arc<dyn Lifecycle>>,
}

impl Application {
    /// Dispatch a command through the command bus.
    pub async fn dispatch<C: Command>(
        &self,
        command: C,
    ) -> Result<CommandResult<C::Response>, DispatchError> {
        self.command_bus.dispatch(command).await
    }

    /// Dispatch a query through the query bus.
    pub async fn query<Q: Query>(&self, query: Q) -> Result<Q::Response, DispatchError> {
        self.query_bus.dispatch(query).await
    }

    /// The command bus.
    pub fn command_bus(&self) -> &Arc<CommandBus> {
        &self.command_bus
    }

    /// The query bus.
    pub fn query_bus(&self) -> &Arc<QueryBus> {
        &self.query_bus
    }

    /// The event bus (publish and load events directly).
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Start every lifecycle dependency, in registration order.
    ///
    /// # Errors
    ///
    /// The first startup failure aborts the sequence and surfaces.
    pub async fn startup(&self) -> Result<(), BackendError> {
        for dependency in &self.lifecycle {
            dependency.on_startup().await?;
        }
        Ok(())
    }

    /// Stop every lifecycle dependency, in reverse registration order.
    ///
    /// A failing shutdown hook is logged and the remaining hooks still
    /// run.
    pub async fn shutdown(&self) {
        for dependency in self.lifecycle.iter().rev() {
            if let Err(error) = dependency.on_shutdown().await {
                tracing::warn!(error = %error, "shutdown hook failed; continuing");
            }
        }
    }

    /// Run every registered processor executor against its own
    /// subscription, concurrently, until their subscriptions end.
    ///
    /// With asynchronous delivery this is the consumer side of the
    /// system; run it in its own task for long-lived applications.
    pub async fn run_processors(&self) -> Result<(), ProcessorError> {
        let mut tasks = tokio::task::JoinSet::new();
        for executor in &self.executors {
            let subscription = self.event_bus.subscribe(executor.processor_id()).await?;
            let executor = Arc::clone(executor);
            tasks.spawn(async move { executor.run(subscription).await });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| ProcessorError::Permanent(format!("processor task failed: {e}")))??;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("processors", &self.executors.len())
            .field("lifecycle", &self.lifecycle.len())
            .finish()
    }
}
