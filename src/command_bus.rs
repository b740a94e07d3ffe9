//! Command bus: validation, middleware chain, and the aggregate terminal.
//!
//! Dispatch validates the command, wraps it in an envelope with a fresh
//! command id and an execution context inherited from the command's
//! tracing fields, runs the middleware chain, and finishes in
//! `DelegateToAggregate`: resolve the target repository by the command's
//! runtime type, open a scope, let the aggregate handle it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::{Command, CommandResult};
use crate::error::{BackendError, DispatchError};
use crate::middleware::{DispatchEnvelope, Middleware, Next, Outcome, TerminalHandler};
use crate::repository::AggregateRepository;
use crate::routing::BoxFuture;

/// Type-erased executor binding one aggregate type's repository.
pub(crate) trait CommandExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        envelope: &'a DispatchEnvelope,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>, DispatchError>>;
}

/// Executor routing any of an aggregate's commands through its
/// repository scope.
pub(crate) struct AggregateCommandExecutor<A: Aggregate> {
    repository: Arc<AggregateRepository<A>>,
}

impl<A: Aggregate> AggregateCommandExecutor<A> {
    pub(crate) fn new(repository: Arc<AggregateRepository<A>>) -> Self {
        Self { repository }
    }
}

impl<A: Aggregate> CommandExecutor for AggregateCommandExecutor<A> {
    fn execute<'a>(
        &'a self,
        envelope: &'a DispatchEnvelope,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>, DispatchError>> {
        Box::pin(async move {
            let aggregate_id = envelope
                .aggregate_id()
                .expect("command envelopes always carry an aggregate id");
            let type_id = envelope.type_id();
            let type_name = envelope.type_name();
            self.repository
                .execute(aggregate_id, envelope.context(), move |root| {
                    root.handle_erased(type_id, type_name, envelope.message())
                })
                .await
        })
    }
}

/// The terminal handler: route by command type to the owning aggregate.
pub(crate) struct DelegateToAggregate {
    executors: HashMap<TypeId, Arc<dyn CommandExecutor>>,
}

impl DelegateToAggregate {
    pub(crate) fn new(executors: HashMap<TypeId, Arc<dyn CommandExecutor>>) -> Self {
        Self { executors }
    }
}

#[async_trait]
impl TerminalHandler for DelegateToAggregate {
    async fn handle(&self, envelope: DispatchEnvelope) -> Result<Outcome, DispatchError> {
        let executor = self
            .executors
            .get(&envelope.type_id())
            .ok_or(DispatchError::NoHandler {
                message_type: envelope.type_name(),
            })?;
        let response = executor.execute(&envelope).await?;
        Ok(Outcome::Completed(response))
    }
}

/// Routes commands through the middleware chain to aggregates.
pub struct CommandBus {
    middleware: Vec<Arc<dyn Middleware>>,
    delegate: DelegateToAggregate,
}

impl CommandBus {
    pub(crate) fn new(
        middleware: Vec<Arc<dyn Middleware>>,
        executors: HashMap<TypeId, Arc<dyn CommandExecutor>>,
    ) -> Self {
        Self {
            middleware,
            delegate: DelegateToAggregate::new(executors),
        }
    }

    /// Dispatch a command and wait for its result.
    ///
    /// Every backend call on the way is an `.await` suspension point, so
    /// the whole dispatch composes with tokio cancellation (`timeout`,
    /// `select!`, drop); the event store append itself is atomic.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::Validation`] -- structural validation failed or
    ///   the aggregate id is nil; nothing was loaded.
    /// * [`DispatchError::NoHandler`] -- no aggregate handles this type.
    /// * [`DispatchError::Domain`] -- the aggregate rejected the command.
    /// * [`DispatchError::Store`] -- append failed (including version
    ///   conflicts, unless retried away by middleware).
    pub async fn dispatch<C: Command>(
        &self,
        command: C,
    ) -> Result<CommandResult<C::Response>, DispatchError> {
        command.validate().map_err(DispatchError::Validation)?;
        if command.aggregate_id().is_nil() {
            return Err(DispatchError::Validation(
                "aggregate id must be non-nil".into(),
            ));
        }

        let command_id = Uuid::new_v4();
        let envelope = DispatchEnvelope::for_command(command, command_id);
        let next = Next::new(&self.middleware, &self.delegate);
        match next.run(envelope).await? {
            Outcome::Completed(response) => Ok(CommandResult::Completed(
                *response
                    .downcast::<C::Response>()
                    .expect("terminal handler returns the command's declared response type"),
            )),
            Outcome::AlreadyProcessed => Ok(CommandResult::AlreadyProcessed),
        }
    }
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus")
            .field("middleware", &self.middleware.len())
            .field("commands", &self.delegate.executors.len())
            .finish()
    }
}

/// Late-bound, cloneable handle to the command bus.
///
/// Sagas and other event processors are constructed before the bus
/// exists; they hold a handle instead, and the application builder binds
/// it during `build()`. Dispatching through an unbound handle is an
/// error, not a panic.
#[derive(Clone, Default)]
pub struct CommandBusHandle {
    inner: Arc<OnceLock<Arc<CommandBus>>>,
}

impl CommandBusHandle {
    /// Create an unbound handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the handle to a bus. Later binds are ignored.
    pub fn bind(&self, bus: Arc<CommandBus>) {
        let _ = self.inner.set(bus);
    }

    /// Whether the handle has been bound.
    pub fn is_bound(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Dispatch through the bound bus.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Backend`] when the handle is not bound yet, plus
    /// everything [`CommandBus::dispatch`] surfaces.
    pub async fn dispatch<C: Command>(
        &self,
        command: C,
    ) -> Result<CommandResult<C::Response>, DispatchError> {
        let bus = self.inner.get().ok_or_else(|| {
            DispatchError::Backend(BackendError::permanent("command bus handle is not bound"))
        })?;
        bus.dispatch(command).await
    }
}

impl std::fmt::Debug for CommandBusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBusHandle")
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{BankAccount, Deposit, Withdraw};
    use crate::event::test_fixtures::{MoneyDeposited, MoneyWithdrawn};
    use crate::event::PayloadRegistry;
    use crate::idempotency::IdempotencyStore;
    use crate::event_bus::{AsynchronousDelivery, EventBus};
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::middleware::IdempotencyMiddleware;
    use crate::repository::AggregateConfig;
    use crate::store::InMemoryEventStore;
    use crate::transport::InMemoryEventTransport;
    use crate::upcasting::UpcastingPipeline;

    fn account_bus(middleware: Vec<Arc<dyn Middleware>>) -> (CommandBus, Arc<InMemoryEventStore>) {
        let mut registry = PayloadRegistry::new();
        registry.register::<MoneyDeposited>();
        registry.register::<MoneyWithdrawn>();
        let store = Arc::new(InMemoryEventStore::new(Arc::new(registry)));
        let event_bus = Arc::new(EventBus::new(
            store.clone(),
            Arc::new(AsynchronousDelivery::new(Arc::new(
                InMemoryEventTransport::new(),
            ))),
            Arc::new(UpcastingPipeline::empty()),
        ));
        let repository = Arc::new(AggregateRepository::<BankAccount>::new(
            event_bus,
            AggregateConfig::default(),
        ));

        let mut executors: HashMap<TypeId, Arc<dyn CommandExecutor>> = HashMap::new();
        let executor: Arc<dyn CommandExecutor> =
            Arc::new(AggregateCommandExecutor::new(repository.clone()));
        for (type_id, _name) in repository.handlers().command_types() {
            executors.insert(type_id, Arc::clone(&executor));
        }
        (CommandBus::new(middleware, executors), store)
    }

    #[tokio::test]
    async fn dispatch_returns_typed_response() {
        let (bus, store) = account_bus(vec![]);
        let id = Uuid::new_v4();

        let result = bus
            .dispatch(Deposit::new(id, 100))
            .await
            .expect("deposit should succeed");
        assert_eq!(result.response(), Some(100));
        assert_eq!(store.stream_length(id), 1);

        let result = bus
            .dispatch(Withdraw {
                account_id: id,
                amount: 30,
            })
            .await
            .expect("withdraw should succeed");
        assert_eq!(result.response(), Some(70));
    }

    #[tokio::test]
    async fn nil_aggregate_id_is_rejected_before_load() {
        let (bus, store) = account_bus(vec![]);
        let err = bus
            .dispatch(Deposit::new(Uuid::nil(), 1))
            .await
            .expect_err("nil aggregate id is invalid");
        assert!(matches!(err, DispatchError::Validation(_)));
        assert_eq!(store.stream_length(Uuid::nil()), 0);
    }

    #[tokio::test]
    async fn unrouted_command_is_no_handler() {
        #[derive(Debug)]
        struct Freeze {
            account_id: Uuid,
        }
        impl Command for Freeze {
            type Response = ();
            fn aggregate_id(&self) -> Uuid {
                self.account_id
            }
        }

        let (bus, _store) = account_bus(vec![]);
        let err = bus
            .dispatch(Freeze {
                account_id: Uuid::new_v4(),
            })
            .await
            .expect_err("nothing handles Freeze");
        assert!(matches!(err, DispatchError::NoHandler { .. }));
    }

    #[tokio::test]
    async fn domain_rejection_surfaces() {
        let (bus, _store) = account_bus(vec![]);
        let err = bus
            .dispatch(Withdraw {
                account_id: Uuid::new_v4(),
                amount: 1,
            })
            .await
            .expect_err("overdraft");
        assert!(matches!(err, DispatchError::Domain(_)));
    }

    #[tokio::test]
    async fn idempotent_dispatch_through_the_bus() {
        let keys = Arc::new(InMemoryIdempotencyStore::new());
        let (bus, store) = account_bus(vec![Arc::new(IdempotencyMiddleware::new(keys.clone()))]);
        let id = Uuid::new_v4();

        let mut command = Deposit::new(id, 50);
        command.idempotency_key = Some("k".into());

        let first = bus
            .dispatch(command.clone())
            .await
            .expect("first dispatch succeeds");
        assert_eq!(first.response(), Some(50));

        let second = bus
            .dispatch(command)
            .await
            .expect("second dispatch succeeds");
        assert!(second.was_already_processed());
        assert_eq!(store.stream_length(id), 1, "exactly one committed batch");
        assert!(keys.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn handle_dispatches_once_bound() {
        let (bus, _store) = account_bus(vec![]);
        let handle = CommandBusHandle::new();

        let err = handle
            .dispatch(Deposit::new(Uuid::new_v4(), 1))
            .await
            .expect_err("unbound handle errors");
        assert!(matches!(err, DispatchError::Backend(_)));

        handle.bind(Arc::new(bus));
        assert!(handle.is_bound());
        let result = handle
            .dispatch(Deposit::new(Uuid::new_v4(), 5))
            .await
            .expect("bound handle dispatches");
        assert_eq!(result.response(), Some(5));
    }
}
