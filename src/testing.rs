//! Given-When-Then scenario kits for aggregates, projections, and sagas.
//!
//! The kits exercise components in isolation, without a store, bus, or
//! builder: the aggregate scenario replays `given` payloads as committed
//! history and runs commands directly against the root; the projection
//! and saga scenarios feed events through the component's real event
//! path. Every harness installs a fresh execution context per operation
//! and clears it afterwards, failed operations included.

use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateHandlers, AggregateRoot};
use crate::command::Command;
use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::event::{Event, EventData, EventPayload};
use crate::processor::DynProcessor;
use crate::projection::{Projection, ProjectionRunner};
use crate::query_bus::Query;
use crate::saga::{InMemorySagaStateStore, Saga, SagaRunner, SagaStateStore};

/// Given-When-Then harness for a single aggregate instance.
///
/// # Examples
///
/// ```ignore
/// AggregateScenario::<BankAccount>::new()
///     .given(MoneyDeposited { amount: 100 })
///     .when(Withdraw { account_id, amount: 30 })
///     .should_emit(MoneyWithdrawn { amount: 30 })
///     .should_have_state(|account| account.balance == 70);
/// ```
pub struct AggregateScenario<A: Aggregate> {
    root: AggregateRoot<A>,
    error: Option<DispatchError>,
}

impl<A: Aggregate> Default for AggregateScenario<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> AggregateScenario<A> {
    /// Start a scenario on a fresh aggregate with a random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Start a scenario on a fresh aggregate with a fixed id.
    pub fn with_id(aggregate_id: Uuid) -> Self {
        Self {
            root: AggregateRoot::new(aggregate_id, AggregateHandlers::<A>::for_aggregate()),
            error: None,
        }
    }

    /// The aggregate id under test.
    pub fn aggregate_id(&self) -> Uuid {
        self.root.id()
    }

    /// The aggregate root under test.
    pub fn root(&self) -> &AggregateRoot<A> {
        &self.root
    }

    /// Record a payload as already-committed history.
    ///
    /// The payload is applied and versioned like a replayed event; it
    /// will not appear in `should_emit` assertions.
    pub fn given<P: EventPayload>(mut self, payload: P) -> Self {
        self.root.emit(payload);
        self.root.take_uncommitted();
        self
    }

    /// Execute a command against the aggregate.
    ///
    /// A fresh execution context is installed for the command and
    /// cleared afterwards, whether the handler succeeds or fails.
    /// Failures are recorded for [`should_raise`](Self::should_raise).
    pub fn when<C: Command>(mut self, command: C) -> Self {
        let context = ExecutionContext::create(None).for_command(Uuid::new_v4());
        self.root.set_context(context);
        if let Err(error) = self.root.handle(&command) {
            self.error = Some(error);
        }
        self.root.clear_context();
        self
    }

    /// Assert that an event with exactly this payload was emitted.
    pub fn should_emit<P: EventPayload>(self, expected: P) -> Self {
        let expected = EventData::new(expected);
        assert!(
            self.root
                .uncommitted_events()
                .iter()
                .any(|event| event.payload == expected),
            "expected an emitted event with payload {expected:?}, got {:?}",
            self.root.uncommitted_events()
        );
        self
    }

    /// Assert that an event of payload type `P` was emitted.
    pub fn should_emit_type<P: EventPayload>(self) -> Self {
        assert!(
            self.root
                .uncommitted_events()
                .iter()
                .any(|event| event.payload.is::<P>()),
            "expected an emitted event of type {}, got {:?}",
            P::TYPE_TAG,
            self.root.uncommitted_events()
        );
        self
    }

    /// Assert that the command emitted nothing.
    pub fn should_emit_nothing(self) -> Self {
        assert!(
            self.root.uncommitted_events().is_empty(),
            "expected no emitted events, got {:?}",
            self.root.uncommitted_events()
        );
        self
    }

    /// Assert a predicate over the aggregate's final state.
    pub fn should_have_state(self, predicate: impl FnOnce(&A) -> bool) -> Self {
        assert!(
            predicate(self.root.state()),
            "state predicate failed; state: {:?}",
            serde_json::to_value(self.root.state()).ok()
        );
        self
    }

    /// Assert that a command failed with an error whose message contains
    /// `message_fragment`.
    pub fn should_raise(self, message_fragment: &str) -> Self {
        match &self.error {
            Some(error) => assert!(
                error.to_string().contains(message_fragment),
                "expected error containing {message_fragment:?}, got: {error}"
            ),
            None => panic!("expected a command to fail, but none did"),
        }
        self
    }
}

/// Given-When-Then harness for a projection.
///
/// Events flow through the projection's real event path; queries go
/// through its real query table.
pub struct ProjectionScenario<P: Projection> {
    runner: ProjectionRunner<P>,
    stream: Uuid,
    sequence: u64,
}

impl<P: Projection> ProjectionScenario<P> {
    /// Start a scenario around a projection instance.
    pub fn new(projection: P) -> Self {
        Self {
            runner: ProjectionRunner::new(Arc::new(projection)),
            stream: Uuid::new_v4(),
            sequence: 0,
        }
    }

    /// The default stream id events are delivered on.
    pub fn stream_id(&self) -> Uuid {
        self.stream
    }

    /// The projection instance under test.
    pub fn processor(&self) -> &Arc<P> {
        self.runner.processor()
    }

    /// Deliver a payload on the scenario's default stream.
    pub async fn given<T: EventPayload>(self, payload: T) -> Self {
        let stream = self.stream;
        self.given_on(stream, payload).await
    }

    /// Deliver a payload on an explicit stream.
    pub async fn given_on<T: EventPayload>(mut self, stream: Uuid, payload: T) -> Self {
        self.sequence += 1;
        let event = Event::new(stream, self.sequence, EventData::new(payload))
            .with_context(&ExecutionContext::create(None));
        self.runner
            .handle(&event)
            .await
            .expect("projection event handler failed");
        self
    }

    /// Dispatch a query through the projection's query path.
    pub async fn when<Q: Query>(&self, query: Q) -> Result<Q::Response, DispatchError> {
        self.runner.query(&query).await
    }

    /// Assert a predicate over the projection instance.
    pub fn should_have_state(self, predicate: impl FnOnce(&P) -> bool) -> Self {
        assert!(
            predicate(self.runner.processor().as_ref()),
            "projection state predicate failed"
        );
        self
    }
}

/// Given-Then harness for a saga.
///
/// Events are delivered through the real saga runner, so step
/// idempotency markers and state persistence behave exactly as in
/// production. `should_have_state` receives `None` once the saga
/// terminated, so `|state| state.is_none()` asserts deletion.
pub struct SagaScenario<S: Saga> {
    runner: SagaRunner<S>,
    stream: Uuid,
    sequence: u64,
}

impl<S: Saga> SagaScenario<S> {
    /// Start a scenario with an in-memory state store.
    pub fn new(saga: S) -> Self {
        Self::with_store(saga, Arc::new(InMemorySagaStateStore::new()))
    }

    /// Start a scenario with an explicit state store.
    pub fn with_store(saga: S, store: Arc<dyn SagaStateStore>) -> Self {
        Self {
            runner: SagaRunner::new(Arc::new(saga), store),
            stream: Uuid::new_v4(),
            sequence: 0,
        }
    }

    /// The saga instance under test.
    pub fn saga(&self) -> &Arc<S> {
        self.runner.saga()
    }

    /// Deliver a payload to the saga.
    pub async fn given<T: EventPayload>(mut self, payload: T) -> Self {
        self.sequence += 1;
        let event = Event::new(self.stream, self.sequence, EventData::new(payload))
            .with_context(&ExecutionContext::create(None));
        self.runner
            .handle(&event)
            .await
            .expect("saga step failed");
        self
    }

    /// Assert a predicate over a saga instance's state; `None` means the
    /// saga is absent or terminated.
    pub async fn should_have_state(
        self,
        saga_id: &str,
        predicate: impl FnOnce(Option<&S::State>) -> bool,
    ) -> Self {
        let state = self
            .runner
            .state(saga_id)
            .await
            .expect("saga state store failed");
        assert!(
            predicate(state.as_ref()),
            "saga state predicate failed for {saga_id:?}; state: {state:?}"
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{BankAccount, Deposit, Withdraw};
    use crate::command_bus::CommandBusHandle;
    use crate::event::test_fixtures::{MoneyDeposited, MoneyWithdrawn};
    use crate::projection::test_fixtures::{AccountBalances, GetBalance};
    use crate::saga::test_fixtures::{
        SourceWithdrawn, TransferFailed, TransferInitiated, TransferSaga,
    };

    #[test]
    fn aggregate_scenario_happy_path() {
        let scenario = AggregateScenario::<BankAccount>::new();
        let account_id = scenario.aggregate_id();
        scenario
            .given(MoneyDeposited { amount: 100 })
            .when(Withdraw {
                account_id,
                amount: 30,
            })
            .should_emit(MoneyWithdrawn { amount: 30 })
            .should_emit_type::<MoneyWithdrawn>()
            .should_have_state(|account| account.balance == 70);
    }

    #[test]
    fn aggregate_scenario_rejection() {
        let scenario = AggregateScenario::<BankAccount>::new();
        let account_id = scenario.aggregate_id();
        scenario
            .when(Withdraw {
                account_id,
                amount: 1,
            })
            .should_emit_nothing()
            .should_raise("insufficient funds");
    }

    #[test]
    fn aggregate_scenario_clears_context_after_commands() {
        let scenario = AggregateScenario::<BankAccount>::new();
        let account_id = scenario.aggregate_id();

        let after_success = scenario.when(Deposit::new(account_id, 5));
        assert!(after_success.root().context().is_cleared());

        let after_failure = after_success.when(Withdraw {
            account_id,
            amount: 1_000,
        });
        assert!(
            after_failure.root().context().is_cleared(),
            "context must be cleared on exceptional exits too"
        );
    }

    #[test]
    fn given_events_do_not_count_as_emitted() {
        AggregateScenario::<BankAccount>::new()
            .given(MoneyDeposited { amount: 100 })
            .should_emit_nothing()
            .should_have_state(|account| account.balance == 100);
    }

    #[tokio::test]
    async fn projection_scenario_feeds_events_then_queries() {
        let scenario = ProjectionScenario::new(AccountBalances::default())
            .given(MoneyDeposited { amount: 100 })
            .await
            .given(MoneyWithdrawn { amount: 25 })
            .await;

        let balance = scenario
            .when(GetBalance {
                account_id: scenario.stream_id(),
            })
            .await
            .expect("query");
        assert_eq!(balance, Some(75));

        scenario.should_have_state(|projection| {
            projection.accounts().len() == 1
        });
    }

    #[tokio::test]
    async fn saga_scenario_tracks_step_state() {
        SagaScenario::new(TransferSaga {
            bus: CommandBusHandle::new(),
            refund_account: Uuid::new_v4(),
        })
        .given(TransferInitiated {
            transfer_id: "t1".into(),
            amount: 100,
        })
        .await
        .should_have_state("t1", |state| {
            state.is_some_and(|s| !s.source_withdrawn && s.amount == 100)
        })
        .await
        .given(SourceWithdrawn {
            transfer_id: "t1".into(),
        })
        .await
        .should_have_state("t1", |state| state.is_some_and(|s| s.source_withdrawn))
        .await;
    }

    #[tokio::test]
    async fn saga_scenario_asserts_deletion_with_none() {
        // No withdrawal happened, so the failure path compensates
        // nothing and simply terminates the saga.
        SagaScenario::new(TransferSaga {
            bus: CommandBusHandle::new(),
            refund_account: Uuid::new_v4(),
        })
        .given(TransferInitiated {
            transfer_id: "t1".into(),
            amount: 100,
        })
        .await
        .given(TransferFailed {
            transfer_id: "t1".into(),
        })
        .await
        .should_have_state("t1", |state| state.is_none())
        .await;
    }
}
