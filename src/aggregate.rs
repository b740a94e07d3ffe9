//! Aggregate trait, handler registry, and the event-sourced root.
//!
//! An aggregate type is plain state plus two handler tables built once by
//! [`Aggregate::configure`]: command handlers (decide, may emit) and event
//! appliers (pure state transitions). [`AggregateRoot`] wraps the state
//! with the stream identity, version, and the uncommitted event buffer.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::command::Command;
use crate::context::ExecutionContext;
use crate::error::{DispatchError, DomainError};
use crate::event::{Event, EventData, EventPayload};
use crate::routing::HandlerMap;
use crate::snapshot::Snapshot;

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type is the aggregate's state. Command handlers and
/// event appliers are registered explicitly in
/// [`configure`](Aggregate::configure); the framework routes messages to
/// them by type with O(1) lookup.
///
/// # Contract
///
/// - Command handlers validate a command against current state and call
///   [`AggregateRoot::emit`] zero or more times. They may read I/O-free
///   dependencies only; a failing handler must return a [`DomainError`]
///   (the repository discards the instance uncommitted).
/// - Appliers are pure, total, synchronous functions. No I/O, no panics,
///   no clocks. All state mutation happens inside appliers, never in
///   command handlers directly.
///
/// # Examples
///
/// ```
/// use chronicle::{Aggregate, AggregateHandlers, Command, EventPayload};
/// use serde::{Deserialize, Serialize};
/// use uuid::Uuid;
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Counter {
///     value: u64,
/// }
///
/// #[derive(Debug)]
/// struct Increment {
///     counter_id: Uuid,
/// }
///
/// impl Command for Increment {
///     type Response = u64;
///     fn aggregate_id(&self) -> Uuid {
///         self.counter_id
///     }
/// }
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Incremented;
///
/// impl EventPayload for Incremented {
///     const TYPE_TAG: &'static str = "Incremented";
/// }
///
/// impl Aggregate for Counter {
///     const AGGREGATE_TYPE: &'static str = "counter";
///
///     fn configure(handlers: &mut AggregateHandlers<Self>) {
///         handlers.command(|root, _cmd: &Increment| {
///             root.emit(Incremented);
///             Ok(root.state().value)
///         });
///         handlers.apply(|state, _event: &Incremented| state.value += 1);
///     }
/// }
/// ```
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. `"account"`). Used as the
    /// snapshot namespace and in diagnostics.
    const AGGREGATE_TYPE: &'static str;

    /// Register command handlers and event appliers.
    ///
    /// Called once per registration; the resulting tables are immutable.
    fn configure(handlers: &mut AggregateHandlers<Self>);
}

type CommandFn<A> = Box<
    dyn Fn(&mut AggregateRoot<A>, &(dyn Any + Send + Sync)) -> Result<Box<dyn Any + Send>, DomainError>
        + Send
        + Sync,
>;

type ApplierFn<A> = Box<dyn Fn(&mut A, &EventData) + Send + Sync>;

/// Registration surface handed to [`Aggregate::configure`].
///
/// Routing is strict for commands (an unregistered command type is a
/// dispatch error) and permissive for appliers (unknown payloads are
/// skipped for forward compatibility).
pub struct AggregateHandlers<A: Aggregate> {
    commands: HandlerMap<CommandFn<A>>,
    appliers: HandlerMap<ApplierFn<A>>,
}

impl<A: Aggregate> AggregateHandlers<A> {
    /// Build the handler tables for `A` by running its `configure`.
    pub fn for_aggregate() -> Arc<Self> {
        let mut handlers = Self {
            commands: HandlerMap::new(),
            appliers: HandlerMap::new(),
        };
        A::configure(&mut handlers);
        Arc::new(handlers)
    }

    /// Register a handler for command type `C`.
    ///
    /// The handler receives the aggregate root (to read state and emit
    /// events) and returns the command's declared response.
    pub fn command<C, F>(&mut self, handler: F)
    where
        C: Command,
        F: Fn(&mut AggregateRoot<A>, &C) -> Result<C::Response, DomainError>
            + Send
            + Sync
            + 'static,
    {
        self.commands.insert(
            TypeId::of::<C>(),
            std::any::type_name::<C>(),
            Box::new(move |root, message| {
                let command = message
                    .downcast_ref::<C>()
                    .expect("command router dispatches by exact TypeId");
                handler(root, command).map(|response| Box::new(response) as Box<dyn Any + Send>)
            }),
        );
    }

    /// Register an applier for payload type `P`.
    pub fn apply<P, F>(&mut self, applier: F)
    where
        P: EventPayload,
        F: Fn(&mut A, &P) + Send + Sync + 'static,
    {
        self.appliers.insert(
            TypeId::of::<P>(),
            P::TYPE_TAG,
            Box::new(move |state, payload| {
                if let Some(typed) = payload.downcast_ref::<P>() {
                    applier(state, typed);
                }
            }),
        );
    }

    /// `(TypeId, name)` of every registered command, for bus routing.
    pub(crate) fn command_types(&self) -> Vec<(TypeId, &'static str)> {
        self.commands.registered().collect()
    }

    /// Duplicate registrations recorded during `configure`, surfaced by
    /// the application builder.
    pub(crate) fn duplicate_names(&self) -> Vec<String> {
        let mut duplicates = self.commands.duplicates().to_vec();
        duplicates.extend_from_slice(self.appliers.duplicates());
        duplicates
    }
}

impl<A: Aggregate> fmt::Debug for AggregateHandlers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateHandlers")
            .field("commands", &self.commands)
            .field("appliers", &self.appliers)
            .finish()
    }
}

/// An aggregate instance bound to its stream: state, version, and the
/// buffer of events emitted during the current command.
///
/// State machine per in-flight command:
/// `Loaded -> Handling -> (Emitting -> Applying)* -> Committed | Failed`.
/// Only the repository's commit produces an event store append; a root
/// whose command failed is simply dropped.
pub struct AggregateRoot<A: Aggregate> {
    id: Uuid,
    version: u64,
    last_snapshot_time: DateTime<Utc>,
    last_event_time: DateTime<Utc>,
    state: A,
    uncommitted: Vec<Event>,
    context: ExecutionContext,
    handlers: Arc<AggregateHandlers<A>>,
}

impl<A: Aggregate> Clone for AggregateRoot<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            version: self.version,
            last_snapshot_time: self.last_snapshot_time,
            last_event_time: self.last_event_time,
            state: self.state.clone(),
            uncommitted: self.uncommitted.clone(),
            context: self.context,
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<A: Aggregate> fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("uncommitted", &self.uncommitted.len())
            .finish()
    }
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Create a zero-valued root at version 0.
    pub(crate) fn new(id: Uuid, handlers: Arc<AggregateHandlers<A>>) -> Self {
        let now = Utc::now();
        Self {
            id,
            version: 0,
            last_snapshot_time: now,
            last_event_time: now,
            state: A::default(),
            uncommitted: Vec::new(),
            context: ExecutionContext::default(),
            handlers,
        }
    }

    /// Seed a root from a snapshot; replay resumes at `version + 1`.
    pub(crate) fn from_snapshot(
        id: Uuid,
        snapshot: Snapshot<A>,
        handlers: Arc<AggregateHandlers<A>>,
    ) -> Self {
        let mut root = Self::new(id, handlers);
        root.state = snapshot.state;
        root.version = snapshot.version;
        root.last_snapshot_time = snapshot.taken_at;
        root
    }

    /// The aggregate's stream id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of events applied to this instance (committed + emitted).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The current state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Events emitted during the current command, not yet committed.
    pub fn uncommitted_events(&self) -> &[Event] {
        &self.uncommitted
    }

    /// Emit a domain event and apply it immediately.
    ///
    /// The event is wrapped in an envelope with the next sequence number,
    /// a UTC timestamp, and correlation/causation from the active
    /// execution context, then pushed onto the uncommitted buffer and
    /// applied so that logic later in the same handler observes the
    /// updated state.
    pub fn emit<P: EventPayload>(&mut self, payload: P) {
        self.version += 1;
        let event = Event::new(self.id, self.version, EventData::new(payload))
            .with_context(&self.context);
        self.last_event_time = event.timestamp;
        let data = event.payload.clone();
        self.uncommitted.push(event);
        self.apply_data(&data);
    }

    /// Route a command to its registered handler.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NoHandler`] if `C` is not registered;
    /// [`DispatchError::Domain`] if the handler rejects the command.
    pub fn handle<C: Command>(&mut self, command: &C) -> Result<C::Response, DispatchError> {
        let response =
            self.handle_erased(TypeId::of::<C>(), std::any::type_name::<C>(), command)?;
        Ok(*response
            .downcast::<C::Response>()
            .expect("handler returns the command's declared response type"))
    }

    /// Type-erased command dispatch used by the command bus terminal.
    pub(crate) fn handle_erased(
        &mut self,
        type_id: TypeId,
        type_name: &'static str,
        message: &(dyn Any + Send + Sync),
    ) -> Result<Box<dyn Any + Send>, DispatchError> {
        let handlers = Arc::clone(&self.handlers);
        let handler = handlers
            .commands
            .resolve(type_id)
            .ok_or(DispatchError::NoHandler {
                message_type: type_name,
            })?;
        handler(self, message).map_err(DispatchError::Domain)
    }

    /// Apply a payload through the applier table.
    ///
    /// Payload types without a registered applier are skipped, so old
    /// streams keep replaying after an event type is retired.
    fn apply_data(&mut self, payload: &EventData) {
        let handlers = Arc::clone(&self.handlers);
        if let Some(applier) = handlers.appliers.resolve(payload.type_id()) {
            applier(&mut self.state, payload);
        }
    }

    /// Replay committed events in sequence order.
    ///
    /// After replay, `version` equals the highest applied sequence number.
    pub(crate) fn replay(&mut self, events: &[Event]) {
        for event in events {
            self.apply_data(&event.payload);
            self.version = event.sequence_number;
            self.last_event_time = event.timestamp;
        }
    }

    /// Whether the instance has advanced past `version`.
    pub(crate) fn changed_since(&self, version: u64) -> bool {
        self.version > version
    }

    /// Move the uncommitted buffer out, handing ownership to the caller.
    pub(crate) fn take_uncommitted(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.uncommitted)
    }

    /// Drop any uncommitted events (failed command path).
    pub(crate) fn clear_uncommitted(&mut self) {
        self.uncommitted.clear();
    }

    /// Capture the current state as a snapshot.
    pub(crate) fn to_snapshot(&self) -> Snapshot<A> {
        Snapshot {
            state: self.state.clone(),
            version: self.version,
            taken_at: Utc::now(),
        }
    }

    /// Record that a snapshot was just taken.
    pub(crate) fn mark_snapshot(&mut self) {
        self.last_snapshot_time = Utc::now();
    }

    /// Timestamp of the last snapshot (or creation).
    pub(crate) fn last_snapshot_time(&self) -> DateTime<Utc> {
        self.last_snapshot_time
    }

    /// Timestamp of the most recent event.
    pub(crate) fn last_event_time(&self) -> DateTime<Utc> {
        self.last_event_time
    }

    /// Install the execution context for the duration of a command.
    pub(crate) fn set_context(&mut self, context: ExecutionContext) {
        self.context = context;
    }

    /// Clear the execution context. Mandatory after every command,
    /// including failed ones.
    pub(crate) fn clear_context(&mut self) {
        self.context = ExecutionContext::default();
    }

    /// The currently-installed execution context.
    pub fn context(&self) -> ExecutionContext {
        self.context
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::event::test_fixtures::{MoneyDeposited, MoneyWithdrawn};
    use serde::Deserialize;

    /// Bank account fixture shared across the crate's tests.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct BankAccount {
        pub balance: u64,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct Deposit {
        pub account_id: Uuid,
        pub amount: u64,
        pub idempotency_key: Option<String>,
    }

    impl Deposit {
        pub(crate) fn new(account_id: Uuid, amount: u64) -> Self {
            Self {
                account_id,
                amount,
                idempotency_key: None,
            }
        }
    }

    impl Command for Deposit {
        type Response = u64;

        fn aggregate_id(&self) -> Uuid {
            self.account_id
        }

        fn idempotency_key(&self) -> Option<String> {
            self.idempotency_key.clone()
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) struct Withdraw {
        pub account_id: Uuid,
        pub amount: u64,
    }

    impl Command for Withdraw {
        type Response = u64;

        fn aggregate_id(&self) -> Uuid {
            self.account_id
        }
    }

    impl Aggregate for BankAccount {
        const AGGREGATE_TYPE: &'static str = "account";

        fn configure(handlers: &mut AggregateHandlers<Self>) {
            handlers.command(|root, cmd: &Deposit| {
                if cmd.amount == 0 {
                    return Err(DomainError::new("deposit amount must be positive"));
                }
                root.emit(MoneyDeposited { amount: cmd.amount });
                Ok(root.state().balance)
            });
            handlers.command(|root, cmd: &Withdraw| {
                if cmd.amount > root.state().balance {
                    return Err(DomainError::new("insufficient funds"));
                }
                root.emit(MoneyWithdrawn { amount: cmd.amount });
                Ok(root.state().balance)
            });
            handlers.apply(|state, event: &MoneyDeposited| state.balance += event.amount);
            handlers.apply(|state, event: &MoneyWithdrawn| state.balance -= event.amount);
        }
    }

    pub(crate) fn account_root() -> AggregateRoot<BankAccount> {
        AggregateRoot::new(Uuid::new_v4(), AggregateHandlers::for_aggregate())
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::{account_root, BankAccount, Deposit, Withdraw};
    use super::*;
    use crate::event::test_fixtures::MoneyDeposited;

    #[test]
    fn deposit_emits_and_applies_immediately() {
        let mut root = account_root();
        let balance = root
            .handle(&Deposit::new(root.id(), 100))
            .expect("deposit should succeed");

        // The handler returned the post-apply balance: emit applied the
        // event before the handler finished.
        assert_eq!(balance, 100);
        assert_eq!(root.version(), 1);
        assert_eq!(root.uncommitted_events().len(), 1);
        assert_eq!(root.uncommitted_events()[0].sequence_number, 1);
        assert_eq!(
            root.uncommitted_events()[0].payload,
            EventData::new(MoneyDeposited { amount: 100 })
        );
    }

    #[test]
    fn rejected_command_surfaces_domain_error() {
        let mut root = account_root();
        let err = root
            .handle(&Withdraw {
                account_id: root.id(),
                amount: 5,
            })
            .expect_err("overdraft must be rejected");
        assert!(matches!(err, DispatchError::Domain(_)));
        assert_eq!(err.to_string(), "insufficient funds");
        assert!(root.uncommitted_events().is_empty());
    }

    #[test]
    fn unregistered_command_is_no_handler() {
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

        let mut root = account_root();
        let err = root
            .handle(&Freeze {
                account_id: root.id(),
            })
            .expect_err("no handler registered for Freeze");
        assert!(matches!(err, DispatchError::NoHandler { .. }));
    }

    #[test]
    fn replay_rebuilds_state_and_version() {
        let mut source = account_root();
        source.handle(&Deposit::new(source.id(), 100)).unwrap();
        source.handle(&Deposit::new(source.id(), 50)).unwrap();
        source
            .handle(&Withdraw {
                account_id: source.id(),
                amount: 30,
            })
            .unwrap();
        let events = source.take_uncommitted();

        let mut replayed =
            AggregateRoot::<BankAccount>::new(source.id(), AggregateHandlers::for_aggregate());
        replayed.replay(&events);

        assert_eq!(replayed.version(), 3);
        assert_eq!(replayed.state().balance, 120);
        assert_eq!(replayed.state(), source.state());
        assert!(replayed.uncommitted_events().is_empty());
    }

    #[test]
    fn replay_skips_unknown_payloads() {
        // MoneyTransferRequested has no applier on BankAccount.
        use serde::{Deserialize, Serialize};
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct MoneyTransferRequested {
            amount: u64,
        }
        impl EventPayload for MoneyTransferRequested {
            const TYPE_TAG: &'static str = "MoneyTransferRequested";
        }

        let mut root = account_root();
        let unknown = Event::new(
            root.id(),
            1,
            EventData::new(MoneyTransferRequested { amount: 5 }),
        );
        root.replay(&[unknown]);

        // State untouched, but the version still advances with the stream.
        assert_eq!(root.state().balance, 0);
        assert_eq!(root.version(), 1);
    }

    #[test]
    fn emit_stamps_context_ids() {
        let mut root = account_root();
        let ctx = ExecutionContext::create(None).for_command(Uuid::new_v4());
        root.set_context(ctx);
        root.handle(&Deposit::new(root.id(), 10)).unwrap();

        let event = &root.uncommitted_events()[0];
        assert_eq!(event.correlation_id, ctx.correlation_id);
        assert_eq!(event.causation_id, ctx.command_id);

        root.clear_context();
        assert!(root.context().is_cleared());
    }

    #[test]
    fn snapshot_seed_resumes_from_version() {
        let mut source = account_root();
        source.handle(&Deposit::new(source.id(), 100)).unwrap();
        source.handle(&Deposit::new(source.id(), 50)).unwrap();
        let snapshot = source.to_snapshot();

        let restored = AggregateRoot::<BankAccount>::from_snapshot(
            source.id(),
            snapshot,
            AggregateHandlers::for_aggregate(),
        );
        assert_eq!(restored.version(), 2);
        assert_eq!(restored.state().balance, 150);
        assert!(restored.uncommitted_events().is_empty());
    }

    #[test]
    fn take_uncommitted_moves_the_buffer() {
        let mut root = account_root();
        root.handle(&Deposit::new(root.id(), 1)).unwrap();
        assert!(root.changed_since(0));

        let events = root.take_uncommitted();
        assert_eq!(events.len(), 1);
        assert!(root.uncommitted_events().is_empty());
        // Version reflects applied events even after the buffer moves.
        assert_eq!(root.version(), 1);
    }

    #[test]
    fn duplicate_command_registration_is_recorded() {
        #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
        struct Sloppy;
        impl Aggregate for Sloppy {
            const AGGREGATE_TYPE: &'static str = "sloppy";
            fn configure(handlers: &mut AggregateHandlers<Self>) {
                handlers.command(|_root, _cmd: &Deposit| Ok(0));
                handlers.command(|_root, _cmd: &Deposit| Ok(0));
            }
        }

        let handlers = AggregateHandlers::<Sloppy>::for_aggregate();
        assert_eq!(handlers.duplicate_names().len(), 1);
    }
}
