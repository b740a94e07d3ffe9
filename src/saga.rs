//! Sagas: stateful, correlated event processors for multi-step
//! workflows.
//!
//! Each step is declared against an event type together with an explicit
//! saga-id extractor. The runner correlates events to state by that id,
//! guarantees each `(saga id, step)` pair executes at most once, and
//! persists state with the step-completion marker atomically. A step
//! failing leaves nothing persisted, so the executor's redelivery gets a
//! clean retry. Compensating steps dispatch commands through a
//! [`CommandBusHandle`](crate::command_bus::CommandBusHandle) and must
//! themselves be idempotent.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BackendError, ProcessorError};
use crate::event::{Event, EventPayload};
use crate::processor::DynProcessor;
use crate::routing::{BoxFuture, HandlerMap};

/// A multi-step workflow coordinator.
///
/// Per saga instance the lifecycle is `Absent -> Active ... -> Terminated`:
/// the initial step creates state, subsequent steps update it, a
/// terminal step deletes it. Once terminated, events matching only
/// non-initial steps are ignored.
pub trait Saga: Send + Sync + 'static {
    /// Stable saga type id, used for subscriptions and checkpoints.
    const SAGA_TYPE: &'static str;

    /// The correlated state record.
    type State: Clone + Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static;

    /// Register the saga's steps. Called once per registration.
    fn configure(steps: &mut SagaSteps<Self>)
    where
        Self: Sized;
}

/// What a non-initial step decided.
#[derive(Debug)]
pub enum StepResult<S> {
    /// Persist this state and keep the saga active.
    Updated(S),
    /// The saga is finished: delete its state.
    Completed,
}

enum StepOutcome<S> {
    Save(S),
    Delete,
    Skip,
}

type StepRunFn<S, St> = Box<
    dyn for<'a> Fn(&'a S, &'a Event, Option<St>) -> BoxFuture<'a, Result<StepOutcome<St>, ProcessorError>>
        + Send
        + Sync,
>;

struct RegisteredStep<S: Saga> {
    step_name: &'static str,
    extract: Box<dyn Fn(&Event) -> String + Send + Sync>,
    run: StepRunFn<S, S::State>,
}

/// Registration surface handed to [`Saga::configure`].
///
/// Every step takes an explicit extractor closure mapping the event
/// payload to the saga id; there is no implicit field convention.
pub struct SagaSteps<S: Saga> {
    steps: HandlerMap<RegisteredStep<S>>,
}

impl<S: Saga> Default for SagaSteps<S> {
    fn default() -> Self {
        Self {
            steps: HandlerMap::new(),
        }
    }
}

impl<S: Saga> SagaSteps<S> {
    /// Register a synchronous initial step: runs without existing state
    /// and returns the state to create.
    pub fn initial<T, F>(&mut self, step_name: &'static str, saga_id: fn(&T) -> String, handler: F)
    where
        T: EventPayload,
        F: Fn(&S, &T) -> Result<S::State, ProcessorError> + Send + Sync + 'static,
    {
        self.initial_async(step_name, saga_id, move |saga, payload| {
            let result = handler(saga, payload);
            Box::pin(async move { result })
        });
    }

    /// Register an asynchronous initial step.
    pub fn initial_async<T, F>(
        &mut self,
        step_name: &'static str,
        saga_id: fn(&T) -> String,
        handler: F,
    ) where
        T: EventPayload,
        F: for<'a> Fn(&'a S, &'a T) -> BoxFuture<'a, Result<S::State, ProcessorError>>
            + Send
            + Sync
            + 'static,
    {
        let run: StepRunFn<S, S::State> = Box::new(move |saga, event, _state| {
            let payload = event
                .payload
                .downcast_ref::<T>()
                .expect("saga step router dispatches by exact TypeId");
            let future = handler(saga, payload);
            Box::pin(async move { future.await.map(StepOutcome::Save) })
        });
        self.insert::<T>(step_name, saga_id, run);
    }

    /// Register a synchronous subsequent step: receives the current
    /// state and returns [`StepResult`].
    pub fn step<T, F>(&mut self, step_name: &'static str, saga_id: fn(&T) -> String, handler: F)
    where
        T: EventPayload,
        F: Fn(&S, &T, S::State) -> Result<StepResult<S::State>, ProcessorError>
            + Send
            + Sync
            + 'static,
    {
        self.step_async(step_name, saga_id, move |saga, payload, state| {
            let result = handler(saga, payload, state);
            Box::pin(async move { result })
        });
    }

    /// Register an asynchronous subsequent step (compensations dispatch
    /// commands here).
    pub fn step_async<T, F>(
        &mut self,
        step_name: &'static str,
        saga_id: fn(&T) -> String,
        handler: F,
    ) where
        T: EventPayload,
        F: for<'a> Fn(&'a S, &'a T, S::State) -> BoxFuture<'a, Result<StepResult<S::State>, ProcessorError>>
            + Send
            + Sync
            + 'static,
    {
        let run: StepRunFn<S, S::State> = Box::new(move |saga, event, state| {
            let payload = event
                .payload
                .downcast_ref::<T>()
                .expect("saga step router dispatches by exact TypeId");
            match state {
                // Terminated (or never started): non-initial steps are
                // ignored, including redeliveries after state deletion.
                None => Box::pin(async { Ok(StepOutcome::Skip) }),
                Some(state) => {
                    let future = handler(saga, payload, state);
                    Box::pin(async move {
                        future.await.map(|result| match result {
                            StepResult::Updated(state) => StepOutcome::Save(state),
                            StepResult::Completed => StepOutcome::Delete,
                        })
                    })
                }
            }
        });
        self.insert::<T>(step_name, saga_id, run);
    }

    fn insert<T: EventPayload>(
        &mut self,
        step_name: &'static str,
        saga_id: fn(&T) -> String,
        run: StepRunFn<S, S::State>,
    ) {
        self.steps.insert(
            TypeId::of::<T>(),
            T::TYPE_TAG,
            RegisteredStep {
                step_name,
                extract: Box::new(move |event| {
                    let payload = event
                        .payload
                        .downcast_ref::<T>()
                        .expect("saga step router dispatches by exact TypeId");
                    saga_id(payload)
                }),
                run,
            },
        );
    }

    pub(crate) fn duplicates(&self) -> &[String] {
        self.steps.duplicates()
    }
}

impl<S: Saga> fmt::Debug for SagaSteps<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaSteps")
            .field("steps", &self.steps)
            .finish()
    }
}

/// Storage backend for saga state and step-completion markers.
///
/// `save` persists the state and marks the step in one atomic operation;
/// `delete` removes the state *and* the markers, terminating the
/// instance.
#[async_trait]
pub trait SagaStateStore: Send + Sync {
    /// Load a saga's state by id.
    async fn load(&self, saga_id: &str) -> Result<Option<serde_json::Value>, BackendError>;

    /// Atomically persist state and record `completed_step`.
    async fn save(
        &self,
        saga_id: &str,
        state: serde_json::Value,
        completed_step: &str,
    ) -> Result<(), BackendError>;

    /// Delete state and step markers (saga terminated).
    async fn delete(&self, saga_id: &str) -> Result<(), BackendError>;

    /// Whether a step already completed for this saga id.
    async fn is_step_complete(&self, saga_id: &str, step_name: &str) -> Result<bool, BackendError>;
}

#[derive(Default)]
struct SagaStateInner {
    states: HashMap<String, serde_json::Value>,
    completed_steps: HashMap<String, HashSet<String>>,
}

/// In-memory saga state store; one lock keeps save/delete atomic.
#[derive(Default)]
pub struct InMemorySagaStateStore {
    inner: Mutex<SagaStateInner>,
}

impl InMemorySagaStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for InMemorySagaStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().expect("saga state lock poisoned");
        f.debug_struct("InMemorySagaStateStore")
            .field("active", &inner.states.len())
            .finish()
    }
}

#[async_trait]
impl SagaStateStore for InMemorySagaStateStore {
    async fn load(&self, saga_id: &str) -> Result<Option<serde_json::Value>, BackendError> {
        let inner = self.inner.lock().expect("saga state lock poisoned");
        Ok(inner.states.get(saga_id).cloned())
    }

    async fn save(
        &self,
        saga_id: &str,
        state: serde_json::Value,
        completed_step: &str,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().expect("saga state lock poisoned");
        inner.states.insert(saga_id.to_owned(), state);
        inner
            .completed_steps
            .entry(saga_id.to_owned())
            .or_default()
            .insert(completed_step.to_owned());
        Ok(())
    }

    async fn delete(&self, saga_id: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().expect("saga state lock poisoned");
        inner.states.remove(saga_id);
        inner.completed_steps.remove(saga_id);
        Ok(())
    }

    async fn is_step_complete(
        &self,
        saga_id: &str,
        step_name: &str,
    ) -> Result<bool, BackendError> {
        let inner = self.inner.lock().expect("saga state lock poisoned");
        Ok(inner
            .completed_steps
            .get(saga_id)
            .is_some_and(|steps| steps.contains(step_name)))
    }
}

/// Drives a saga as an event processor: correlate, dedupe, run, persist.
pub struct SagaRunner<S: Saga> {
    saga: Arc<S>,
    steps: SagaSteps<S>,
    store: Arc<dyn SagaStateStore>,
}

impl<S: Saga> SagaRunner<S> {
    /// Build the step table for `S` and bind it to an instance and a
    /// state store.
    pub fn new(saga: Arc<S>, store: Arc<dyn SagaStateStore>) -> Self {
        let mut steps = SagaSteps::default();
        S::configure(&mut steps);
        Self { saga, steps, store }
    }

    /// The wrapped saga instance.
    pub fn saga(&self) -> &Arc<S> {
        &self.saga
    }

    /// Load and decode a saga instance's state.
    pub async fn state(&self, saga_id: &str) -> Result<Option<S::State>, ProcessorError> {
        match self.store.load(saga_id).await? {
            Some(value) => {
                let state = serde_json::from_value::<S::State>(value).map_err(|e| {
                    ProcessorError::Permanent(format!("saga state decode failed: {e}"))
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn duplicate_names(&self) -> Vec<String> {
        self.steps.duplicates().to_vec()
    }
}

impl<S: Saga> fmt::Debug for SagaRunner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaRunner")
            .field("saga_type", &S::SAGA_TYPE)
            .finish()
    }
}

#[async_trait]
impl<S: Saga> DynProcessor for SagaRunner<S> {
    fn processor_id(&self) -> &'static str {
        S::SAGA_TYPE
    }

    async fn handle(&self, event: &Event) -> Result<(), ProcessorError> {
        let Some(step) = self.steps.steps.resolve(event.payload.type_id()) else {
            return Ok(());
        };
        let saga_id = (step.extract)(event);

        if self.store.is_step_complete(&saga_id, step.step_name).await? {
            tracing::info!(
                saga_type = S::SAGA_TYPE,
                saga_id = %saga_id,
                step = step.step_name,
                "step already complete, skipping"
            );
            return Ok(());
        }

        let state = match self.store.load(&saga_id).await? {
            Some(value) => Some(serde_json::from_value::<S::State>(value).map_err(|e| {
                ProcessorError::Permanent(format!("saga state decode failed: {e}"))
            })?),
            None => None,
        };

        match (step.run)(self.saga.as_ref(), event, state).await? {
            StepOutcome::Save(state) => {
                let value = serde_json::to_value(&state).map_err(|e| {
                    ProcessorError::Permanent(format!("saga state encode failed: {e}"))
                })?;
                self.store.save(&saga_id, value, step.step_name).await?;
                tracing::info!(
                    saga_type = S::SAGA_TYPE,
                    saga_id = %saga_id,
                    step = step.step_name,
                    "step completed"
                );
            }
            StepOutcome::Delete => {
                self.store.delete(&saga_id).await?;
                tracing::info!(
                    saga_type = S::SAGA_TYPE,
                    saga_id = %saga_id,
                    step = step.step_name,
                    "saga terminated"
                );
            }
            StepOutcome::Skip => {
                tracing::debug!(
                    saga_type = S::SAGA_TYPE,
                    saga_id = %saga_id,
                    step = step.step_name,
                    "no active state for step, ignoring event"
                );
            }
        }
        Ok(())
    }
}
