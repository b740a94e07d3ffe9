//! Runtime execution engine for event processors.
//!
//! One executor drives one processor: it pulls events from a
//! subscription in batches, filters the catchup skip window and
//! already-checkpointed events, dispatches to the processor's handlers
//! with a transient-retry budget, measures lag after every batch, and
//! triggers the catchup strategy when the configured condition fires.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointStore, ProcessorCheckpoint};
use crate::error::{BackendError, ProcessorError};
use crate::event::{Event, PersistedEvent};
use crate::processor::{DynProcessor, EventProcessor, ProcessorRunner};
use crate::transport::EventSubscription;

/// How far behind a processor is from the write model.
///
/// Two independent signals: backlog volume (queue depth) and staleness
/// (mean age of the most recent batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lag {
    /// Events waiting in the subscription.
    pub unprocessed_events: usize,
    /// Mean of `now - event.timestamp` over the last batch.
    pub average_event_age: Duration,
}

/// Condition deciding when the catchup strategy runs.
///
/// Compositions nest: `AnyOf`/`AllOf` take further conditions, so
/// "queue over 5000 OR (age over 5m AND queue over 100)" is expressible.
#[derive(Debug, Clone, Default)]
pub enum CatchupCondition {
    /// Never trigger catchup (the default).
    #[default]
    Never,
    /// Trigger when the backlog exceeds this many events.
    AfterEvents(usize),
    /// Trigger when the average event age exceeds this duration.
    AfterAge(Duration),
    /// Trigger when any inner condition holds.
    AnyOf(Vec<CatchupCondition>),
    /// Trigger when every inner condition holds.
    AllOf(Vec<CatchupCondition>),
}

impl CatchupCondition {
    /// Evaluate against the latest lag measurement.
    pub fn should_catch_up(&self, lag: &Lag) -> bool {
        match self {
            CatchupCondition::Never => false,
            CatchupCondition::AfterEvents(n) => lag.unprocessed_events > *n,
            CatchupCondition::AfterAge(age) => lag.average_event_age > *age,
            CatchupCondition::AnyOf(conditions) => {
                conditions.iter().any(|c| c.should_catch_up(lag))
            }
            CatchupCondition::AllOf(conditions) => {
                !conditions.is_empty() && conditions.iter().all(|c| c.should_catch_up(lag))
            }
        }
    }
}

/// Result of a catchup run: the skip window.
///
/// Events with `timestamp <= skip_before` were already incorporated into
/// the processor's state by the catchup (for example from projection
/// snapshots) and must not be re-processed from the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchupOutcome {
    /// Skip events at or before this timestamp.
    pub skip_before: Option<DateTime<Utc>>,
}

impl CatchupOutcome {
    /// Whether an event falls inside the skip window.
    pub fn should_skip(&self, event: &Event) -> bool {
        self.skip_before.is_some_and(|cutoff| event.timestamp <= cutoff)
    }
}

/// Strategy bringing a processor's state to a baseline so it can consume
/// from a later stream position.
#[async_trait]
pub trait CatchupStrategy<P>: Send + Sync {
    /// Load whatever historical state the processor needs and return the
    /// skip window, or `None` when nothing should be skipped.
    async fn catch_up(&self, processor: &P) -> Result<Option<CatchupOutcome>, ProcessorError>;
}

/// The default strategy: consume from the current position, no baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCatchup;

#[async_trait]
impl<P: Send + Sync> CatchupStrategy<P> for NoCatchup {
    async fn catch_up(&self, _processor: &P) -> Result<Option<CatchupOutcome>, ProcessorError> {
        Ok(None)
    }
}

/// Sink receiving events that permanently failed processing.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record a failed event together with its error.
    async fn record(&self, event: &Event, error: &ProcessorError) -> Result<(), BackendError>;
}

/// In-memory dead-letter sink for tests.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<(Event, String)>>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(event, error message)` pairs.
    pub fn entries(&self) -> Vec<(Event, String)> {
        self.entries.lock().expect("dead letter lock poisoned").clone()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("dead letter lock poisoned").len()
    }

    /// Whether the sink is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, event: &Event, error: &ProcessorError) -> Result<(), BackendError> {
        let mut entries = self.entries.lock().expect("dead letter lock poisoned");
        entries.push((event.clone(), error.to_string()));
        Ok(())
    }
}

/// One line in the dead-letter JSONL log.
#[derive(Debug, Serialize, Deserialize)]
struct DeadLetterEntry {
    event: PersistedEvent,
    error: String,
    at: DateTime<Utc>,
}

/// File-backed dead-letter sink appending one JSON line per failure.
#[derive(Debug)]
pub struct FileDeadLetterSink {
    path: std::path::PathBuf,
}

impl FileDeadLetterSink {
    /// Create a sink appending to `path` (created on first record).
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetterSink {
    async fn record(&self, event: &Event, error: &ProcessorError) -> Result<(), BackendError> {
        use std::io::Write;

        let entry = DeadLetterEntry {
            event: event
                .to_persisted()
                .map_err(|e| BackendError::permanent(e.to_string()))?,
            error: error.to_string(),
            at: Utc::now(),
        };
        let json = serde_json::to_string(&entry)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::transient(format!("create dead letter dir: {e}")))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BackendError::transient(format!("open dead letter log: {e}")))?;
        writeln!(file, "{json}")
            .map_err(|e| BackendError::transient(format!("write dead letter log: {e}")))?;
        Ok(())
    }
}

/// Tuning knobs for the executor loop.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Events pulled per batch before lag is measured.
    pub batch_size: usize,
    /// Transient-failure retries per event before it is dead-lettered.
    pub retry_limit: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry_limit: 3,
        }
    }
}

/// Type-erased executor handle used by the application runner.
#[async_trait]
pub trait ProcessorExecutor: Send + Sync {
    /// The driven processor's id.
    fn processor_id(&self) -> &'static str;

    /// Consume the subscription until it ends.
    async fn run(&self, subscription: Box<dyn EventSubscription>) -> Result<(), ProcessorError>;
}

/// Drives one processor against one subscription.
///
/// `P` is the catchup strategy's view of the processor: the processor
/// type itself for plain processors and projections, or the
/// [`SagaRunner`](crate::saga::SagaRunner) for sagas (whose strategies
/// typically seed state through it). Event dispatch goes through a
/// type-erased [`DynProcessor`] handle.
pub struct EventProcessorExecutor<P: Send + Sync + 'static> {
    target: Arc<P>,
    dispatch: Arc<dyn DynProcessor>,
    processor_id: &'static str,
    condition: CatchupCondition,
    strategy: Arc<dyn CatchupStrategy<P>>,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    config: ExecutorConfig,
}

impl<P: EventProcessor> EventProcessorExecutor<P> {
    /// Create an executor with default policies: no catchup, default
    /// batch size and retry budget, no dead-letter sink.
    pub fn new(processor: Arc<P>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        let dispatch = Arc::new(ProcessorRunner::new(Arc::clone(&processor)));
        Self::from_parts(processor, dispatch, P::PROCESSOR_ID, checkpoints)
    }
}

impl<P: Send + Sync + 'static> EventProcessorExecutor<P> {
    /// Create an executor from an explicit dispatch handle.
    ///
    /// Used for processors that implement [`DynProcessor`] themselves,
    /// like saga runners.
    pub fn from_parts(
        target: Arc<P>,
        dispatch: Arc<dyn DynProcessor>,
        processor_id: &'static str,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            target,
            dispatch,
            processor_id,
            condition: CatchupCondition::Never,
            strategy: Arc::new(NoCatchup),
            checkpoints,
            dead_letters: None,
            config: ExecutorConfig::default(),
        }
    }

    /// Set the catchup trigger condition.
    pub fn with_condition(mut self, condition: CatchupCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Set the catchup strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn CatchupStrategy<P>>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Route permanently failed events to `sink` instead of dropping
    /// them with a log line.
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Override batch size and retry budget.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// The catchup strategy's view of the driven processor.
    pub fn processor(&self) -> &Arc<P> {
        &self.target
    }

    /// Run the processing loop until the subscription ends.
    ///
    /// Performs the initial catchup, then alternates batches with
    /// catchup-condition checks. Returns `Ok(())` when the subscription
    /// reports end-of-stream.
    pub async fn run(
        &self,
        mut subscription: Box<dyn EventSubscription>,
    ) -> Result<(), ProcessorError> {
        let mut checkpoint = self
            .checkpoints
            .load(self.processor_id)
            .await?
            .unwrap_or_default();

        // Initial catchup at startup.
        self.run_catchup(&mut checkpoint).await?;

        loop {
            let Some(lag) = self.process_batch(&mut subscription, &mut checkpoint).await? else {
                return Ok(());
            };

            tracing::debug!(
                processor_id = self.processor_id,
                unprocessed_events = lag.unprocessed_events,
                average_event_age_ms = lag.average_event_age.as_millis() as u64,
                "batch complete"
            );

            if self.condition.should_catch_up(&lag) {
                self.run_catchup(&mut checkpoint).await?;
            }
        }
    }

    /// Execute the catchup strategy and persist the new skip window.
    async fn run_catchup(&self, checkpoint: &mut ProcessorCheckpoint) -> Result<(), ProcessorError> {
        if let Some(outcome) = self.strategy.catch_up(self.target.as_ref()).await? {
            tracing::info!(
                processor_id = self.processor_id,
                skip_before = ?outcome.skip_before,
                "catchup complete"
            );
            checkpoint.skip_before = outcome.skip_before;
            self.checkpoints.save(self.processor_id, checkpoint).await?;
        }
        Ok(())
    }

    /// Process up to one batch. `Ok(None)` means the subscription ended.
    async fn process_batch(
        &self,
        subscription: &mut Box<dyn EventSubscription>,
        checkpoint: &mut ProcessorCheckpoint,
    ) -> Result<Option<Lag>, ProcessorError> {
        let mut total_age = Duration::ZERO;
        let mut received = 0usize;

        for _ in 0..self.config.batch_size {
            let Some(event) = subscription.next().await? else {
                return Ok(None);
            };
            received += 1;
            let age = (Utc::now() - event.timestamp).to_std().unwrap_or_default();
            total_age += age;

            let window = CatchupOutcome {
                skip_before: checkpoint.skip_before,
            };
            if window.should_skip(&event) {
                // Already incorporated via catchup; advance so a restart
                // does not re-present it.
                checkpoint.advance(event.aggregate_id, event.sequence_number);
                self.checkpoints.save(self.processor_id, checkpoint).await?;
                continue;
            }

            if checkpoint.is_processed(event.aggregate_id, event.sequence_number) {
                // Redelivery of an acknowledged event.
                continue;
            }

            self.dispatch_with_retries(&event, checkpoint).await?;
        }

        let average = if received == 0 {
            Duration::ZERO
        } else {
            total_age / received as u32
        };
        Ok(Some(Lag {
            unprocessed_events: subscription.depth().await,
            average_event_age: average,
        }))
    }

    /// Dispatch one event, spending the retry budget on transient
    /// failures, then dead-lettering (or logging) whatever remains.
    async fn dispatch_with_retries(
        &self,
        event: &Event,
        checkpoint: &mut ProcessorCheckpoint,
    ) -> Result<(), ProcessorError> {
        let mut attempts = 0u32;
        loop {
            match self.dispatch.handle(event).await {
                Ok(()) => {
                    checkpoint.advance(event.aggregate_id, event.sequence_number);
                    checkpoint.events_processed += 1;
                    self.checkpoints.save(self.processor_id, checkpoint).await?;
                    return Ok(());
                }
                Err(error) if error.is_transient() && attempts < self.config.retry_limit => {
                    attempts += 1;
                    tracing::warn!(
                        processor_id = self.processor_id,
                        event_id = %event.id,
                        attempt = attempts,
                        error = %error,
                        "transient failure, retrying"
                    );
                }
                Err(error) => {
                    match &self.dead_letters {
                        Some(sink) => {
                            sink.record(event, &error).await?;
                            tracing::warn!(
                                processor_id = self.processor_id,
                                event_id = %event.id,
                                error = %error,
                                "event dead-lettered"
                            );
                        }
                        None => {
                            tracing::error!(
                                processor_id = self.processor_id,
                                event_id = %event.id,
                                error = %error,
                                "event dropped after failure"
                            );
                        }
                    }
                    // Advance past the poison event so it cannot wedge
                    // the stream; a restart will not re-present it.
                    checkpoint.advance(event.aggregate_id, event.sequence_number);
                    self.checkpoints.save(self.processor_id, checkpoint).await?;
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> ProcessorExecutor for EventProcessorExecutor<P> {
    fn processor_id(&self) -> &'static str {
        self.processor_id
    }

    async fn run(&self, subscription: Box<dyn EventSubscription>) -> Result<(), ProcessorError> {
        EventProcessorExecutor::run(self, subscription).await
    }
}

impl<P: Send + Sync + 'static> std::fmt::Debug for EventProcessorExecutor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessorExecutor")
            .field("processor_id", &self.processor_id)
            .field("condition", &self.condition)
            .field("config", &self.config)
            .finish()
    }
}
