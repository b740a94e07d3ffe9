//! Event schema evolution: upcasters, chains, and the pipeline.
//!
//! An upcaster rewrites a payload from an older type to a newer one;
//! chains compose transitively (`V1 -> V2` and `V2 -> V3` upgrade a stored
//! `V1` to `V3` in one load). The walk follows tags until it reaches a
//! type with no outgoing edge. Cycles are a configuration error caught
//! when the pipeline is built. Envelope metadata (id, stream, sequence,
//! timestamp, correlation, causation) is preserved through every step.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BuildError, UpcastError};
use crate::event::{Event, EventData, EventPayload};

/// Safety cap on chain length; build-time cycle detection means a real
/// chain can never get close.
const MAX_CHAIN_STEPS: usize = 32;

/// Transforms event payloads from one schema version to the next.
pub trait Upcaster: Send + Sync {
    /// Tag of the payload type this upcaster consumes.
    fn source_tag(&self) -> &'static str;

    /// Tag of the payload type this upcaster produces.
    fn target_tag(&self) -> &'static str;

    /// Whether this upcaster applies to a specific event. Override for
    /// conditional upcasting (e.g. only events before a cutoff date).
    fn can_upcast(&self, _event: &Event) -> bool {
        true
    }

    /// Produce the upgraded payload.
    ///
    /// # Errors
    ///
    /// [`UpcastError::Failed`] if the payload cannot be transformed.
    fn upcast(&self, event: &Event) -> Result<EventData, UpcastError>;
}

/// An upcaster built from a conversion closure between two payload types.
///
/// # Examples
///
/// ```
/// use chronicle::{EventPayload, FnUpcaster};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlacedV1 {
///     product: String,
/// }
/// impl EventPayload for OrderPlacedV1 {
///     const TYPE_TAG: &'static str = "OrderPlaced.v1";
/// }
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlacedV2 {
///     product: String,
///     quantity: u32,
/// }
/// impl EventPayload for OrderPlacedV2 {
///     const TYPE_TAG: &'static str = "OrderPlaced.v2";
/// }
///
/// let upcaster = FnUpcaster::new(|old: &OrderPlacedV1| OrderPlacedV2 {
///     product: old.product.clone(),
///     quantity: 1,
/// });
/// ```
pub struct FnUpcaster<S, T> {
    convert: Box<dyn Fn(&S) -> T + Send + Sync>,
}

impl<S: EventPayload, T: EventPayload> FnUpcaster<S, T> {
    /// Wrap a conversion closure.
    pub fn new(convert: impl Fn(&S) -> T + Send + Sync + 'static) -> Self {
        Self {
            convert: Box::new(convert),
        }
    }
}

impl<S: EventPayload, T: EventPayload> Upcaster for FnUpcaster<S, T> {
    fn source_tag(&self) -> &'static str {
        S::TYPE_TAG
    }

    fn target_tag(&self) -> &'static str {
        T::TYPE_TAG
    }

    fn upcast(&self, event: &Event) -> Result<EventData, UpcastError> {
        let source = event
            .payload
            .downcast_ref::<S>()
            .ok_or_else(|| UpcastError::Failed {
                tag: event.payload.type_tag().to_owned(),
                message: format!("payload is not a {}", S::TYPE_TAG),
            })?;
        Ok(EventData::new((self.convert)(source)))
    }
}

/// When the pipeline runs relative to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpcastingStrategy {
    /// Upcast on read only; the write path stores whatever the aggregate
    /// emitted. The recommended default: storage stays immutable.
    #[default]
    Lazy,
    /// Upcast on read and write, and rewrite upgraded events back to the
    /// store on load (gradual migration). Requires the store to support
    /// `rewrite`; degrades to lazy persistence when it does not.
    Eager,
}

impl UpcastingStrategy {
    /// Whether loads run the pipeline.
    pub fn upcast_on_read(&self) -> bool {
        true
    }

    /// Whether appends run the pipeline.
    pub fn upcast_on_write(&self) -> bool {
        matches!(self, UpcastingStrategy::Eager)
    }

    /// Whether upgraded events should be rewritten to the store on load.
    pub fn rewrite_on_load(&self) -> bool {
        matches!(self, UpcastingStrategy::Eager)
    }
}

/// Applies upcaster chains to events on the read and write paths.
pub struct UpcastingPipeline {
    strategy: UpcastingStrategy,
    by_source: HashMap<&'static str, Vec<Arc<dyn Upcaster>>>,
}

impl UpcastingPipeline {
    /// Build a pipeline, validating that the upcaster graph is acyclic.
    ///
    /// # Errors
    ///
    /// [`BuildError::UpcasterCycle`] naming a tag on the cycle.
    pub fn new(
        strategy: UpcastingStrategy,
        upcasters: Vec<Arc<dyn Upcaster>>,
    ) -> Result<Self, BuildError> {
        let mut by_source: HashMap<&'static str, Vec<Arc<dyn Upcaster>>> = HashMap::new();
        for upcaster in upcasters {
            by_source.entry(upcaster.source_tag()).or_default().push(upcaster);
        }
        detect_cycle(&by_source)?;
        Ok(Self { strategy, by_source })
    }

    /// A pipeline with no upcasters: every type is terminal.
    pub fn empty() -> Self {
        Self {
            strategy: UpcastingStrategy::Lazy,
            by_source: HashMap::new(),
        }
    }

    /// The configured strategy.
    pub fn strategy(&self) -> UpcastingStrategy {
        self.strategy
    }

    /// Whether loads should persist upgraded events back to the store.
    pub fn rewrite_on_load(&self) -> bool {
        self.strategy.rewrite_on_load()
    }

    /// One chain step: `Some(payload)` if an upcaster matched, `None` if
    /// the payload's type is terminal.
    fn upcast_once(&self, event: &Event) -> Result<Option<EventData>, UpcastError> {
        let Some(candidates) = self.by_source.get(event.payload.type_tag()) else {
            return Ok(None);
        };
        for upcaster in candidates {
            if upcaster.can_upcast(event) {
                return upcaster.upcast(event).map(Some);
            }
        }
        Ok(None)
    }

    /// Walk the chain from the event's payload type to a terminal type.
    pub fn upcast_chain(&self, mut event: Event) -> Result<Event, UpcastError> {
        let starting_tag = event.payload.type_tag().to_owned();
        for _ in 0..MAX_CHAIN_STEPS {
            match self.upcast_once(&event)? {
                Some(payload) => event = event.with_payload(payload),
                None => return Ok(event),
            }
        }
        Err(UpcastError::ChainTooDeep {
            tag: starting_tag,
            max_steps: MAX_CHAIN_STEPS,
        })
    }

    /// Upcast events loaded from the store, when the strategy reads.
    pub fn read_upcast(&self, events: Vec<Event>) -> Result<Vec<Event>, UpcastError> {
        if !self.strategy.upcast_on_read() {
            return Ok(events);
        }
        events.into_iter().map(|e| self.upcast_chain(e)).collect()
    }

    /// Upcast events being appended, when the strategy writes.
    pub fn write_upcast(&self, events: Vec<Event>) -> Result<Vec<Event>, UpcastError> {
        if !self.strategy.upcast_on_write() {
            return Ok(events);
        }
        events.into_iter().map(|e| self.upcast_chain(e)).collect()
    }
}

impl std::fmt::Debug for UpcastingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut edges: Vec<String> = self
            .by_source
            .iter()
            .flat_map(|(source, ups)| {
                ups.iter().map(move |u| format!("{source} -> {}", u.target_tag()))
            })
            .collect();
        edges.sort();
        f.debug_struct("UpcastingPipeline")
            .field("strategy", &self.strategy)
            .field("edges", &edges)
            .finish()
    }
}

/// Depth-first three-color cycle detection over the tag graph.
fn detect_cycle(
    by_source: &HashMap<&'static str, Vec<Arc<dyn Upcaster>>>,
) -> Result<(), BuildError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        tag: &'static str,
        by_source: &HashMap<&'static str, Vec<Arc<dyn Upcaster>>>,
        marks: &mut HashMap<&'static str, Mark>,
    ) -> Result<(), BuildError> {
        match marks.get(tag) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(BuildError::UpcasterCycle {
                    tag: tag.to_owned(),
                })
            }
            None => {}
        }
        marks.insert(tag, Mark::Visiting);
        if let Some(upcasters) = by_source.get(tag) {
            for upcaster in upcasters {
                visit(upcaster.target_tag(), by_source, marks)?;
            }
        }
        marks.insert(tag, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for tag in by_source.keys() {
        visit(tag, by_source, &mut marks)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use uuid::Uuid;

    fn v1_event() -> Event {
        Event::new(
            Uuid::new_v4(),
            1,
            EventData::new(MoneyDepositedV1 { amount: 100 }),
        )
    }

    #[test]
    fn chain_upgrades_v1_to_v3() {
        let pipeline =
            UpcastingPipeline::new(UpcastingStrategy::Lazy, vec![v1_to_v2(), v2_to_v3()])
                .expect("acyclic graph should build");

        let upgraded = pipeline.upcast_chain(v1_event()).expect("chain should run");
        assert_eq!(
            upgraded.payload.downcast_ref::<MoneyDepositedV3>(),
            Some(&MoneyDepositedV3 {
                amount: 100,
                source: "unknown".to_owned(),
                currency: "USD".to_owned(),
            })
        );
    }

    #[test]
    fn chain_preserves_envelope_metadata() {
        let pipeline =
            UpcastingPipeline::new(UpcastingStrategy::Lazy, vec![v1_to_v2(), v2_to_v3()])
                .expect("acyclic graph should build");

        let original = v1_event();
        let upgraded = pipeline
            .upcast_chain(original.clone())
            .expect("chain should run");

        assert_eq!(upgraded.id, original.id);
        assert_eq!(upgraded.aggregate_id, original.aggregate_id);
        assert_eq!(upgraded.sequence_number, original.sequence_number);
        assert_eq!(upgraded.timestamp, original.timestamp);
        assert_eq!(upgraded.correlation_id, original.correlation_id);
        assert_eq!(upgraded.causation_id, original.causation_id);
    }

    #[test]
    fn terminal_type_passes_through() {
        let pipeline =
            UpcastingPipeline::new(UpcastingStrategy::Lazy, vec![v1_to_v2(), v2_to_v3()])
                .expect("acyclic graph should build");

        let terminal = Event::new(
            Uuid::new_v4(),
            1,
            EventData::new(MoneyDepositedV3 {
                amount: 5,
                source: "wire".to_owned(),
                currency: "EUR".to_owned(),
            }),
        );
        let result = pipeline
            .upcast_chain(terminal.clone())
            .expect("terminal payload should pass through");
        assert_eq!(result.payload, terminal.payload);
    }

    #[test]
    fn cycle_is_rejected_at_build() {
        let forward = v1_to_v2();
        let backward: Arc<dyn Upcaster> =
            Arc::new(FnUpcaster::new(|new: &MoneyDepositedV2| MoneyDepositedV1 {
                amount: new.amount,
            }));

        let result = UpcastingPipeline::new(UpcastingStrategy::Lazy, vec![forward, backward]);
        assert!(matches!(result, Err(BuildError::UpcasterCycle { .. })));
    }

    #[test]
    fn can_upcast_false_stops_the_chain() {
        struct Gated;
        impl Upcaster for Gated {
            fn source_tag(&self) -> &'static str {
                MoneyDepositedV1::TYPE_TAG
            }
            fn target_tag(&self) -> &'static str {
                MoneyDepositedV2::TYPE_TAG
            }
            fn can_upcast(&self, _event: &Event) -> bool {
                false
            }
            fn upcast(&self, _event: &Event) -> Result<EventData, UpcastError> {
                unreachable!("gated upcaster never runs")
            }
        }

        let pipeline = UpcastingPipeline::new(UpcastingStrategy::Lazy, vec![Arc::new(Gated)])
            .expect("graph should build");
        let event = v1_event();
        let result = pipeline.upcast_chain(event.clone()).expect("chain runs");
        assert_eq!(result.payload, event.payload);
    }

    #[test]
    fn lazy_strategy_reads_but_does_not_write() {
        let pipeline = UpcastingPipeline::new(UpcastingStrategy::Lazy, vec![v1_to_v2()])
            .expect("graph should build");

        let read = pipeline.read_upcast(vec![v1_event()]).expect("read");
        assert_eq!(read[0].payload.type_tag(), "MoneyDeposited.v2");

        let written = pipeline.write_upcast(vec![v1_event()]).expect("write");
        assert_eq!(written[0].payload.type_tag(), "MoneyDeposited.v1");
        assert!(!pipeline.rewrite_on_load());
    }

    #[test]
    fn eager_strategy_writes_and_rewrites() {
        let pipeline = UpcastingPipeline::new(UpcastingStrategy::Eager, vec![v1_to_v2()])
            .expect("graph should build");

        let written = pipeline.write_upcast(vec![v1_event()]).expect("write");
        assert_eq!(written[0].payload.type_tag(), "MoneyDeposited.v2");
        assert!(pipeline.rewrite_on_load());
    }

    #[test]
    fn mismatched_payload_is_an_upcast_failure() {
        let upcaster = v1_to_v2();
        let wrong = Event::new(
            Uuid::new_v4(),
            1,
            EventData::new(MoneyDepositedV3 {
                amount: 1,
                source: "s".to_owned(),
                currency: "USD".to_owned(),
            }),
        );
        let err = upcaster.upcast(&wrong).expect_err("wrong payload type");
        assert!(matches!(err, UpcastError::Failed { .. }));
    }
}
