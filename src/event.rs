//! Event envelope, tagged payload values, and the payload registry.
//!
//! Events are polymorphic on their payload. In memory a payload travels as
//! an [`EventData`]: a type tag plus a type-erased `Arc` that handlers
//! downcast by `TypeId`. At the storage boundary it becomes a
//! [`PersistedEvent`] with the payload serialized to JSON; the
//! [`PayloadRegistry`] maps tags back to typed values on load.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::StoreError;

/// A typed event payload.
///
/// The tag names the payload *schema version* in storage; upcasters are
/// keyed on it. By convention versioned payloads carry a suffix
/// (`"MoneyDeposited.v2"`), and the tag of a payload type never changes
/// once events carrying it have been persisted.
pub trait EventPayload:
    Serialize + DeserializeOwned + Clone + Send + Sync + fmt::Debug + 'static
{
    /// Stable type tag stored alongside the serialized payload.
    const TYPE_TAG: &'static str;
}

/// Monomorphized encoder stored inside [`EventData`].
fn encode_erased<P: EventPayload>(
    value: &(dyn Any + Send + Sync),
) -> serde_json::Result<serde_json::Value> {
    let payload = value
        .downcast_ref::<P>()
        .expect("EventData type id always matches its encoder");
    serde_json::to_value(payload)
}

/// A type-erased, cloneable payload value.
///
/// Carries the payload's tag, its `TypeId` for O(1) handler routing, the
/// value itself behind an `Arc`, and an encoder so storage backends can
/// serialize without knowing the concrete type.
#[derive(Clone)]
pub struct EventData {
    tag: &'static str,
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    encode: fn(&(dyn Any + Send + Sync)) -> serde_json::Result<serde_json::Value>,
}

impl EventData {
    /// Wrap a typed payload.
    pub fn new<P: EventPayload>(payload: P) -> Self {
        Self {
            tag: P::TYPE_TAG,
            type_id: TypeId::of::<P>(),
            value: Arc::new(payload),
            encode: encode_erased::<P>,
        }
    }

    /// The payload's type tag.
    pub fn type_tag(&self) -> &'static str {
        self.tag
    }

    /// The payload's Rust `TypeId`, used for handler routing.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Whether the payload is a `P`.
    pub fn is<P: EventPayload>(&self) -> bool {
        self.type_id == TypeId::of::<P>()
    }

    /// Borrow the payload as a `P`, if it is one.
    pub fn downcast_ref<P: EventPayload>(&self) -> Option<&P> {
        self.value.downcast_ref::<P>()
    }

    /// Serialize the payload to JSON for persistence.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be serialized.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        (self.encode)(self.value.as_ref())
    }
}

impl fmt::Debug for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventData").field("tag", &self.tag).finish()
    }
}

// Equality compares tag and serialized form: two payloads of the same type
// with the same field values are equal even across separate allocations.
impl PartialEq for EventData {
    fn eq(&self, other: &Self) -> bool {
        if self.tag != other.tag {
            return false;
        }
        match (self.to_json(), other.to_json()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Immutable record of a state change in an aggregate.
///
/// Sequence numbers are 1-indexed, contiguous, and strictly increasing
/// within a stream. Timestamps are UTC, assigned at emit. The correlation
/// and causation ids come from the [`ExecutionContext`] active when the
/// event was emitted (causation is the command id that produced it).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Unique id of this event instance.
    pub id: Uuid,
    /// Id of the aggregate (stream) that produced the event.
    pub aggregate_id: Uuid,
    /// 1-indexed position within the aggregate's stream.
    pub sequence_number: u64,
    /// When the event was emitted (UTC).
    pub timestamp: DateTime<Utc>,
    /// The typed payload.
    pub payload: EventData,
    /// Id tracing the whole logical operation.
    pub correlation_id: Option<Uuid>,
    /// Id of what directly caused this event (typically a command id).
    pub causation_id: Option<Uuid>,
}

impl Event {
    /// Create an event with a fresh id and the current UTC timestamp.
    pub fn new(aggregate_id: Uuid, sequence_number: u64, payload: EventData) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            sequence_number,
            timestamp: Utc::now(),
            payload,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Stamp correlation and causation from an execution context.
    ///
    /// Causation is the context's command id: the command that was
    /// executing when this event was emitted.
    pub fn with_context(mut self, ctx: &ExecutionContext) -> Self {
        self.correlation_id = ctx.correlation_id;
        self.causation_id = ctx.command_id;
        self
    }

    /// Replace the payload, keeping every envelope field.
    ///
    /// Used by the upcasting pipeline, which must preserve id, stream,
    /// sequence, timestamp, and tracing ids across each step.
    pub fn with_payload(mut self, payload: EventData) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize to the storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Codec`] if the payload cannot be serialized.
    pub fn to_persisted(&self) -> Result<PersistedEvent, StoreError> {
        Ok(PersistedEvent {
            event_id: self.id,
            aggregate_id: self.aggregate_id,
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            payload_type: self.payload.type_tag().to_owned(),
            payload: self.payload.to_json()?,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
        })
    }

    /// Revive an event from its storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownPayloadType`] if the tag has no
    /// registered decoder, or [`StoreError::Codec`] if decoding fails.
    pub fn from_persisted(
        persisted: &PersistedEvent,
        registry: &PayloadRegistry,
    ) -> Result<Self, StoreError> {
        let payload = registry.decode(&persisted.payload_type, persisted.payload.clone())?;
        Ok(Self {
            id: persisted.event_id,
            aggregate_id: persisted.aggregate_id,
            sequence_number: persisted.sequence_number,
            timestamp: persisted.timestamp,
            payload,
            correlation_id: persisted.correlation_id,
            causation_id: persisted.causation_id,
        })
    }
}

/// Storage representation of an event envelope.
///
/// This is the reference serialization backends persist: the payload is
/// reduced to a `(type tag, JSON)` pair so the store never depends on
/// payload types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEvent {
    /// Unique id of the event instance.
    pub event_id: Uuid,
    /// Id of the stream the event belongs to.
    pub aggregate_id: Uuid,
    /// 1-indexed position within the stream.
    pub sequence_number: u64,
    /// When the event was emitted (UTC).
    pub timestamp: DateTime<Utc>,
    /// Payload type tag, resolved through the [`PayloadRegistry`] on load.
    pub payload_type: String,
    /// Serialized payload.
    pub payload: serde_json::Value,
    /// Id tracing the whole logical operation.
    pub correlation_id: Option<Uuid>,
    /// Id of what directly caused this event.
    pub causation_id: Option<Uuid>,
}

/// Monomorphized decoder stored inside [`PayloadRegistry`].
fn decode_erased<P: EventPayload>(value: serde_json::Value) -> serde_json::Result<EventData> {
    Ok(EventData::new(serde_json::from_value::<P>(value)?))
}

/// Maps payload type tags to decoders.
///
/// Every payload type that can appear in storage must be registered, old
/// schema versions included: a stream holding `"MoneyDeposited.v1"` events
/// needs that type registered even if the aggregate only emits `.v3` today
/// (the upcaster pipeline runs after decoding).
#[derive(Default)]
pub struct PayloadRegistry {
    decoders: HashMap<&'static str, fn(serde_json::Value) -> serde_json::Result<EventData>>,
}

impl PayloadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type under its `TYPE_TAG`.
    ///
    /// Re-registering the same type is a no-op.
    pub fn register<P: EventPayload>(&mut self) {
        self.decoders.insert(P::TYPE_TAG, decode_erased::<P>);
    }

    /// Whether a tag has a registered decoder.
    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Decode a serialized payload by tag.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownPayloadType`] for unregistered tags and
    /// [`StoreError::Codec`] when the JSON does not match the registered
    /// type.
    pub fn decode(&self, tag: &str, value: serde_json::Value) -> Result<EventData, StoreError> {
        let decode = self
            .decoders
            .get(tag)
            .ok_or_else(|| StoreError::UnknownPayloadType(tag.to_owned()))?;
        decode(value).map_err(StoreError::Codec)
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("PayloadRegistry")
            .field("tags", &tags)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{MoneyDeposited, MoneyWithdrawn};
    use super::*;

    #[test]
    fn event_data_downcasts_to_concrete_payload() {
        let data = EventData::new(MoneyDeposited { amount: 100 });
        assert_eq!(data.type_tag(), "MoneyDeposited");
        assert!(data.is::<MoneyDeposited>());
        assert!(!data.is::<MoneyWithdrawn>());
        assert_eq!(
            data.downcast_ref::<MoneyDeposited>(),
            Some(&MoneyDeposited { amount: 100 })
        );
        assert_eq!(data.downcast_ref::<MoneyWithdrawn>(), None);
    }

    #[test]
    fn event_data_equality_is_structural() {
        let a = EventData::new(MoneyDeposited { amount: 100 });
        let b = EventData::new(MoneyDeposited { amount: 100 });
        let c = EventData::new(MoneyDeposited { amount: 50 });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn event_with_context_stamps_tracing_ids() {
        let ctx = ExecutionContext::create(None).for_command(Uuid::new_v4());
        let event = Event::new(
            Uuid::new_v4(),
            1,
            EventData::new(MoneyDeposited { amount: 1 }),
        )
        .with_context(&ctx);

        assert_eq!(event.correlation_id, ctx.correlation_id);
        assert_eq!(event.causation_id, ctx.command_id);
    }

    #[test]
    fn with_payload_preserves_envelope_metadata() {
        let original = Event::new(
            Uuid::new_v4(),
            3,
            EventData::new(MoneyDeposited { amount: 7 }),
        );
        let swapped = original
            .clone()
            .with_payload(EventData::new(MoneyWithdrawn { amount: 7 }));

        assert_eq!(swapped.id, original.id);
        assert_eq!(swapped.aggregate_id, original.aggregate_id);
        assert_eq!(swapped.sequence_number, original.sequence_number);
        assert_eq!(swapped.timestamp, original.timestamp);
        assert_eq!(swapped.payload.type_tag(), "MoneyWithdrawn");
    }

    #[test]
    fn persisted_roundtrip_restores_typed_payload() {
        let mut registry = PayloadRegistry::new();
        registry.register::<MoneyDeposited>();

        let event = Event::new(
            Uuid::new_v4(),
            1,
            EventData::new(MoneyDeposited { amount: 42 }),
        );
        let persisted = event.to_persisted().expect("serialization should succeed");
        assert_eq!(persisted.payload_type, "MoneyDeposited");

        let revived =
            Event::from_persisted(&persisted, &registry).expect("decoding should succeed");
        assert_eq!(revived, event);
        assert_eq!(
            revived.payload.downcast_ref::<MoneyDeposited>(),
            Some(&MoneyDeposited { amount: 42 })
        );
    }

    #[test]
    fn unregistered_tag_is_an_unknown_payload_error() {
        let registry = PayloadRegistry::new();
        let event = Event::new(
            Uuid::new_v4(),
            1,
            EventData::new(MoneyDeposited { amount: 1 }),
        );
        let persisted = event.to_persisted().expect("serialization should succeed");

        let result = Event::from_persisted(&persisted, &registry);
        assert!(matches!(
            result,
            Err(StoreError::UnknownPayloadType(tag)) if tag == "MoneyDeposited"
        ));
    }

    #[test]
    fn malformed_payload_is_a_codec_error() {
        let mut registry = PayloadRegistry::new();
        registry.register::<MoneyDeposited>();

        let result = registry.decode("MoneyDeposited", serde_json::json!({"amount": "NaN"}));
        assert!(matches!(result, Err(StoreError::Codec(_))));
    }

    #[test]
    fn persisted_event_serde_roundtrip() {
        let event = Event::new(
            Uuid::new_v4(),
            9,
            EventData::new(MoneyDeposited { amount: 5 }),
        );
        let persisted = event.to_persisted().expect("serialization should succeed");

        let json = serde_json::to_string(&persisted).expect("serialize");
        let back: PersistedEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.event_id, persisted.event_id);
        assert_eq!(back.sequence_number, 9);
        assert_eq!(back.payload_type, "MoneyDeposited");
    }
}
