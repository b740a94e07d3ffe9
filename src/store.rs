//! Event store interface and the in-memory reference implementation.
//!
//! The store is the single source of truth: an append-only log per stream
//! with optimistic concurrency on append. Everything else in the system
//! (snapshots, caches, read models) can be rebuilt from it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::event::{Event, PayloadRegistry, PersistedEvent};
use crate::error::StoreError;

/// Durable, append-only event persistence.
///
/// Per-stream ordering is strictly monotonic; no cross-stream total order
/// is required. Appends are atomic: either every event in the batch is
/// persisted or none are.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to a stream, gated on its current length.
    ///
    /// Sequence numbers `expected_version + 1 ..= expected_version + n`
    /// are assigned atomically on success.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the stream's current length differs
    /// from `expected_version`.
    async fn append(
        &self,
        stream_id: Uuid,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, StoreError>;

    /// Load events with `sequence_number >= min_version` (and
    /// `<= max_version` when bounded), in order.
    ///
    /// An empty or unknown stream yields an empty vec, never an error.
    async fn load(
        &self,
        stream_id: Uuid,
        min_version: u64,
        max_version: Option<u64>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Replace already-persisted events in place, preserving their ids and
    /// sequence numbers. Used only by eager upcasting; optional capability.
    ///
    /// # Errors
    ///
    /// [`StoreError::RewriteUnsupported`] unless the backend overrides
    /// this; [`StoreError::Corrupt`] if an event's id or sequence does not
    /// match what is stored.
    async fn rewrite(&self, _stream_id: Uuid, _events: Vec<Event>) -> Result<(), StoreError> {
        Err(StoreError::RewriteUnsupported)
    }

    /// Whether [`rewrite`](EventStore::rewrite) is implemented. Eager
    /// upcasting degrades to lazy when this is `false`.
    fn supports_rewrite(&self) -> bool {
        false
    }
}

/// In-memory event store for tests and single-process deployments.
///
/// Events are held in their persisted form (tag + JSON payload) and decoded
/// through the [`PayloadRegistry`] on load, exercising the same polymorphic
/// codec path a durable backend would. State is shared across clones.
#[derive(Clone)]
pub struct InMemoryEventStore {
    streams: Arc<Mutex<HashMap<Uuid, Vec<PersistedEvent>>>>,
    registry: Arc<PayloadRegistry>,
}

impl InMemoryEventStore {
    /// Create a store decoding payloads through `registry`.
    pub fn new(registry: Arc<PayloadRegistry>) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            registry,
        }
    }

    /// Current length of a stream (0 for unknown streams).
    pub fn stream_length(&self, stream_id: Uuid) -> u64 {
        let streams = self.streams.lock().expect("store lock poisoned");
        streams.get(&stream_id).map_or(0, |s| s.len() as u64)
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let streams = self.streams.lock().expect("store lock poisoned");
        f.debug_struct("InMemoryEventStore")
            .field("streams", &streams.len())
            .finish()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: Uuid,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, StoreError> {
        if events.is_empty() {
            return Ok(expected_version);
        }

        // Serialize outside the lock; only the version check and push
        // happen under it, keeping append atomic without interior awaits.
        let mut batch = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            let mut persisted = event.to_persisted()?;
            persisted.sequence_number = expected_version + offset as u64 + 1;
            batch.push(persisted);
        }

        let mut streams = self.streams.lock().expect("store lock poisoned");
        let stream = streams.entry(stream_id).or_default();
        let actual = stream.len() as u64;
        if actual != expected_version {
            return Err(StoreError::Conflict {
                stream_id,
                expected: expected_version,
                actual,
            });
        }
        stream.extend(batch);
        let committed = stream.len() as u64;

        tracing::debug!(
            stream_id = %stream_id,
            count = events.len(),
            version = committed,
            "events appended"
        );
        Ok(committed)
    }

    async fn load(
        &self,
        stream_id: Uuid,
        min_version: u64,
        max_version: Option<u64>,
    ) -> Result<Vec<Event>, StoreError> {
        let upper = max_version.unwrap_or(u64::MAX);
        let persisted: Vec<PersistedEvent> = {
            let streams = self.streams.lock().expect("store lock poisoned");
            streams
                .get(&stream_id)
                .map(|stream| {
                    stream
                        .iter()
                        .filter(|e| e.sequence_number >= min_version && e.sequence_number <= upper)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        persisted
            .iter()
            .map(|p| Event::from_persisted(p, &self.registry))
            .collect()
    }

    async fn rewrite(&self, stream_id: Uuid, events: Vec<Event>) -> Result<(), StoreError> {
        let mut replacements = Vec::with_capacity(events.len());
        for event in &events {
            replacements.push(event.to_persisted()?);
        }

        let mut streams = self.streams.lock().expect("store lock poisoned");
        let stream = streams.get_mut(&stream_id).ok_or_else(|| {
            StoreError::Corrupt(format!("rewrite of unknown stream {stream_id}"))
        })?;

        for replacement in replacements {
            let slot = stream
                .iter_mut()
                .find(|e| e.sequence_number == replacement.sequence_number)
                .ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "rewrite of missing sequence {} in stream {stream_id}",
                        replacement.sequence_number
                    ))
                })?;
            if slot.event_id != replacement.event_id {
                return Err(StoreError::Corrupt(format!(
                    "rewrite would change event id at sequence {}",
                    replacement.sequence_number
                )));
            }
            *slot = replacement;
        }
        Ok(())
    }

    fn supports_rewrite(&self) -> bool {
        true
    }
}
