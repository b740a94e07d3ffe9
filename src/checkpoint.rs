//! Processor checkpoints: per-stream cursors plus the catchup watermark.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BackendError;

/// Durable progress record for one processor.
///
/// Cursors advance monotonically per stream; after a crash-recover cycle
/// the executor replays from `cursor + 1` and never skips an unseen
/// event. The `skip_before` watermark marks events already incorporated
/// through a catchup snapshot, so they are filtered instead of
/// re-processed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorCheckpoint {
    /// Last processed sequence number per stream.
    pub cursors: HashMap<Uuid, u64>,
    /// Events with `timestamp <= skip_before` were incorporated by the
    /// last catchup and must not be re-processed.
    pub skip_before: Option<DateTime<Utc>>,
    /// Total events processed, for metrics and diagnostics.
    pub events_processed: u64,
}

impl ProcessorCheckpoint {
    /// The cursor for a stream (0 if never advanced).
    pub fn cursor(&self, stream_id: Uuid) -> u64 {
        self.cursors.get(&stream_id).copied().unwrap_or(0)
    }

    /// Whether an event at `sequence` was already processed.
    pub fn is_processed(&self, stream_id: Uuid, sequence: u64) -> bool {
        sequence <= self.cursor(stream_id)
    }

    /// Advance the stream cursor. Cursors never move backwards.
    pub fn advance(&mut self, stream_id: Uuid, sequence: u64) {
        let cursor = self.cursors.entry(stream_id).or_insert(0);
        if sequence > *cursor {
            *cursor = sequence;
        }
    }
}

/// Storage backend for processor checkpoints.
///
/// `save` must replace the previous checkpoint atomically.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a processor, `None` on first run.
    async fn load(&self, processor_id: &str) -> Result<Option<ProcessorCheckpoint>, BackendError>;

    /// Atomically replace the checkpoint for a processor.
    async fn save(
        &self,
        processor_id: &str,
        checkpoint: &ProcessorCheckpoint,
    ) -> Result<(), BackendError>;
}

/// In-memory checkpoint store keyed by processor id.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, ProcessorCheckpoint>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, processor_id: &str) -> Result<Option<ProcessorCheckpoint>, BackendError> {
        let checkpoints = self.checkpoints.lock().expect("checkpoint lock poisoned");
        Ok(checkpoints.get(processor_id).cloned())
    }

    async fn save(
        &self,
        processor_id: &str,
        checkpoint: &ProcessorCheckpoint,
    ) -> Result<(), BackendError> {
        let mut checkpoints = self.checkpoints.lock().expect("checkpoint lock poisoned");
        checkpoints.insert(processor_id.to_owned(), checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_defaults_to_zero() {
        let checkpoint = ProcessorCheckpoint::default();
        assert_eq!(checkpoint.cursor(Uuid::new_v4()), 0);
    }

    #[test]
    fn advance_is_monotonic() {
        let mut checkpoint = ProcessorCheckpoint::default();
        let stream = Uuid::new_v4();
        checkpoint.advance(stream, 5);
        checkpoint.advance(stream, 3);
        assert_eq!(checkpoint.cursor(stream), 5);
        checkpoint.advance(stream, 6);
        assert_eq!(checkpoint.cursor(stream), 6);
    }

    #[test]
    fn is_processed_compares_against_cursor() {
        let mut checkpoint = ProcessorCheckpoint::default();
        let stream = Uuid::new_v4();
        checkpoint.advance(stream, 4);
        assert!(checkpoint.is_processed(stream, 4));
        assert!(checkpoint.is_processed(stream, 1));
        assert!(!checkpoint.is_processed(stream, 5));
    }

    #[tokio::test]
    async fn store_roundtrips_and_replaces() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load("p1").await.unwrap().is_none());

        let mut checkpoint = ProcessorCheckpoint::default();
        let stream = Uuid::new_v4();
        checkpoint.advance(stream, 2);
        checkpoint.events_processed = 2;
        store.save("p1", &checkpoint).await.unwrap();

        checkpoint.advance(stream, 3);
        checkpoint.events_processed = 3;
        store.save("p1", &checkpoint).await.unwrap();

        let loaded = store.load("p1").await.unwrap().expect("checkpoint saved");
        assert_eq!(loaded.cursor(stream), 3);
        assert_eq!(loaded.events_processed, 3);
    }

    #[test]
    fn checkpoint_serde_roundtrip() {
        let mut checkpoint = ProcessorCheckpoint::default();
        checkpoint.advance(Uuid::new_v4(), 9);
        checkpoint.skip_before = Some(Utc::now());

        let json = serde_json::to_string(&checkpoint).expect("serialize");
        let back: ProcessorCheckpoint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, checkpoint);
    }
}
