//! Snapshot strategies and storage backends for aggregate state.
//!
//! Snapshots are an optimization, never a source of truth: a lost or
//! corrupt snapshot only costs a longer replay. The file backend writes
//! atomically via a temp-rename and treats unreadable files as misses.

use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::error::BackendError;

/// A point-in-time capture of aggregate state and stream version.
///
/// `version` records how many events are folded into `state`; replay after
/// restoring resumes at `version + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    /// The aggregate state at capture time.
    pub state: A,
    /// Stream version (number of events applied) at capture time.
    pub version: u64,
    /// When the snapshot was taken (UTC).
    pub taken_at: DateTime<Utc>,
}

/// Per-aggregate-type policy deciding when the repository snapshots.
#[derive(Debug, Clone, Default)]
pub enum SnapshotStrategy {
    /// Never snapshot (the default).
    #[default]
    Never,
    /// Snapshot when the post-commit version is a positive multiple of `n`.
    AfterEvents(u64),
    /// Snapshot when the wall-clock elapsed since the last snapshot
    /// exceeds the duration at the time an event is committed.
    AfterElapsed(Duration),
}

impl SnapshotStrategy {
    /// Evaluate the policy against a just-committed aggregate.
    pub fn should_snapshot(
        &self,
        version: u64,
        last_snapshot_time: DateTime<Utc>,
        last_event_time: DateTime<Utc>,
    ) -> bool {
        match self {
            SnapshotStrategy::Never => false,
            SnapshotStrategy::AfterEvents(n) => *n > 0 && version > 0 && version % n == 0,
            SnapshotStrategy::AfterElapsed(duration) => {
                // A duration too large to represent never elapses.
                chrono::Duration::from_std(*duration)
                    .ok()
                    .and_then(|increment| last_snapshot_time.checked_add_signed(increment))
                    .is_some_and(|deadline| last_event_time >= deadline)
            }
        }
    }
}

/// Storage backend for aggregate snapshots.
///
/// Backends may keep a single latest snapshot or a version history; with a
/// single copy, a `max_version` older than the stored snapshot is a miss
/// and the repository falls back to full replay.
#[async_trait]
pub trait SnapshotStore<A: Aggregate>: Send + Sync {
    /// Persist a snapshot.
    async fn save(&self, aggregate_id: Uuid, snapshot: Snapshot<A>) -> Result<(), BackendError>;

    /// Load the latest snapshot with `version <= max_version` (or the
    /// latest overall when unbounded). `Ok(None)` is a miss, never an
    /// error.
    async fn load(
        &self,
        aggregate_id: Uuid,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot<A>>, BackendError>;

    /// Ids of every aggregate with at least one snapshot. Used by catchup
    /// strategies to discover instances.
    async fn list_ids(&self) -> Result<Vec<Uuid>, BackendError>;
}

/// The default backend: never hits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSnapshotStore;

#[async_trait]
impl<A: Aggregate> SnapshotStore<A> for NullSnapshotStore {
    async fn save(&self, _aggregate_id: Uuid, _snapshot: Snapshot<A>) -> Result<(), BackendError> {
        Ok(())
    }

    async fn load(
        &self,
        _aggregate_id: Uuid,
        _max_version: Option<u64>,
    ) -> Result<Option<Snapshot<A>>, BackendError> {
        Ok(None)
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, BackendError> {
        Ok(Vec::new())
    }
}

/// In-memory backend keeping every snapshot version. Test-oriented.
pub struct InMemorySnapshotStore<A> {
    snapshots: Mutex<HashMap<Uuid, Vec<Snapshot<A>>>>,
}

impl<A> Default for InMemorySnapshotStore<A> {
    fn default() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
        }
    }
}

impl<A> InMemorySnapshotStore<A> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<A: Aggregate> SnapshotStore<A> for InMemorySnapshotStore<A> {
    async fn save(&self, aggregate_id: Uuid, snapshot: Snapshot<A>) -> Result<(), BackendError> {
        let mut snapshots = self.snapshots.lock().expect("snapshot lock poisoned");
        snapshots.entry(aggregate_id).or_default().push(snapshot);
        Ok(())
    }

    async fn load(
        &self,
        aggregate_id: Uuid,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot<A>>, BackendError> {
        let snapshots = self.snapshots.lock().expect("snapshot lock poisoned");
        let Some(history) = snapshots.get(&aggregate_id) else {
            return Ok(None);
        };
        Ok(history
            .iter()
            .rev()
            .find(|s| max_version.is_none_or(|max| s.version <= max))
            .cloned())
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, BackendError> {
        let snapshots = self.snapshots.lock().expect("snapshot lock poisoned");
        Ok(snapshots.keys().copied().collect())
    }
}

/// File-backed snapshot store keeping the single latest snapshot per
/// aggregate at `<base_dir>/<aggregate_type>/<id>.json`.
///
/// Writes go through a temp-rename so readers never observe a partial
/// file. Corrupt files are logged and treated as misses.
#[derive(Debug)]
pub struct FileSnapshotStore<A> {
    base_dir: PathBuf,
    _marker: PhantomData<fn() -> A>,
}

impl<A: Aggregate> FileSnapshotStore<A> {
    /// Create a store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            _marker: PhantomData,
        }
    }

    fn snapshot_path(&self, aggregate_id: Uuid) -> PathBuf {
        self.base_dir
            .join(A::AGGREGATE_TYPE)
            .join(format!("{aggregate_id}.json"))
    }

    fn type_dir(&self) -> PathBuf {
        self.base_dir.join(A::AGGREGATE_TYPE)
    }
}

fn io_backend_error(operation: &str, path: &Path, e: io::Error) -> BackendError {
    BackendError::transient(format!("{operation} {} failed: {e}", path.display()))
}

#[async_trait]
impl<A: Aggregate> SnapshotStore<A> for FileSnapshotStore<A> {
    async fn save(&self, aggregate_id: Uuid, snapshot: Snapshot<A>) -> Result<(), BackendError> {
        let path = self.snapshot_path(aggregate_id);
        let dir = path.parent().expect("snapshot path always has a parent");
        std::fs::create_dir_all(dir).map_err(|e| io_backend_error("create", dir, e))?;

        let json = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| io_backend_error("write", &tmp_path, e))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| io_backend_error("rename", &path, e))?;
        Ok(())
    }

    async fn load(
        &self,
        aggregate_id: Uuid,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot<A>>, BackendError> {
        let path = self.snapshot_path(aggregate_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_backend_error("read", &path, e)),
        };

        match serde_json::from_slice::<Snapshot<A>>(&bytes) {
            Ok(snapshot) => {
                if max_version.is_some_and(|max| snapshot.version > max) {
                    return Ok(None);
                }
                Ok(Some(snapshot))
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as miss"
                );
                Ok(None)
            }
        }
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, BackendError> {
        let dir = self.type_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_backend_error("read dir", &dir, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_backend_error("read dir entry", &dir, e))?;
            let name = entry.file_name();
            let Some(stem) = Path::new(&name).file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(id) = stem.parse::<Uuid>() {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
