//! Aggregate cache backends and the per-type caching policy.
//!
//! Caches are advisory. The repository validates a hit by loading any
//! events past the cached version and replaying them, so a stale entry
//! costs a partial replay, never a wrong answer. Failures inside a cache
//! backend are not observable as errors: a failed `get` is a miss.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateRoot};

/// Per-aggregate-type policy deciding whether commits populate the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Never cache (the default).
    #[default]
    Never,
    /// Cache every committed aggregate.
    Always,
}

impl CacheStrategy {
    /// Whether the repository should cache after a commit.
    pub fn should_cache(&self) -> bool {
        matches!(self, CacheStrategy::Always)
    }
}

/// Storage backend for live aggregate instances.
#[async_trait]
pub trait AggregateCache<A: Aggregate>: Send + Sync {
    /// Fetch a cached instance. A miss (or any internal failure) is `None`.
    async fn get(&self, aggregate_id: Uuid) -> Option<AggregateRoot<A>>;

    /// Store an instance. The root's uncommitted buffer is always empty
    /// when the repository calls this.
    async fn put(&self, root: AggregateRoot<A>);

    /// Drop an instance, e.g. after a concurrency conflict proved it
    /// stale.
    async fn remove(&self, aggregate_id: Uuid);
}

/// The default backend: never hits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAggregateCache;

#[async_trait]
impl<A: Aggregate> AggregateCache<A> for NullAggregateCache {
    async fn get(&self, _aggregate_id: Uuid) -> Option<AggregateRoot<A>> {
        None
    }

    async fn put(&self, _root: AggregateRoot<A>) {}

    async fn remove(&self, _aggregate_id: Uuid) {}
}

/// Process-local cache backed by a hash map.
pub struct InMemoryAggregateCache<A: Aggregate> {
    entries: Mutex<HashMap<Uuid, AggregateRoot<A>>>,
}

impl<A: Aggregate> Default for InMemoryAggregateCache<A> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<A: Aggregate> InMemoryAggregateCache<A> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached instances.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<A: Aggregate> AggregateCache<A> for InMemoryAggregateCache<A> {
    async fn get(&self, aggregate_id: Uuid) -> Option<AggregateRoot<A>> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(&aggregate_id).cloned()
    }

    async fn put(&self, root: AggregateRoot<A>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(root.id(), root);
    }

    async fn remove(&self, aggregate_id: Uuid) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(&aggregate_id);
    }
}
