//! Scoped aggregate access: load, handle, commit.
//!
//! The repository mediates between the aggregate runtime and the
//! backends. Loads go cache -> snapshot -> event store (cheapest first);
//! commits go append -> snapshot policy -> cache policy. A per-id async
//! lock serializes scope acquisitions so one aggregate instance never
//! handles two commands concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateHandlers, AggregateRoot};
use crate::cache::{AggregateCache, CacheStrategy, NullAggregateCache};
use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::event_bus::EventBus;
use crate::snapshot::{NullSnapshotStore, SnapshotStore, SnapshotStrategy};

/// Per-type backends and policies for a repository.
///
/// Defaults are the safe no-ops: no snapshots, no caching.
pub struct AggregateConfig<A: Aggregate> {
    /// Snapshot backend.
    pub snapshot_store: Arc<dyn SnapshotStore<A>>,
    /// When to take snapshots.
    pub snapshot_strategy: SnapshotStrategy,
    /// Cache backend.
    pub cache: Arc<dyn AggregateCache<A>>,
    /// When to cache.
    pub cache_strategy: CacheStrategy,
}

impl<A: Aggregate> Default for AggregateConfig<A> {
    fn default() -> Self {
        Self {
            snapshot_store: Arc::new(NullSnapshotStore),
            snapshot_strategy: SnapshotStrategy::Never,
            cache: Arc::new(NullAggregateCache),
            cache_strategy: CacheStrategy::Never,
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateConfig<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateConfig")
            .field("snapshot_strategy", &self.snapshot_strategy)
            .field("cache_strategy", &self.cache_strategy)
            .finish()
    }
}

/// Loads and saves aggregates of one type in a consistent way.
///
/// The repository is mostly a mediator: the strategies decide *when* to
/// snapshot or cache, the backends decide *how*, and the event bus owns
/// persistence and delivery.
pub struct AggregateRepository<A: Aggregate> {
    handlers: Arc<AggregateHandlers<A>>,
    event_bus: Arc<EventBus>,
    config: AggregateConfig<A>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl<A: Aggregate> AggregateRepository<A> {
    /// Create a repository over the event bus with the given backends.
    pub fn new(event_bus: Arc<EventBus>, config: AggregateConfig<A>) -> Self {
        Self {
            handlers: AggregateHandlers::for_aggregate(),
            event_bus,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The aggregate's handler tables (command routing metadata).
    pub(crate) fn handlers(&self) -> &Arc<AggregateHandlers<A>> {
        &self.handlers
    }

    /// The per-id lock, created on first use.
    fn lock_for(&self, aggregate_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        Arc::clone(locks.entry(aggregate_id).or_default())
    }

    /// Acquire the aggregate, run `operation`, and commit or discard.
    ///
    /// The scope holds the per-id lock for its whole duration: exactly
    /// one command is in flight per aggregate instance. On success, any
    /// emitted events are appended (version-gated), the snapshot and
    /// cache policies run, and the events reach the event bus. On error
    /// the instance is discarded uncommitted.
    pub async fn execute<R>(
        &self,
        aggregate_id: Uuid,
        context: ExecutionContext,
        operation: impl FnOnce(&mut AggregateRoot<A>) -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        let lock = self.lock_for(aggregate_id);
        let _guard = lock.lock().await;

        let mut root = self.load_root(aggregate_id).await?;
        let loaded_version = root.version();

        root.set_context(context);
        let result = operation(&mut root);
        root.clear_context();

        match result {
            Ok(response) => {
                self.commit(&mut root, loaded_version).await?;
                Ok(response)
            }
            Err(error) => {
                root.clear_uncommitted();
                Err(error)
            }
        }
    }

    /// Load an aggregate for reading; no lock, no commit.
    pub async fn load(&self, aggregate_id: Uuid) -> Result<AggregateRoot<A>, DispatchError> {
        self.load_root(aggregate_id).await
    }

    /// Ids of every aggregate of this type known to the snapshot
    /// backend. Used by catchup strategies for instance discovery.
    pub async fn list_all_ids(&self) -> Result<Vec<Uuid>, DispatchError> {
        Ok(self.config.snapshot_store.list_ids().await?)
    }

    async fn load_root(&self, aggregate_id: Uuid) -> Result<AggregateRoot<A>, DispatchError> {
        // (Low cost) Cache. The hit is validated against the store by
        // replaying any events past the cached version.
        if let Some(mut cached) = self.config.cache.get(aggregate_id).await {
            let newer = self
                .event_bus
                .load_events(aggregate_id, cached.version() + 1)
                .await?;
            if !newer.is_empty() {
                cached.replay(&newer);
            }
            return Ok(cached);
        }

        // (Medium cost) Snapshot. Failures are misses: a snapshot is
        // never required for correctness.
        let mut root = match self.config.snapshot_store.load(aggregate_id, None).await {
            Ok(Some(snapshot)) => {
                AggregateRoot::from_snapshot(aggregate_id, snapshot, Arc::clone(&self.handlers))
            }
            Ok(None) => AggregateRoot::new(aggregate_id, Arc::clone(&self.handlers)),
            Err(error) => {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    aggregate_id = %aggregate_id,
                    error = %error,
                    "snapshot load failed; falling back to full replay"
                );
                AggregateRoot::new(aggregate_id, Arc::clone(&self.handlers))
            }
        };

        // (High cost) Events since the snapshot, upcasted by the bus.
        let events = self
            .event_bus
            .load_events(aggregate_id, root.version() + 1)
            .await?;
        root.replay(&events);
        Ok(root)
    }

    async fn commit(
        &self,
        root: &mut AggregateRoot<A>,
        expected_version: u64,
    ) -> Result<(), DispatchError> {
        if !root.changed_since(expected_version) {
            // Clean scope. Still worth caching for read-heavy types.
            if self.config.cache_strategy.should_cache() {
                self.config.cache.put(root.clone()).await;
            }
            return Ok(());
        }

        let events = root.take_uncommitted();
        match self
            .event_bus
            .publish(root.id(), expected_version, events)
            .await
        {
            Ok(_committed) => {}
            Err(error) => {
                // A losing writer's cache entry is stale by definition.
                if error.is_conflict() {
                    self.config.cache.remove(root.id()).await;
                }
                return Err(error);
            }
        }

        if self.config.snapshot_strategy.should_snapshot(
            root.version(),
            root.last_snapshot_time(),
            root.last_event_time(),
        ) {
            root.mark_snapshot();
            if let Err(error) = self
                .config
                .snapshot_store
                .save(root.id(), root.to_snapshot())
                .await
            {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    aggregate_id = %root.id(),
                    error = %error,
                    "snapshot save failed; continuing without"
                );
            }
        }

        if self.config.cache_strategy.should_cache() {
            self.config.cache.put(root.clone()).await;
        }
        Ok(())
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateRepository<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRepository")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("config", &self.config)
            .finish()
    }
}
