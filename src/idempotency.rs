//! Idempotency key tracking for command deduplication.
//!
//! The middleware records a key only after the terminal handler succeeds,
//! so a partial failure never leaves a key behind and retries stay
//! possible. `has` answers true only for keys that completed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::BackendError;

/// Storage backend for processed idempotency keys.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether `key` was recorded by a successfully completed command.
    async fn has(&self, key: &str) -> Result<bool, BackendError>;

    /// Record `key` after the command it belongs to committed.
    /// `command_type` is kept for diagnostics.
    async fn store(&self, key: &str, command_type: &str) -> Result<(), BackendError>;
}

/// The default backend: remembers nothing, so every command runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullIdempotencyStore;

#[async_trait]
impl IdempotencyStore for NullIdempotencyStore {
    async fn has(&self, _key: &str) -> Result<bool, BackendError> {
        Ok(false)
    }

    async fn store(&self, _key: &str, _command_type: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

struct ProcessedKey {
    command_type: String,
    recorded_at: Instant,
}

/// In-memory key store with an optional time-to-live.
///
/// With a TTL, keys older than the window read as unseen again; without
/// one, keys live for the process lifetime.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    keys: Mutex<HashMap<String, ProcessedKey>>,
    ttl: Option<Duration>,
}

impl InMemoryIdempotencyStore {
    /// Create a store whose keys never expire.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose keys expire after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    /// The command type recorded for a key, for diagnostics.
    pub fn command_type_of(&self, key: &str) -> Option<String> {
        let keys = self.keys.lock().expect("idempotency lock poisoned");
        keys.get(key).map(|entry| entry.command_type.clone())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn has(&self, key: &str) -> Result<bool, BackendError> {
        let mut keys = self.keys.lock().expect("idempotency lock poisoned");
        let Some(entry) = keys.get(key) else {
            return Ok(false);
        };
        if let Some(ttl) = self.ttl {
            if entry.recorded_at.elapsed() > ttl {
                keys.remove(key);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn store(&self, key: &str, command_type: &str) -> Result<(), BackendError> {
        let mut keys = self.keys.lock().expect("idempotency lock poisoned");
        keys.insert(
            key.to_owned(),
            ProcessedKey {
                command_type: command_type.to_owned(),
                recorded_at: Instant::now(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_store_never_remembers() {
        let store = NullIdempotencyStore;
        store.store("k", "Deposit").await.unwrap();
        assert!(!store.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn stored_key_reads_back() {
        let store = InMemoryIdempotencyStore::new();
        assert!(!store.has("k").await.unwrap());

        store.store("k", "Deposit").await.unwrap();
        assert!(store.has("k").await.unwrap());
        assert_eq!(store.command_type_of("k").as_deref(), Some("Deposit"));
    }

    #[tokio::test]
    async fn ttl_expires_keys() {
        let store = InMemoryIdempotencyStore::with_ttl(Duration::from_millis(20));
        store.store("k", "Deposit").await.unwrap();
        assert!(store.has("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.has("k").await.unwrap());
    }
}
