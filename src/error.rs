//! Crate-level error types for the command, query, and event pipelines.
//!
//! The taxonomy distinguishes caller mistakes (`Validation`, `NoHandler`),
//! business rejections (`Domain`), storage races (`Conflict`), backend
//! failures (transient vs. permanent), and schema-evolution failures
//! (`Upcast`). Buses never swallow errors: everything surfaces through
//! [`DispatchError`] except the documented idempotency short-circuit.

use std::error::Error as StdError;

/// A business-rule rejection raised by an aggregate command handler.
///
/// Domain errors discard the aggregate uncommitted: the repository never
/// appends events for a command whose handler returned one.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DomainError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl DomainError {
    /// Create a domain error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a domain error wrapping an underlying error value.
    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The rejection message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure reported by a pluggable backend (snapshot store, idempotency
/// store, saga state store, checkpoint store, transport).
///
/// Backends classify their own failures: transient errors are worth
/// retrying at the processor level, permanent ones are not.
#[derive(Debug, thiserror::Error)]
#[error("backend failure: {message}")]
pub struct BackendError {
    message: String,
    transient: bool,
}

impl BackendError {
    /// A transient failure (network hiccup, timeout): retryable.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// A permanent failure (corruption, schema mismatch): not retryable.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether retrying the operation could succeed.
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::permanent(format!("serialization failed: {e}"))
    }
}

/// Errors from the [`EventStore`](crate::store::EventStore) interface.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed: the stream grew between load
    /// and append.
    #[error(
        "concurrency conflict on stream {stream_id}: expected version \
         {expected}, stream is at {actual}"
    )]
    Conflict {
        /// The stream whose version check failed.
        stream_id: uuid::Uuid,
        /// The version the writer expected the stream to be at.
        expected: u64,
        /// The version the stream was actually at.
        actual: u64,
    },

    /// A persisted payload type tag has no registered decoder.
    ///
    /// Fatal for the affected stream: the payload registry must know every
    /// tag that can appear in storage.
    #[error("no payload registered for type tag {0:?}")]
    UnknownPayloadType(String),

    /// Payload (de)serialization failed.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The store does not implement `rewrite`.
    #[error("event store does not support rewriting streams")]
    RewriteUnsupported,

    /// The store's contents violate an invariant (gap in sequence numbers,
    /// id mismatch on rewrite). Permanent.
    #[error("event store corruption: {0}")]
    Corrupt(String),

    /// Underlying backend I/O failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors from the upcasting pipeline.
#[derive(Debug, thiserror::Error)]
pub enum UpcastError {
    /// An upcaster failed to transform a payload it matched.
    #[error("upcasting {tag:?} failed: {message}")]
    Failed {
        /// Type tag of the payload being transformed.
        tag: String,
        /// What went wrong.
        message: String,
    },

    /// The chain walk exceeded its step cap, which indicates a cycle that
    /// slipped past build-time validation (e.g. a `can_upcast` oscillation).
    #[error("upcasting chain for {tag:?} exceeded {max_steps} steps")]
    ChainTooDeep {
        /// Type tag the walk started from.
        tag: String,
        /// The configured step cap.
        max_steps: usize,
    },
}

/// Errors from event processors, sagas, and their executor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Worth retrying: the failure was environmental, not logical.
    #[error("transient processor failure: {0}")]
    Transient(String),

    /// Not worth retrying: the event cannot be processed.
    #[error("permanent processor failure: {0}")]
    Permanent(String),
}

impl ProcessorError {
    /// Whether the executor should spend retry budget on this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessorError::Transient(_))
    }
}

impl From<BackendError> for ProcessorError {
    fn from(e: BackendError) -> Self {
        if e.is_transient() {
            ProcessorError::Transient(e.to_string())
        } else {
            ProcessorError::Permanent(e.to_string())
        }
    }
}

/// Error surfaced by the command and query buses.
///
/// Middleware may translate variants but must not drop them; the only
/// silent path is the idempotency short-circuit, which is not an error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The message failed structural validation before any handler ran.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No handler is registered for this message type.
    #[error("no handler registered for {message_type}")]
    NoHandler {
        /// Type name of the unroutable message.
        message_type: &'static str,
    },

    /// The aggregate rejected the command.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Event store failure, including concurrency conflicts.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A pluggable backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Schema evolution failed while loading or saving events.
    #[error(transparent)]
    Upcast(#[from] UpcastError),

    /// A synchronously-delivered subscriber failed, failing the command.
    #[error("event subscriber failed: {0}")]
    Subscriber(#[from] ProcessorError),
}

impl DispatchError {
    /// Whether this error is an optimistic concurrency conflict, the one
    /// class [`ConcurrencyRetryMiddleware`](crate::middleware::ConcurrencyRetryMiddleware)
    /// retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DispatchError::Store(StoreError::Conflict { .. }))
    }
}

/// Configuration errors detected by [`ApplicationBuilder::build`](crate::application::ApplicationBuilder::build).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Two aggregates (or one aggregate twice) registered a handler for the
    /// same command type.
    #[error("command {command} is handled by more than one registration")]
    DuplicateCommandHandler {
        /// Type name of the doubly-handled command.
        command: &'static str,
    },

    /// Two projections registered a handler for the same query type.
    #[error("query {query} is handled by more than one projection")]
    DuplicateQueryHandler {
        /// Type name of the doubly-handled query.
        query: &'static str,
    },

    /// A single registry received two handlers for one message type.
    #[error("duplicate handler for {message_type} in {registry}")]
    DuplicateHandler {
        /// Which registry detected the duplicate.
        registry: &'static str,
        /// Type name or tag of the doubly-registered message.
        message_type: String,
    },

    /// The registered upcasters form a cycle.
    #[error("upcaster cycle detected through type tag {tag:?}")]
    UpcasterCycle {
        /// A tag on the cycle.
        tag: String,
    },

    /// Two processors registered under the same processor id.
    #[error("processor id {id:?} registered more than once")]
    DuplicateProcessor {
        /// The contested processor id.
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_error_displays_message() {
        let err = DomainError::new("insufficient funds");
        assert_eq!(err.to_string(), "insufficient funds");
    }

    #[test]
    fn domain_error_preserves_source() {
        let io = std::io::Error::other("boom");
        let err = DomainError::with_source("ledger unavailable", io);
        assert!(err.source().is_some());
    }

    #[test]
    fn conflict_is_detected_through_dispatch_error() {
        let err = DispatchError::Store(StoreError::Conflict {
            stream_id: uuid::Uuid::nil(),
            expected: 2,
            actual: 3,
        });
        assert!(err.is_conflict());
        assert!(!DispatchError::Validation("nope".into()).is_conflict());
    }

    #[test]
    fn backend_error_classification() {
        assert!(BackendError::transient("timeout").is_transient());
        assert!(!BackendError::permanent("corrupt").is_transient());
    }

    #[test]
    fn backend_error_maps_to_processor_error() {
        let t: ProcessorError = BackendError::transient("net").into();
        assert!(t.is_transient());
        let p: ProcessorError = BackendError::permanent("schema").into();
        assert!(!p.is_transient());
    }

    #[test]
    fn store_error_display_includes_versions() {
        let err = StoreError::Conflict {
            stream_id: uuid::Uuid::nil(),
            expected: 5,
            actual: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version 5"), "got: {msg}");
        assert!(msg.contains("stream is at 7"), "got: {msg}");
    }

    // Verify `Send + Sync` bounds so errors can cross task boundaries.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<DispatchError>();
            assert_send_sync::<StoreError>();
            assert_send_sync::<ProcessorError>();
            assert_send_sync::<BuildError>();
        }
    };
}
