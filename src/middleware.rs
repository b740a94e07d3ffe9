//! Middleware chain for the command and query buses.
//!
//! Middleware wrap the terminal handler in registration order: the first
//! registered is the outermost. The chain is an explicit iterative
//! runner ([`Next`] walks a slice), not nested closures. Each middleware
//! either calls `next.run(envelope)` exactly once and returns its result
//! (possibly transformed), or short-circuits without calling it -- the
//! idempotency replay is the only built-in that does.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::Instrument;
use uuid::Uuid;

use crate::command::Command;
use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::idempotency::IdempotencyStore;
use crate::query_bus::Query;
use crate::routing::BoxFuture;

/// Which bus an envelope is travelling through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Write side: routed to an aggregate, may emit events.
    Command,
    /// Read side: routed to a projection, never emits events.
    Query,
}

/// Type-erased message travelling the middleware chain.
///
/// Carries the message behind an `Arc` (so retrying middleware can
/// re-dispatch), its routing metadata, and the execution context that
/// middleware enrich on the way in.
#[derive(Clone)]
pub struct DispatchEnvelope {
    kind: MessageKind,
    message: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
    message_id: Uuid,
    aggregate_id: Option<Uuid>,
    idempotency_key: Option<String>,
    context: ExecutionContext,
}

impl DispatchEnvelope {
    /// Wrap a command, assigning it the given command id.
    pub(crate) fn for_command<C: Command>(command: C, command_id: Uuid) -> Self {
        let context = ExecutionContext {
            correlation_id: command.correlation_id(),
            causation_id: command.causation_id(),
            command_id: Some(command_id),
        };
        Self {
            kind: MessageKind::Command,
            type_id: TypeId::of::<C>(),
            type_name: std::any::type_name::<C>(),
            message_id: command_id,
            aggregate_id: Some(command.aggregate_id()),
            idempotency_key: command.idempotency_key(),
            context,
            message: Arc::new(command),
        }
    }

    /// Wrap a query, assigning it the given query id.
    pub(crate) fn for_query<Q: Query>(query: Q, query_id: Uuid) -> Self {
        let context = ExecutionContext {
            correlation_id: query.correlation_id(),
            causation_id: query.causation_id(),
            command_id: None,
        };
        Self {
            kind: MessageKind::Query,
            type_id: TypeId::of::<Q>(),
            type_name: std::any::type_name::<Q>(),
            message_id: query_id,
            aggregate_id: None,
            idempotency_key: None,
            context,
            message: Arc::new(query),
        }
    }

    /// Command or query.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Whether this is a command envelope.
    pub fn is_command(&self) -> bool {
        self.kind == MessageKind::Command
    }

    /// `TypeId` of the wrapped message.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Type name of the wrapped message, for routing errors and logs.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The command id or query id assigned at dispatch.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Target stream for commands, `None` for queries.
    pub fn aggregate_id(&self) -> Option<Uuid> {
        self.aggregate_id
    }

    /// The command's idempotency key, if it declared one.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// The execution context travelling with the message.
    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Replace the execution context (context-propagation middleware).
    pub fn set_context(&mut self, context: ExecutionContext) {
        self.context = context;
    }

    /// Borrow the wrapped message as a concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.message.downcast_ref::<T>()
    }

    /// The wrapped message, type-erased, for terminal handlers.
    pub(crate) fn message(&self) -> &(dyn Any + Send + Sync) {
        self.message.as_ref()
    }
}

impl fmt::Debug for DispatchEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEnvelope")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("message_id", &self.message_id)
            .finish()
    }
}

/// Result of a dispatch travelling back up the chain.
pub enum Outcome {
    /// The terminal handler ran; the boxed value is the typed response.
    Completed(Box<dyn Any + Send>),
    /// The idempotency middleware short-circuited a replayed command.
    AlreadyProcessed,
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed(_) => f.write_str("Completed"),
            Outcome::AlreadyProcessed => f.write_str("AlreadyProcessed"),
        }
    }
}

/// The handler at the end of the chain (aggregate or projection
/// delegate).
#[async_trait]
pub(crate) trait TerminalHandler: Send + Sync {
    async fn handle(&self, envelope: DispatchEnvelope) -> Result<Outcome, DispatchError>;
}

/// The rest of the chain from a middleware's point of view.
///
/// `run` consumes the envelope and walks the remaining middleware (in
/// order, honoring [`Middleware::applies_to`]) down to the terminal
/// handler. `Next` is `Copy`, so retrying middleware can run it again
/// with a cloned envelope.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn TerminalHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        middleware: &'a [Arc<dyn Middleware>],
        terminal: &'a dyn TerminalHandler,
    ) -> Self {
        Self {
            middleware,
            terminal,
        }
    }

    /// Invoke the remainder of the chain.
    pub fn run(self, envelope: DispatchEnvelope) -> BoxFuture<'a, Result<Outcome, DispatchError>> {
        Box::pin(async move {
            let mut remaining = self.middleware;
            while let Some((middleware, rest)) = remaining.split_first() {
                if middleware.applies_to(&envelope) {
                    let next = Next {
                        middleware: rest,
                        terminal: self.terminal,
                    };
                    return middleware.intercept(envelope, next).await;
                }
                remaining = rest;
            }
            self.terminal.handle(envelope).await
        })
    }
}

/// An interceptor wrapping command and query dispatch.
///
/// `applies_to` is the type filter: returning `false` forwards the
/// envelope without invoking `intercept` (the built-in idempotency
/// middleware uses it to see only keyed commands). Middleware may
/// translate errors but must not silently drop them.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Whether this middleware wants to see the envelope.
    fn applies_to(&self, _envelope: &DispatchEnvelope) -> bool {
        true
    }

    /// Process the envelope, calling `next.run` at most once.
    async fn intercept(
        &self,
        envelope: DispatchEnvelope,
        next: Next<'_>,
    ) -> Result<Outcome, DispatchError>;
}

/// Stamps missing correlation and causation ids.
///
/// At an entry point (no correlation id on the message) a fresh
/// correlation id is generated and the causation id self-references it.
/// Register this first so everything downstream observes a complete
/// context. The context lives on the envelope, so it is discarded with
/// the dispatch on every exit path, exceptional ones included.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextPropagationMiddleware;

impl ContextPropagationMiddleware {
    /// Create the middleware.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for ContextPropagationMiddleware {
    async fn intercept(
        &self,
        mut envelope: DispatchEnvelope,
        next: Next<'_>,
    ) -> Result<Outcome, DispatchError> {
        let ctx = envelope.context();
        let correlation_id = ctx.correlation_id.unwrap_or_else(Uuid::new_v4);
        let causation_id = ctx.causation_id.unwrap_or(correlation_id);
        envelope.set_context(ExecutionContext {
            correlation_id: Some(correlation_id),
            causation_id: Some(causation_id),
            command_id: ctx.command_id,
        });
        next.run(envelope).await
    }
}

/// Structured entry/exit logging with elapsed time and outcome.
///
/// Message payloads are not logged, only type names and tracing ids.
/// Errors are logged and re-surfaced, never swallowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    /// Create the middleware.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn intercept(
        &self,
        envelope: DispatchEnvelope,
        next: Next<'_>,
    ) -> Result<Outcome, DispatchError> {
        let kind = envelope.kind();
        let type_name = envelope.type_name();
        let ctx = envelope.context();
        let span = tracing::info_span!(
            "dispatch",
            message_type = type_name,
            kind = ?kind,
            correlation_id = ?ctx.correlation_id,
            causation_id = ?ctx.causation_id,
        );

        let started = Instant::now();
        tracing::info!(parent: &span, "dispatch started");
        let result = next.run(envelope).instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(outcome) => {
                tracing::info!(parent: &span, elapsed_ms, outcome = ?outcome, "dispatch finished");
            }
            Err(error) => {
                tracing::error!(parent: &span, elapsed_ms, error = %error, "dispatch failed");
            }
        }
        result
    }
}

/// Deduplicates commands carrying an idempotency key.
///
/// A key seen before short-circuits with
/// [`Outcome::AlreadyProcessed`] -- the documented silent path. The key
/// is recorded only *after* the terminal handler succeeds, so failures
/// leave no trace and retries remain possible.
pub struct IdempotencyMiddleware {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyMiddleware {
    /// Create the middleware over a key store.
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }
}

impl fmt::Debug for IdempotencyMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdempotencyMiddleware")
    }
}

#[async_trait]
impl Middleware for IdempotencyMiddleware {
    fn applies_to(&self, envelope: &DispatchEnvelope) -> bool {
        envelope.is_command() && envelope.idempotency_key().is_some()
    }

    async fn intercept(
        &self,
        envelope: DispatchEnvelope,
        next: Next<'_>,
    ) -> Result<Outcome, DispatchError> {
        let key = envelope
            .idempotency_key()
            .expect("applies_to admits only keyed commands")
            .to_owned();

        if self.store.has(&key).await? {
            tracing::warn!(
                idempotency_key = %key,
                command_type = envelope.type_name(),
                "skipping previously processed command"
            );
            return Ok(Outcome::AlreadyProcessed);
        }

        let command_type = envelope.type_name();
        let outcome = next.run(envelope).await?;
        if matches!(outcome, Outcome::Completed(_)) {
            self.store.store(&key, command_type).await?;
        }
        Ok(outcome)
    }
}

/// Retries commands that lost an optimistic concurrency race.
///
/// Retry-by-reload: each attempt re-runs the whole inner chain, so the
/// aggregate is loaded fresh at the new version and the handler decides
/// again. After `max_attempts` total attempts the last conflict
/// surfaces.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyRetryMiddleware {
    max_attempts: u32,
    retry_delay: Duration,
}

impl ConcurrencyRetryMiddleware {
    /// Create the middleware. `max_attempts` counts total attempts, so
    /// it must be at least 1.
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }
}

#[async_trait]
impl Middleware for ConcurrencyRetryMiddleware {
    fn applies_to(&self, envelope: &DispatchEnvelope) -> bool {
        envelope.is_command()
    }

    async fn intercept(
        &self,
        envelope: DispatchEnvelope,
        next: Next<'_>,
    ) -> Result<Outcome, DispatchError> {
        let mut attempt = 1u32;
        loop {
            match next.run(envelope.clone()).await {
                Err(error) if error.is_conflict() && attempt < self.max_attempts => {
                    tracing::warn!(
                        command_type = envelope.type_name(),
                        attempt,
                        error = %error,
                        "concurrency conflict, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
