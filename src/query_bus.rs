//! Query bus: the read-side twin of the command bus.
//!
//! Queries travel the same middleware chain as commands (middleware opt
//! in per kind via `applies_to`) but terminate in a projection instead
//! of an aggregate, and never produce events. Exactly one projection may
//! handle a given query type; the builder rejects duplicates.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BackendError, DispatchError};
use crate::middleware::{DispatchEnvelope, Middleware, Next, Outcome, TerminalHandler};
use crate::routing::BoxFuture;

/// An intent to read state, routed to exactly one projection.
///
/// Queries have no side effects by contract and are routed solely by
/// payload type.
pub trait Query: Send + Sync + fmt::Debug + 'static {
    /// Value returned by the query's handler.
    type Response: Send + 'static;

    /// Structural validation, checked by the bus before routing.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Correlation id to inherit, for callers continuing an existing
    /// logical operation.
    fn correlation_id(&self) -> Option<Uuid> {
        None
    }

    /// Id of what caused this query, if anything inside the system did.
    fn causation_id(&self) -> Option<Uuid> {
        None
    }
}

/// Type-erased executor binding one projection's query table.
pub(crate) trait QueryExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        envelope: &'a DispatchEnvelope,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>, DispatchError>>;
}

/// The terminal handler: route by query type to the owning projection.
pub(crate) struct DelegateToProjection {
    executors: HashMap<TypeId, Arc<dyn QueryExecutor>>,
}

impl DelegateToProjection {
    pub(crate) fn new(executors: HashMap<TypeId, Arc<dyn QueryExecutor>>) -> Self {
        Self { executors }
    }
}

#[async_trait]
impl TerminalHandler for DelegateToProjection {
    async fn handle(&self, envelope: DispatchEnvelope) -> Result<Outcome, DispatchError> {
        let executor = self
            .executors
            .get(&envelope.type_id())
            .ok_or(DispatchError::NoHandler {
                message_type: envelope.type_name(),
            })?;
        let response = executor.execute(&envelope).await?;
        Ok(Outcome::Completed(response))
    }
}

/// Routes queries through the middleware chain to projections.
pub struct QueryBus {
    middleware: Vec<Arc<dyn Middleware>>,
    delegate: DelegateToProjection,
}

impl QueryBus {
    pub(crate) fn new(
        middleware: Vec<Arc<dyn Middleware>>,
        executors: HashMap<TypeId, Arc<dyn QueryExecutor>>,
    ) -> Self {
        Self {
            middleware,
            delegate: DelegateToProjection::new(executors),
        }
    }

    /// Dispatch a query and wait for its typed response.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::Validation`] -- structural validation failed.
    /// * [`DispatchError::NoHandler`] -- no projection handles this type.
    /// * Whatever the projection's handler surfaces.
    pub async fn dispatch<Q: Query>(&self, query: Q) -> Result<Q::Response, DispatchError> {
        query.validate().map_err(DispatchError::Validation)?;

        let query_id = Uuid::new_v4();
        let envelope = DispatchEnvelope::for_query(query, query_id);
        let next = Next::new(&self.middleware, &self.delegate);
        match next.run(envelope).await? {
            Outcome::Completed(response) => Ok(*response
                .downcast::<Q::Response>()
                .expect("terminal handler returns the query's declared response type")),
            Outcome::AlreadyProcessed => Err(DispatchError::Backend(BackendError::permanent(
                "a middleware short-circuited a query as already processed",
            ))),
        }
    }
}

impl fmt::Debug for QueryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBus")
            .field("middleware", &self.middleware.len())
            .field("queries", &self.delegate.executors.len())
            .finish()
    }
}
