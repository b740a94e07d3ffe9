//! Projections: event-driven read models that also serve queries.
//!
//! A projection is an event processor plus a query table. The event path
//! updates internal read-model state; the query path answers typed
//! queries from it. Projections own their state representation -- bundled
//! fixtures use in-process maps behind locks, production projections
//! typically write through to a query database.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::event::Event;
use crate::middleware::DispatchEnvelope;
use crate::processor::{DynProcessor, EventProcessor, ProcessorRunner};
use crate::query_bus::{Query, QueryExecutor};
use crate::routing::{BoxFuture, HandlerMap};

/// A read model serving queries, fed by events.
pub trait Projection: EventProcessor {
    /// Register query handlers. Called once per registration.
    fn queries(handlers: &mut QueryHandlers<Self>)
    where
        Self: Sized;
}

type QueryHandlerFn<P> = Box<
    dyn for<'a> Fn(
            &'a P,
            &'a (dyn Any + Send + Sync),
        ) -> BoxFuture<'a, Result<Box<dyn Any + Send>, DispatchError>>
        + Send
        + Sync,
>;

/// Registration surface handed to [`Projection::queries`].
pub struct QueryHandlers<P> {
    handlers: HandlerMap<QueryHandlerFn<P>>,
}

impl<P: Projection> Default for QueryHandlers<P> {
    fn default() -> Self {
        Self {
            handlers: HandlerMap::new(),
        }
    }
}

impl<P: Projection> QueryHandlers<P> {
    /// Register a synchronous handler for query type `Q`.
    pub fn on<Q, F>(&mut self, handler: F)
    where
        Q: Query,
        F: Fn(&P, &Q) -> Result<Q::Response, DispatchError> + Send + Sync + 'static,
    {
        self.handlers.insert(
            TypeId::of::<Q>(),
            std::any::type_name::<Q>(),
            Box::new(move |projection, message| {
                let query = message
                    .downcast_ref::<Q>()
                    .expect("query router dispatches by exact TypeId");
                let result = handler(projection, query)
                    .map(|response| Box::new(response) as Box<dyn Any + Send>);
                Box::pin(async move { result })
            }),
        );
    }

    /// Register an asynchronous handler for query type `Q`.
    ///
    /// Implementations write `Box::pin(async move { ... })`.
    pub fn on_async<Q, F>(&mut self, handler: F)
    where
        Q: Query,
        F: for<'a> Fn(&'a P, &'a Q) -> BoxFuture<'a, Result<Q::Response, DispatchError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(
            TypeId::of::<Q>(),
            std::any::type_name::<Q>(),
            Box::new(move |projection, message| {
                let query = message
                    .downcast_ref::<Q>()
                    .expect("query router dispatches by exact TypeId");
                let future = handler(projection, query);
                Box::pin(async move {
                    future
                        .await
                        .map(|response| Box::new(response) as Box<dyn Any + Send>)
                })
            }),
        );
    }
}

impl<P> fmt::Debug for QueryHandlers<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandlers")
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// Binds a projection instance to its event and query tables.
pub struct ProjectionRunner<P: Projection> {
    events: ProcessorRunner<P>,
    queries: QueryHandlers<P>,
}

impl<P: Projection> ProjectionRunner<P> {
    /// Build both handler tables for `P` and bind them to an instance.
    pub fn new(projection: Arc<P>) -> Self {
        let mut queries = QueryHandlers::default();
        P::queries(&mut queries);
        Self {
            events: ProcessorRunner::new(projection),
            queries,
        }
    }

    /// The wrapped projection instance.
    pub fn processor(&self) -> &Arc<P> {
        self.events.processor()
    }

    /// Dispatch a typed query directly, bypassing the bus. Used by the
    /// projection scenario kit.
    pub async fn query<Q: Query>(&self, query: &Q) -> Result<Q::Response, DispatchError> {
        let handler =
            self.queries
                .handlers
                .resolve(TypeId::of::<Q>())
                .ok_or(DispatchError::NoHandler {
                    message_type: std::any::type_name::<Q>(),
                })?;
        let response = handler(self.events.processor().as_ref(), query).await?;
        Ok(*response
            .downcast::<Q::Response>()
            .expect("query handler returns the declared response type"))
    }

    /// `(TypeId, name)` of every registered query, for bus routing.
    pub(crate) fn query_types(&self) -> Vec<(TypeId, &'static str)> {
        self.queries.handlers.registered().collect()
    }

    pub(crate) fn duplicate_names(&self) -> Vec<String> {
        let mut duplicates = self.events.duplicate_names();
        duplicates.extend_from_slice(self.queries.handlers.duplicates());
        duplicates
    }
}

impl<P: Projection> fmt::Debug for ProjectionRunner<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionRunner")
            .field("processor_id", &P::PROCESSOR_ID)
            .field("queries", &self.queries)
            .finish()
    }
}

#[async_trait]
impl<P: Projection> DynProcessor for ProjectionRunner<P> {
    fn processor_id(&self) -> &'static str {
        P::PROCESSOR_ID
    }

    async fn handle(&self, event: &Event) -> Result<(), crate::error::ProcessorError> {
        self.events.handle(event).await
    }
}

impl<P: Projection> QueryExecutor for ProjectionRunner<P> {
    fn execute<'a>(
        &'a self,
        envelope: &'a DispatchEnvelope,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>, DispatchError>> {
        Box::pin(async move {
            let handler = self
                .queries
                .handlers
                .resolve(envelope.type_id())
                .ok_or(DispatchError::NoHandler {
                    message_type: envelope.type_name(),
                })?;
            handler(self.events.processor().as_ref(), envelope.message()).await
        })
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::event::test_fixtures::{MoneyDeposited, MoneyWithdrawn};
    use crate::processor::EventHandlers;
    use std::collections::HashMap;
    use std::sync::RwLock;
    use uuid::Uuid;

    /// Read model fixture: per-account balances with two queries.
    #[derive(Debug, Default)]
    pub(crate) struct AccountBalances {
        balances: RwLock<HashMap<Uuid, u64>>,
    }

    impl AccountBalances {
        pub(crate) fn balance_of(&self, account_id: Uuid) -> Option<u64> {
            self.balances
                .read()
                .expect("balances lock poisoned")
                .get(&account_id)
                .copied()
        }

        pub(crate) fn accounts(&self) -> Vec<Uuid> {
            self.balances
                .read()
                .expect("balances lock poisoned")
                .keys()
                .copied()
                .collect()
        }
    }

    #[derive(Debug)]
    pub(crate) struct GetBalance {
        pub account_id: Uuid,
    }

    impl Query for GetBalance {
        type Response = Option<u64>;
    }

    #[derive(Debug)]
    pub(crate) struct GetTotalHoldings;

    impl Query for GetTotalHoldings {
        type Response = u64;
    }

    impl EventProcessor for AccountBalances {
        const PROCESSOR_ID: &'static str = "account-balances";

        fn configure(handlers: &mut EventHandlers<Self>) {
            handlers.on_envelope(
                |projection: &AccountBalances, event: &Event, payload: &MoneyDeposited| {
                    let mut balances =
                        projection.balances.write().expect("balances lock poisoned");
                    *balances.entry(event.aggregate_id).or_insert(0) += payload.amount;
                    Ok(())
                },
            );
            handlers.on_envelope(
                |projection: &AccountBalances, event: &Event, payload: &MoneyWithdrawn| {
                    let mut balances =
                        projection.balances.write().expect("balances lock poisoned");
                    *balances.entry(event.aggregate_id).or_insert(0) -= payload.amount;
                    Ok(())
                },
            );
        }
    }

    impl Projection for AccountBalances {
        fn queries(handlers: &mut QueryHandlers<Self>) {
            handlers.on(|projection: &AccountBalances, query: &GetBalance| {
                Ok(projection.balance_of(query.account_id))
            });
            handlers.on(|projection: &AccountBalances, _query: &GetTotalHoldings| {
                let balances = projection.balances.read().expect("balances lock poisoned");
                Ok(balances.values().sum())
            });
        }
    }
}
