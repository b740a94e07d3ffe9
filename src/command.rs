//! Command trait and dispatch result types.

use std::fmt;

use uuid::Uuid;

/// An intent to change state, routed to exactly one aggregate.
///
/// Commands are plain structs; the bus derives everything else (command
/// id, execution context) at dispatch time. The aggregate id names the
/// target stream and must be non-nil.
///
/// # Examples
///
/// ```
/// use chronicle::Command;
/// use uuid::Uuid;
///
/// #[derive(Debug)]
/// struct Deposit {
///     account_id: Uuid,
///     amount: u64,
/// }
///
/// impl Command for Deposit {
///     type Response = u64;
///
///     fn aggregate_id(&self) -> Uuid {
///         self.account_id
///     }
///
///     fn validate(&self) -> Result<(), String> {
///         if self.amount == 0 {
///             return Err("amount must be positive".into());
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Command: Send + Sync + fmt::Debug + 'static {
    /// Value returned by the command's handler.
    type Response: Send + 'static;

    /// Id of the aggregate instance that should handle this command.
    fn aggregate_id(&self) -> Uuid;

    /// Structural validation, checked by the bus before any aggregate is
    /// loaded. Failures surface as `DispatchError::Validation`.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Key consulted by the idempotency middleware. Commands without one
    /// are never deduplicated.
    fn idempotency_key(&self) -> Option<String> {
        None
    }

    /// Correlation id to inherit, for callers continuing an existing
    /// logical operation. `None` marks an entry point.
    fn correlation_id(&self) -> Option<Uuid> {
        None
    }

    /// Id of what caused this command, if anything inside the system did.
    fn causation_id(&self) -> Option<Uuid> {
        None
    }
}

/// Result of dispatching a command.
///
/// `AlreadyProcessed` is the idempotency middleware's recorded-result
/// sentinel: the command's key was seen before, so the dispatch succeeded
/// without running the handler or emitting events again.
#[derive(Debug)]
pub enum CommandResult<R> {
    /// The handler ran and returned this response.
    Completed(R),
    /// Short-circuited by the idempotency middleware.
    AlreadyProcessed,
}

impl<R> CommandResult<R> {
    /// The handler response, if the command actually ran.
    pub fn response(self) -> Option<R> {
        match self {
            CommandResult::Completed(response) => Some(response),
            CommandResult::AlreadyProcessed => None,
        }
    }

    /// Whether the idempotency middleware short-circuited the dispatch.
    pub fn was_already_processed(&self) -> bool {
        matches!(self, CommandResult::AlreadyProcessed)
    }

    /// Unwrap the response, panicking on a replay. Test helper.
    pub fn expect_completed(self, msg: &str) -> R {
        match self {
            CommandResult::Completed(response) => response,
            CommandResult::AlreadyProcessed => panic!("{msg}"),
        }
    }
}
