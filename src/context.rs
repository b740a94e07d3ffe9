//! Execution context: per-operation carrier for correlation and causation.
//!
//! The context is an explicit value, not an ambient global. The bus builds
//! one when a command or query enters, middleware enriches it, the
//! repository installs it on the aggregate root for the duration of a
//! command, and processors derive a child context from each event they
//! handle. Spawned tasks receive the context by copy.

use uuid::Uuid;

/// Immutable context describing what caused the current operation.
///
/// - `correlation_id` traces an entire logical operation across commands,
///   events, and sagas. It is assigned once at the entry point and never
///   changes along the flow.
/// - `causation_id` names the direct predecessor: for an event it is the
///   command that produced it, for a saga-dispatched command it is the
///   event that triggered the step.
/// - `command_id` identifies the command currently executing; events
///   emitted while it is set record it as their causation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Id tracing the entire logical operation.
    pub correlation_id: Option<Uuid>,
    /// Id of what directly caused this operation.
    pub causation_id: Option<Uuid>,
    /// Id of the command currently being executed, if any.
    pub command_id: Option<Uuid>,
}

impl ExecutionContext {
    /// Create a context at a system entry point.
    ///
    /// Generates a correlation id when none is supplied. At an entry point
    /// the causation id is self-referencing (it equals the correlation id):
    /// nothing inside the system caused the operation.
    pub fn create(correlation_id: Option<Uuid>) -> Self {
        let correlation_id = correlation_id.unwrap_or_else(Uuid::new_v4);
        Self {
            correlation_id: Some(correlation_id),
            causation_id: Some(correlation_id),
            command_id: None,
        }
    }

    /// Derive the context for executing a command.
    ///
    /// The correlation id is inherited; the command id is recorded so that
    /// events emitted during handling name it as their causation.
    pub fn for_command(self, command_id: Uuid) -> Self {
        Self {
            command_id: Some(command_id),
            ..self
        }
    }

    /// Derive the context for processing an event.
    ///
    /// The correlation id is inherited, the causation id becomes the event
    /// id, and the command id is cleared: commands dispatched from an event
    /// handler (saga compensation, for example) are caused by the event.
    pub fn for_event(self, event_id: Uuid) -> Self {
        Self {
            correlation_id: self.correlation_id,
            causation_id: Some(event_id),
            command_id: None,
        }
    }

    /// Replace the causation id.
    pub fn with_causation(self, causation_id: Uuid) -> Self {
        Self {
            causation_id: Some(causation_id),
            ..self
        }
    }

    /// Whether every field is unset.
    ///
    /// The aggregate root must be back in this state after each command;
    /// the scenario kits assert it.
    pub fn is_cleared(&self) -> bool {
        self.correlation_id.is_none() && self.causation_id.is_none() && self.command_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_generates_correlation_id() {
        let ctx = ExecutionContext::create(None);
        assert!(ctx.correlation_id.is_some());
        // Entry points are self-referencing.
        assert_eq!(ctx.causation_id, ctx.correlation_id);
        assert_eq!(ctx.command_id, None);
    }

    #[test]
    fn create_keeps_supplied_correlation_id() {
        let id = Uuid::new_v4();
        let ctx = ExecutionContext::create(Some(id));
        assert_eq!(ctx.correlation_id, Some(id));
        assert_eq!(ctx.causation_id, Some(id));
    }

    #[test]
    fn for_command_sets_command_id_only() {
        let base = ExecutionContext::create(None);
        let cmd_id = Uuid::new_v4();
        let ctx = base.for_command(cmd_id);
        assert_eq!(ctx.correlation_id, base.correlation_id);
        assert_eq!(ctx.causation_id, base.causation_id);
        assert_eq!(ctx.command_id, Some(cmd_id));
    }

    #[test]
    fn for_event_rewrites_causation_and_clears_command() {
        let base = ExecutionContext::create(None).for_command(Uuid::new_v4());
        let event_id = Uuid::new_v4();
        let ctx = base.for_event(event_id);
        assert_eq!(ctx.correlation_id, base.correlation_id);
        assert_eq!(ctx.causation_id, Some(event_id));
        assert_eq!(ctx.command_id, None);
    }

    #[test]
    fn with_causation_replaces_only_causation() {
        let base = ExecutionContext::create(None);
        let id = Uuid::new_v4();
        let ctx = base.with_causation(id);
        assert_eq!(ctx.causation_id, Some(id));
        assert_eq!(ctx.correlation_id, base.correlation_id);
    }

    #[test]
    fn default_is_cleared() {
        assert!(ExecutionContext::default().is_cleared());
        assert!(!ExecutionContext::create(None).is_cleared());
    }
}
