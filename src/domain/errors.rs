//! Domain errors for the conductor orchestration engine.
//!
//! One taxonomy covers task routing, quota accounting, workflow
//! compilation, and invariant violations. Retry behaviour is derived
//! from the error kind, never from string matching.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No registered provider declares the task's kind and flags.
    #[error("no provider capable of serving task kind '{kind}'")]
    CapabilityMismatch { kind: String },

    /// Providers exist but none passed health/quota filters right now.
    #[error("no provider available for task {task_id}")]
    NoProviderAvailable { task_id: Uuid },

    /// Quota reservation failed; carries the earliest window reset.
    #[error("quota exhausted for provider '{provider_id}'")]
    QuotaExhausted {
        provider_id: String,
        reset_at: chrono::DateTime<chrono::Utc>,
    },

    /// Transport-level provider failure (connection, 5xx-equivalent).
    #[error("provider transport error: {0}")]
    ProviderTransport(String),

    /// Semantic rejection by the provider; not retryable.
    #[error("provider rejected task: {0}")]
    ProviderReject(String),

    /// Provider invocation exceeded its deadline.
    #[error("provider invocation timed out after {0} ms")]
    Timeout(u64),

    /// Task or run was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Workflow edges form a cycle.
    #[error("workflow contains a dependency cycle involving stages: {stages:?}")]
    CyclicDependency { stages: Vec<String> },

    /// An edge or condition references a stage that is not declared
    /// (or is not upstream of the referencing stage).
    #[error("unknown stage reference '{stage}'")]
    UnknownStageRef { stage: String },

    /// A condition expression failed to parse or evaluate.
    #[error("invalid condition '{expression}': {reason}")]
    BadCondition { expression: String, reason: String },

    /// Task with the given ID was not found.
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Workflow with the given ID was not found.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Workflow run with the given ID was not found.
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// Duplicate registration (provider id, schedule, ...).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Submission used a task kind that was never registered.
    #[error("unknown task kind '{0}'; kinds must be registered at startup")]
    UnknownTaskKind(String),

    /// Illegal status transition attempted on a task or run.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Optimistic version check failed on a store update.
    #[error("concurrent modification of {entity} {id}")]
    ConcurrencyConflict { entity: &'static str, id: String },

    /// Invariant violation inside the engine; the task is dead-lettered.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Whether the task processor may retry after this error.
    ///
    /// Transient kinds are absorbed by the processor and surface only
    /// through attempt counters; everything else is terminal for the
    /// task.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoProviderAvailable { .. }
                | Self::QuotaExhausted { .. }
                | Self::ProviderTransport(_)
                | Self::Timeout(_)
                | Self::ConcurrencyConflict { .. }
        )
    }

    /// Whether this error terminates the task outright.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Internal(format!("serialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_timeout_are_retryable() {
        assert!(OrchestratorError::ProviderTransport("reset".into()).is_retryable());
        assert!(OrchestratorError::Timeout(120_000).is_retryable());
        assert!(OrchestratorError::QuotaExhausted {
            provider_id: "p1".into(),
            reset_at: chrono::Utc::now(),
        }
        .is_retryable());
    }

    #[test]
    fn rejects_and_cancellation_are_terminal() {
        assert!(OrchestratorError::ProviderReject("bad payload".into()).is_terminal());
        assert!(OrchestratorError::Cancelled.is_terminal());
        assert!(OrchestratorError::CapabilityMismatch { kind: "x".into() }.is_terminal());
    }

    #[test]
    fn display_includes_identifiers() {
        let id = Uuid::new_v4();
        let err = OrchestratorError::TaskNotFound(id);
        assert_eq!(err.to_string(), format!("task not found: {id}"));

        let err = OrchestratorError::CyclicDependency {
            stages: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("a"));
        assert!(err.to_string().contains("b"));
    }
}
