//! Task domain model.
//!
//! A task is a single unit of work dispatched to exactly one provider.
//! Tasks created by a workflow run carry their parent run and stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::provider::{CapabilityFlags, ProviderId};

/// A task kind, e.g. `code-review` or `bug-fix`.
///
/// Kinds form a closed set: they are registered at startup via
/// [`TaskKindRegistry`] and unknown kinds are rejected at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(pub String);

impl TaskKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-kind options fixed at registration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskKindOptions {
    /// Opt this kind out of dedup/result caching. Kinds whose results
    /// must always be recomputed (non-idempotent side effects,
    /// freshness-sensitive analysis) set this.
    pub no_dedup: bool,
}

/// The closed set of task kinds accepted at submission.
///
/// Built once at startup; the registry itself is immutable afterwards,
/// which is what makes kind checking a pure lookup.
#[derive(Debug, Clone, Default)]
pub struct TaskKindRegistry {
    kinds: std::collections::HashMap<TaskKind, TaskKindOptions>,
}

impl TaskKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind with default options. Last registration wins.
    pub fn register(&mut self, kind: impl Into<TaskKind>) -> &mut Self {
        self.kinds.insert(kind.into(), TaskKindOptions::default());
        self
    }

    /// Register a kind with explicit options.
    pub fn register_with(&mut self, kind: impl Into<TaskKind>, options: TaskKindOptions) -> &mut Self {
        self.kinds.insert(kind.into(), options);
        self
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn options(&self, kind: &TaskKind) -> Option<TaskKindOptions> {
        self.kinds.get(kind).copied()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Status of a task in the dispatch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted but not yet enqueued
    Pending,
    /// Waiting in the dispatch queue
    Queued,
    /// A worker is executing it on a provider
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with a non-retryable error
    Failed,
    /// Cancelled by the caller or a cancelled workflow run
    Cancelled,
    /// Retries exhausted or invariant violation
    DeadLettered,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::DeadLettered => "dead_lettered",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "dead_lettered" | "deadlettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Terminal states are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Cancelled | Self::DeadLettered)
    }

    /// Valid transitions from this status.
    ///
    /// Status advances monotonically except the two requeue edges:
    /// Running→Queued (reschedule after a transient error) and
    /// Failed→Queued (explicit retry of a failed task).
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Queued, Self::Cancelled],
            Self::Queued => &[Self::Running, Self::Cancelled],
            Self::Running => &[
                Self::Succeeded,
                Self::Failed,
                Self::Cancelled,
                Self::Queued,
                Self::DeadLettered,
            ],
            Self::Failed => &[Self::Queued],
            Self::Succeeded | Self::Cancelled | Self::DeadLettered => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Opaque task payload: raw bytes plus structured metadata.
///
/// The metadata participates in fingerprinting (canonicalized); the
/// raw bytes are passed to the provider untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Raw payload bytes, provider-interpreted.
    #[serde(default, with = "payload_bytes")]
    pub data: Vec<u8>,
    /// Structured metadata (prompt parameters, file lists, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

mod payload_bytes {
    //! Serialize payload bytes as an array of numbers; keeps the model
    //! format-agnostic without pulling in a base64 dependency.
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

impl TaskPayload {
    pub fn from_metadata(metadata: serde_json::Value) -> Self {
        Self {
            data: Vec::new(),
            metadata,
        }
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// A single unit of work routed to one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// What kind of work this is (must be registered)
    pub kind: TaskKind,
    /// Opaque payload
    pub payload: TaskPayload,
    /// Priority; higher dispatches first
    pub priority: i32,
    /// Opaque owner identifier
    pub owner_id: String,
    /// Capability flags this task requires beyond its kind
    pub required_flags: CapabilityFlags,
    /// Current status
    pub status: TaskStatus,
    /// Number of provider invocations so far
    pub attempts: u32,
    /// Last error message, if any
    pub last_error: Option<String>,
    /// Provider executing (or having executed) this task.
    /// Set iff status is Running, Succeeded or Failed.
    pub assigned_provider_id: Option<ProviderId>,
    /// Providers excluded from selection after failing this task
    #[serde(default)]
    pub excluded_providers: HashSet<ProviderId>,
    /// Parent workflow run, when spawned by the DAG engine
    pub parent_run_id: Option<Uuid>,
    /// Stage within the parent run
    pub parent_stage_id: Option<String>,
    /// Earliest wall-clock instant this task may be dispatched
    pub ready_at: DateTime<Utc>,
    /// Optional hard deadline for provider invocations
    pub deadline: Option<DateTime<Utc>>,
    /// Caller-supplied idempotency key; resubmission with the same key
    /// returns the original task id
    pub idempotency_key: Option<String>,
    /// Result JSON once Succeeded
    pub result: Option<serde_json::Value>,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When last updated
    pub updated_at: DateTime<Utc>,
    /// Version for optimistic locking
    pub version: u64,
}

impl Task {
    /// Create a new task of the given kind.
    pub fn new(kind: impl Into<TaskKind>, payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            priority: 0,
            owner_id: String::new(),
            required_flags: CapabilityFlags::default(),
            status: TaskStatus::default(),
            attempts: 0,
            last_error: None,
            assigned_provider_id: None,
            excluded_providers: HashSet::new(),
            parent_run_id: None,
            parent_stage_id: None,
            ready_at: now,
            deadline: None,
            idempotency_key: None,
            result: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_required_flags(mut self, flags: CapabilityFlags) -> Self {
        self.required_flags = flags;
        self
    }

    pub fn with_parent(mut self, run_id: Uuid, stage_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(run_id);
        self.parent_stage_id = Some(stage_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, maintaining the provider-assignment
    /// invariant and bumping `version`/`updated_at`.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), crate::domain::OrchestratorError> {
        if !self.can_transition_to(new_status) {
            return Err(crate::domain::OrchestratorError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        self.status = new_status;
        self.updated_at = Utc::now();
        self.version += 1;

        // assigned_provider_id is only meaningful while Running or in
        // the Succeeded/Failed outcome of that run.
        if matches!(new_status, TaskStatus::Pending | TaskStatus::Queued) {
            self.assigned_provider_id = None;
        }

        Ok(())
    }

    /// Record the start of a provider invocation. The task must
    /// already be Running (the worker transitions at queue pop, then
    /// assigns once selection and reservation have succeeded).
    pub fn assign_provider(&mut self, provider_id: ProviderId) {
        debug_assert_eq!(self.status, TaskStatus::Running);
        self.assigned_provider_id = Some(provider_id);
        self.attempts += 1;
        self.updated_at = Utc::now();
        self.version += 1;
    }

    /// Requeue after a transient error, excluding the failing provider
    /// from the next selection.
    pub fn requeue_after_failure(
        &mut self,
        ready_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Result<(), crate::domain::OrchestratorError> {
        if let Some(provider) = self.assigned_provider_id.clone() {
            self.excluded_providers.insert(provider);
        }
        self.last_error = Some(error.into());
        self.ready_at = ready_at;
        self.transition_to(TaskStatus::Queued)
    }

    /// Requeue without counting an attempt (no provider was invoked).
    pub fn requeue_for_capacity(
        &mut self,
        ready_at: DateTime<Utc>,
    ) -> Result<(), crate::domain::OrchestratorError> {
        self.ready_at = ready_at;
        self.transition_to(TaskStatus::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("code-review", TaskPayload::from_metadata(serde_json::json!({"x": 1})))
    }

    #[test]
    fn test_new_task_defaults() {
        let t = task();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempts, 0);
        assert_eq!(t.version, 1);
        assert!(t.assigned_provider_id.is_none());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut t = task();
        t.transition_to(TaskStatus::Queued).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        t.assign_provider(ProviderId::new("p1"));
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.attempts, 1);
        assert_eq!(t.assigned_provider_id, Some(ProviderId::new("p1")));

        t.transition_to(TaskStatus::Succeeded).unwrap();
        assert!(t.is_terminal());
        // Terminal states admit no further transitions.
        assert!(t.transition_to(TaskStatus::Queued).is_err());
    }

    #[test]
    fn test_requeue_clears_provider_and_excludes_it() {
        let mut t = task();
        t.transition_to(TaskStatus::Queued).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        t.assign_provider(ProviderId::new("p1"));

        let later = Utc::now() + chrono::Duration::seconds(5);
        t.requeue_after_failure(later, "connection reset").unwrap();

        assert_eq!(t.status, TaskStatus::Queued);
        assert!(t.assigned_provider_id.is_none());
        assert!(t.excluded_providers.contains(&ProviderId::new("p1")));
        assert_eq!(t.ready_at, later);
        assert_eq!(t.attempts, 1, "requeue must not count an attempt");
    }

    #[test]
    fn test_failed_can_requeue() {
        let mut t = task();
        t.transition_to(TaskStatus::Queued).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        t.assign_provider(ProviderId::new("p1"));
        t.transition_to(TaskStatus::Failed).unwrap();
        assert!(t.status.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn test_kind_registry_rejects_unknown() {
        let mut registry = TaskKindRegistry::new();
        registry.register("code-review");
        registry.register_with("analysis", TaskKindOptions { no_dedup: true });

        assert!(registry.contains(&TaskKind::new("code-review")));
        assert!(!registry.contains(&TaskKind::new("nonsense")));
        assert!(registry.options(&TaskKind::new("analysis")).unwrap().no_dedup);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::DeadLettered,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(s));
        }
    }
}
