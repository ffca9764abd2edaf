//! Task store port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::OrchestratorResult;
use crate::domain::models::{Task, TaskStatus};

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub kind: Option<String>,
    pub owner_id: Option<String>,
    pub parent_run_id: Option<Uuid>,
}

/// Persistence contract for Task records.
///
/// Updates are guarded by an optimistic version counter: `update`
/// succeeds only when the stored version equals `task.version - 1`
/// (i.e. the caller mutated the latest copy), otherwise it fails with
/// `ConcurrencyConflict`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with `AlreadyExists` on a duplicate id.
    async fn insert(&self, task: &Task) -> OrchestratorResult<()>;

    /// Get a task by ID.
    async fn get(&self, id: Uuid) -> OrchestratorResult<Option<Task>>;

    /// Update an existing task (optimistic version check).
    async fn update(&self, task: &Task) -> OrchestratorResult<()>;

    /// List tasks matching the filter.
    async fn list(&self, filter: TaskFilter) -> OrchestratorResult<Vec<Task>>;

    /// List tasks spawned by a workflow run.
    async fn list_by_run(&self, run_id: Uuid) -> OrchestratorResult<Vec<Task>>;

    /// Look up a task by its idempotency key.
    async fn get_by_idempotency_key(&self, key: &str) -> OrchestratorResult<Option<Task>>;

    /// Count tasks per status.
    async fn count_by_status(
        &self,
    ) -> OrchestratorResult<std::collections::HashMap<TaskStatus, u64>>;
}
