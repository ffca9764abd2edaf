//! Workflow store port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::OrchestratorResult;
use crate::domain::models::{Workflow, WorkflowRun};

/// Persistence contract for workflow definitions and runs.
///
/// Run updates carry the same optimistic-versioning rule as the task
/// store. Only the run's owning engine coordinator writes a given run,
/// so conflicts indicate a logic error rather than contention.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert a workflow definition. Fails with `AlreadyExists` on a
    /// duplicate id.
    async fn insert_workflow(&self, workflow: &Workflow) -> OrchestratorResult<()>;

    /// Get a workflow by ID.
    async fn get_workflow(&self, id: Uuid) -> OrchestratorResult<Option<Workflow>>;

    /// List all workflow definitions.
    async fn list_workflows(&self) -> OrchestratorResult<Vec<Workflow>>;

    /// Insert a new run.
    async fn insert_run(&self, run: &WorkflowRun) -> OrchestratorResult<()>;

    /// Get a run by ID.
    async fn get_run(&self, id: Uuid) -> OrchestratorResult<Option<WorkflowRun>>;

    /// Update an existing run (optimistic version check).
    async fn update_run(&self, run: &WorkflowRun) -> OrchestratorResult<()>;

    /// List runs of a workflow, most recently started first.
    async fn list_runs(&self, workflow_id: Uuid) -> OrchestratorResult<Vec<WorkflowRun>>;
}
