//! In-memory store implementations.
//!
//! The persistence driver is intentionally pluggable; these maps
//! implement the store ports with the same optimistic-versioning
//! semantics a database-backed driver must provide, and back the test
//! suite and embedded deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{Task, TaskStatus, Workflow, WorkflowRun};
use crate::domain::ports::{TaskFilter, TaskStore, WorkflowStore};

/// Map-backed task store with optimistic version checks.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    /// idempotency key → task id
    idempotency: RwLock<HashMap<String, Uuid>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: &Task) -> OrchestratorResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(OrchestratorError::AlreadyExists(task.id.to_string()));
        }
        if let Some(key) = &task.idempotency_key {
            self.idempotency
                .write()
                .await
                .insert(key.clone(), task.id);
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> OrchestratorResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update(&self, task: &Task) -> OrchestratorResult<()> {
        let mut tasks = self.tasks.write().await;
        let Some(stored) = tasks.get(&task.id) else {
            return Err(OrchestratorError::TaskNotFound(task.id));
        };
        // The caller must have mutated the latest copy: its version is
        // exactly one ahead of what is stored.
        if task.version != stored.version + 1 {
            return Err(OrchestratorError::ConcurrencyConflict {
                entity: "task",
                id: task.id.to_string(),
            });
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn list(&self, filter: TaskFilter) -> OrchestratorResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.kind.as_deref().map_or(true, |k| t.kind.as_str() == k))
            .filter(|t| {
                filter
                    .owner_id
                    .as_deref()
                    .map_or(true, |o| t.owner_id == o)
            })
            .filter(|t| {
                filter
                    .parent_run_id
                    .map_or(true, |r| t.parent_run_id == Some(r))
            })
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    async fn list_by_run(&self, run_id: Uuid) -> OrchestratorResult<Vec<Task>> {
        self.list(TaskFilter {
            parent_run_id: Some(run_id),
            ..TaskFilter::default()
        })
        .await
    }

    async fn get_by_idempotency_key(&self, key: &str) -> OrchestratorResult<Option<Task>> {
        let id = self.idempotency.read().await.get(key).copied();
        match id {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn count_by_status(&self) -> OrchestratorResult<HashMap<TaskStatus, u64>> {
        let tasks = self.tasks.read().await;
        let mut counts = HashMap::new();
        for task in tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// Map-backed workflow/run store.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> OrchestratorResult<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(OrchestratorError::AlreadyExists(workflow.id.to_string()));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> OrchestratorResult<Option<Workflow>> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn list_workflows(&self) -> OrchestratorResult<Vec<Workflow>> {
        let workflows = self.workflows.read().await;
        let mut out: Vec<Workflow> = workflows.values().cloned().collect();
        out.sort_by_key(|w| w.created_at);
        Ok(out)
    }

    async fn insert_run(&self, run: &WorkflowRun) -> OrchestratorResult<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(OrchestratorError::AlreadyExists(run.id.to_string()));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> OrchestratorResult<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn update_run(&self, run: &WorkflowRun) -> OrchestratorResult<()> {
        let mut runs = self.runs.write().await;
        if !runs.contains_key(&run.id) {
            return Err(OrchestratorError::RunNotFound(run.id));
        }
        // Runs have a single writer (their coordinator); accept any
        // forward version but reject stale writes.
        if let Some(stored) = runs.get(&run.id) {
            if run.version < stored.version {
                return Err(OrchestratorError::ConcurrencyConflict {
                    entity: "workflow_run",
                    id: run.id.to_string(),
                });
            }
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn list_runs(&self, workflow_id: Uuid) -> OrchestratorResult<Vec<WorkflowRun>> {
        let runs = self.runs.read().await;
        let mut out: Vec<WorkflowRun> = runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out)
    }
}
