//! Workflow engine: compiles definitions into execution plans and
//! drives runs through the task processor.
//!
//! One coordinator task per active run; stages execute strictly in
//! topological order, tasks within a stage in parallel via the shared
//! processor pool. The run's context map is written by exactly one
//! stage at a time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{
    EventPayload, ExecutionPlan, RunStatus, StageId, StageOutcome, StageStatus, Task, TaskPayload,
    TaskStatus, TaskTemplate, Workflow, WorkflowRun,
};
use crate::domain::ports::WorkflowStore;
use crate::services::condition::Condition;
use crate::services::event_bus::EventBus;
use crate::services::processor::TaskProcessor;

/// Upper bound on how long a run waits for a single stage task. The
/// processor's own timeouts fire far earlier; this is a backstop
/// against lost wakeups.
const STAGE_TASK_WAIT: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Compiles workflows and executes runs.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    processor: Arc<TaskProcessor>,
    event_bus: Arc<EventBus>,
    /// Cancel signal per active run.
    active_runs: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        processor: Arc<TaskProcessor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            processor,
            event_bus,
            active_runs: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and persist a workflow definition.
    ///
    /// Compilation runs here: cyclic graphs, unknown stage references,
    /// and malformed conditions are rejected before anything is
    /// stored.
    #[instrument(skip(self, workflow), fields(workflow = %workflow.name), err)]
    pub async fn define_workflow(&self, workflow: Workflow) -> OrchestratorResult<Uuid> {
        let plan = Self::compile(&workflow)?;
        debug!(levels = plan.level_count(), "workflow compiled");

        let id = workflow.id;
        self.store.insert_workflow(&workflow).await?;
        Ok(id)
    }

    /// Compile a workflow: levelize and validate conditions.
    pub fn compile(workflow: &Workflow) -> OrchestratorResult<ExecutionPlan> {
        let plan = ExecutionPlan::compile(workflow)?;

        for edge in &workflow.edges {
            let Some(expression) = &edge.condition else { continue };
            let condition = Condition::parse(expression)?;

            let target_level = plan
                .level_of(&edge.to)
                .ok_or_else(|| OrchestratorError::UnknownStageRef { stage: edge.to.clone() })?;

            // Conditions may only look at stages that are guaranteed
            // complete before the target starts.
            for stage in condition.referenced_stages() {
                match plan.level_of(&stage) {
                    Some(level) if level < target_level => {}
                    Some(_) => {
                        return Err(OrchestratorError::BadCondition {
                            expression: expression.clone(),
                            reason: format!(
                                "stage '{stage}' does not complete before '{}'",
                                edge.to
                            ),
                        });
                    }
                    None => {
                        return Err(OrchestratorError::UnknownStageRef { stage });
                    }
                }
            }
        }

        Ok(plan)
    }

    pub async fn get_workflow(&self, id: Uuid) -> OrchestratorResult<Workflow> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or(OrchestratorError::WorkflowNotFound(id))
    }

    /// Start a run. Returns immediately with the run id; execution
    /// proceeds on a spawned coordinator task.
    #[instrument(skip(self, inputs), err)]
    pub async fn run_workflow(
        self: &Arc<Self>,
        workflow_id: Uuid,
        inputs: serde_json::Value,
    ) -> OrchestratorResult<Uuid> {
        let workflow = self.get_workflow(workflow_id).await?;
        let plan = Self::compile(&workflow)?;

        let run = WorkflowRun::new(workflow_id, inputs);
        let run_id = run.id;
        self.store.insert_run(&run).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active_runs.lock().await.insert(run_id, cancel_tx);

        self.event_bus.publish(EventPayload::RunStarted {
            run_id,
            workflow_id,
            level_count: plan.level_count(),
        });

        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive_run(run, workflow, plan, cancel_rx).await;
        });

        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: Uuid) -> OrchestratorResult<WorkflowRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    /// Cancel a run: all in-flight tasks of the current stage are
    /// cancelled and no later stage starts.
    #[instrument(skip(self), err)]
    pub async fn cancel_run(&self, run_id: Uuid) -> OrchestratorResult<()> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        if let Some(signal) = self.active_runs.lock().await.get(&run_id) {
            let _ = signal.send(true);
        }
        self.processor.cancel_tasks_of_run(run_id).await?;
        Ok(())
    }

    /// Execute the run level by level. Owns the run record for the
    /// duration; nobody else writes it.
    async fn drive_run(
        &self,
        mut run: WorkflowRun,
        workflow: Workflow,
        plan: ExecutionPlan,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let mut outcome = RunStatus::Succeeded;

        'levels: for (level_idx, level) in plan.levels.iter().enumerate() {
            if *cancel_rx.borrow() {
                outcome = RunStatus::Cancelled;
                break;
            }

            run.stage_index = level_idx;

            // Decide which stages of this level are skipped before
            // submitting anything.
            let mut submitted: Vec<(StageId, Uuid)> = Vec::new();
            for stage_id in level {
                let template = workflow
                    .stage(stage_id)
                    .expect("plan stages come from the workflow");

                match self.stage_disposition(&workflow, stage_id, &run.context) {
                    Ok(StageDisposition::Run) => {
                        let task = self.instantiate(template, &run);
                        match self.processor.submit(task).await {
                            Ok(task_id) => submitted.push((stage_id.clone(), task_id)),
                            Err(err) => {
                                warn!(run_id = %run.id, stage = %stage_id, error = %err, "stage submission failed");
                                run.last_error = Some(err.to_string());
                                run.failed_stage_id = Some(stage_id.clone());
                                outcome = RunStatus::Failed;
                                break 'levels;
                            }
                        }
                    }
                    Ok(StageDisposition::Skip) => {
                        debug!(run_id = %run.id, stage = %stage_id, "stage skipped");
                        let _ = run.record_stage(stage_id.clone(), StageOutcome::skipped());
                    }
                    Err(err) => {
                        run.last_error = Some(err.to_string());
                        run.failed_stage_id = Some(stage_id.clone());
                        outcome = RunStatus::Failed;
                        break 'levels;
                    }
                }
            }

            self.event_bus.publish(EventPayload::StageStarted {
                run_id: run.id,
                stage_index: level_idx,
                stage_ids: level.clone(),
            });

            // Wait for every submitted task to settle, then fold the
            // results into the context.
            let mut succeeded = 0usize;
            let mut failed = 0usize;
            let mut stage_failure: Option<StageId> = None;

            for (stage_id, task_id) in submitted {
                let status = tokio::select! {
                    status = self.processor.wait_terminal(task_id, STAGE_TASK_WAIT) => status,
                    _ = cancel_rx.changed() => {
                        outcome = RunStatus::Cancelled;
                        break 'levels;
                    }
                };

                if let Err(err) = status {
                    run.last_error = Some(err.to_string());
                    outcome = RunStatus::Failed;
                    break 'levels;
                }
                let task = match self.processor.get_task(task_id).await {
                    Ok(task) => task,
                    Err(err) => {
                        run.last_error = Some(err.to_string());
                        outcome = RunStatus::Failed;
                        break 'levels;
                    }
                };

                let template = workflow
                    .stage(&stage_id)
                    .expect("stage came from this workflow");

                match task.status {
                    TaskStatus::Succeeded => {
                        succeeded += 1;
                        let _ = run.record_stage(
                            stage_id,
                            StageOutcome {
                                status: StageStatus::Succeeded,
                                output: task.result.clone().unwrap_or(serde_json::Value::Null),
                                task_id: Some(task.id),
                                provider_id: task.assigned_provider_id.clone(),
                                error: None,
                            },
                        );
                    }
                    TaskStatus::Cancelled => {
                        outcome = RunStatus::Cancelled;
                        break 'levels;
                    }
                    // Failed or DeadLettered.
                    _ => {
                        failed += 1;
                        let error = task
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "task failed".to_string());
                        let _ = run.record_stage(
                            stage_id.clone(),
                            StageOutcome {
                                status: StageStatus::Failed,
                                output: serde_json::json!({
                                    "error": error,
                                    "task_id": task.id,
                                    "attempts": task.attempts,
                                }),
                                task_id: Some(task.id),
                                provider_id: task.assigned_provider_id.clone(),
                                error: Some(error),
                            },
                        );
                        if !template.continue_on_failure {
                            stage_failure = Some(stage_id);
                        }
                    }
                }
            }

            let skipped = level.len() - succeeded - failed;
            self.event_bus.publish(EventPayload::StageCompleted {
                run_id: run.id,
                stage_index: level_idx,
                succeeded,
                failed,
                skipped,
            });

            if let Err(err) = self.store.update_run(&run).await {
                warn!(run_id = %run.id, error = %err, "failed to persist run progress");
            }

            if let Some(stage_id) = stage_failure {
                run.last_error = Some(format!("stage '{stage_id}' failed"));
                run.failed_stage_id = Some(stage_id);
                outcome = RunStatus::Failed;
                break;
            }
        }

        self.finish_run(&mut run, outcome).await;
    }

    async fn finish_run(&self, run: &mut WorkflowRun, status: RunStatus) {
        run.finish(status);
        if let Err(err) = self.store.update_run(run).await {
            warn!(run_id = %run.id, error = %err, "failed to persist finished run");
        }
        self.active_runs.lock().await.remove(&run.id);

        info!(run_id = %run.id, status = status.as_str(), "workflow run finished");
        self.event_bus.publish(EventPayload::RunCompleted {
            run_id: run.id,
            workflow_id: run.workflow_id,
            status,
            failed_stage_id: run.failed_stage_id.clone(),
        });
    }

    /// Decide whether a stage runs or is skipped, based on its
    /// incoming edges and the context so far.
    fn stage_disposition(
        &self,
        workflow: &Workflow,
        stage_id: &str,
        context: &BTreeMap<StageId, StageOutcome>,
    ) -> OrchestratorResult<StageDisposition> {
        for edge in workflow.edges_into(stage_id) {
            match &edge.condition {
                Some(expression) => {
                    // Parse validated at definition time; re-parse here
                    // because only the source string is persisted.
                    let condition = Condition::parse(expression)?;
                    if !condition.evaluate(context)? {
                        return Ok(StageDisposition::Skip);
                    }
                }
                None => {
                    // Skip propagates along unconditional edges.
                    if let Some(upstream) = context.get(&edge.from) {
                        if upstream.status == StageStatus::Skipped {
                            return Ok(StageDisposition::Skip);
                        }
                    }
                }
            }
        }
        Ok(StageDisposition::Run)
    }

    /// Materialize a task from a stage template and the run context.
    fn instantiate(&self, template: &TaskTemplate, run: &WorkflowRun) -> Task {
        let rendered = render_value(&template.payload, &run.context, &run.inputs);
        Task::new(template.kind.clone(), TaskPayload::from_metadata(rendered))
            .with_priority(template.priority)
            .with_required_flags(template.required_flags)
            .with_parent(run.id, template.stage_id.clone())
    }

    /// Number of currently active runs.
    pub async fn active_run_count(&self) -> usize {
        self.active_runs.lock().await.len()
    }
}

enum StageDisposition {
    Run,
    Skip,
}

/// Render `${...}` placeholders in a payload template.
///
/// A string that is exactly one placeholder is replaced by the
/// referenced JSON value; placeholders embedded in longer strings are
/// interpolated as text. References: `${inputs.<path>}`,
/// `${<stage>.status}`, `${<stage>.output.<path>}`.
fn render_value(
    value: &serde_json::Value,
    context: &BTreeMap<StageId, StageOutcome>,
    inputs: &serde_json::Value,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => render_string(s, context, inputs),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|v| render_value(v, context, inputs)).collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, context, inputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(
    s: &str,
    context: &BTreeMap<StageId, StageOutcome>,
    inputs: &serde_json::Value,
) -> serde_json::Value {
    // Whole-string placeholder keeps the referenced value's type.
    if let Some(reference) = s
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|inner| !inner.contains("${"))
    {
        if let Some(resolved) = resolve_placeholder(reference, context, inputs) {
            return resolved;
        }
        return serde_json::Value::String(s.to_string());
    }

    // Interpolate embedded placeholders as text.
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let reference = &after[..end];
                match resolve_placeholder(reference, context, inputs) {
                    Some(serde_json::Value::String(text)) => out.push_str(&text),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push_str("${");
                        out.push_str(reference);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    serde_json::Value::String(out)
}

fn resolve_placeholder(
    reference: &str,
    context: &BTreeMap<StageId, StageOutcome>,
    inputs: &serde_json::Value,
) -> Option<serde_json::Value> {
    let mut segments = reference.split('.');
    let head = segments.next()?;

    if head == "inputs" {
        let mut current = inputs;
        for segment in segments {
            current = current.get(segment)?;
        }
        return Some(current.clone());
    }

    let outcome = context.get(head)?;
    match segments.next() {
        Some("status") => Some(serde_json::Value::String(outcome.status.as_str().to_string())),
        Some("output") => {
            let mut current = &outcome.output;
            for segment in segments {
                current = current.get(segment)?;
            }
            Some(current.clone())
        }
        _ => None,
    }
}
