//! Workflow and run domain models.
//!
//! A Workflow is an immutable DAG of task templates joined by edges
//! that may carry conditions. A WorkflowRun is one execution with its
//! own append-only context of stage outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::provider::{CapabilityFlags, ProviderId};
use super::task::TaskKind;

/// Stage identifier within a workflow (unique per workflow).
pub type StageId = String;

/// A parameterized task template, one per stage.
///
/// The payload metadata may embed `${<stage>.output.<path>}` and
/// `${<stage>.status}` placeholders that are rendered from the run
/// context when the stage is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub stage_id: StageId,
    pub kind: TaskKind,
    /// Payload metadata template; strings may carry placeholders.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub required_flags: CapabilityFlags,
    /// When set, a failure of this stage's task is recorded into the
    /// context as an error record and the stage still counts as
    /// succeeded.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl TaskTemplate {
    pub fn new(stage_id: impl Into<StageId>, kind: impl Into<TaskKind>) -> Self {
        Self {
            stage_id: stage_id.into(),
            kind: kind.into(),
            payload: serde_json::Value::Null,
            priority: 0,
            required_flags: CapabilityFlags::default(),
            continue_on_failure: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// A dependency edge between two stages, optionally conditional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEdge {
    pub from: StageId,
    pub to: StageId,
    /// Condition in the run condition language; `None` means the edge
    /// always activates once `from` completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl StageEdge {
    pub fn new(from: impl Into<StageId>, to: impl Into<StageId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Cron schedule attached to a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    /// Cron expression (6/7-field, as accepted by the `cron` crate).
    pub cron: String,
    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub timezone: String,
}

/// An immutable workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    /// Declaration order is preserved; it breaks ties when stages land
    /// in the same execution level.
    pub stages: Vec<TaskTemplate>,
    pub edges: Vec<StageEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<WorkflowSchedule>,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            stages: Vec::new(),
            edges: Vec::new(),
            schedule: None,
            owner_id: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_stage(mut self, template: TaskTemplate) -> Self {
        self.stages.push(template);
        self
    }

    pub fn with_edge(mut self, edge: StageEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_schedule(mut self, cron: impl Into<String>, timezone: impl Into<String>) -> Self {
        self.schedule = Some(WorkflowSchedule {
            cron: cron.into(),
            timezone: timezone.into(),
        });
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn stage(&self, stage_id: &str) -> Option<&TaskTemplate> {
        self.stages.iter().find(|t| t.stage_id == stage_id)
    }

    /// Incoming edges of a stage.
    pub fn edges_into<'a>(&'a self, stage_id: &'a str) -> impl Iterator<Item = &'a StageEdge> + 'a {
        self.edges.iter().filter(move |e| e.to == stage_id)
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Outcome status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Context slot recorded for a completed (or skipped) stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: StageStatus,
    /// Task result JSON for succeeded stages; an error record for
    /// failed stages kept under continue-on-failure; Null for skipped.
    pub output: serde_json::Value,
    pub task_id: Option<Uuid>,
    pub provider_id: Option<ProviderId>,
    pub error: Option<String>,
}

impl StageOutcome {
    pub fn skipped() -> Self {
        Self {
            status: StageStatus::Skipped,
            output: serde_json::Value::Null,
            task_id: None,
            provider_id: None,
            error: None,
        }
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: RunStatus,
    /// Index of the level currently executing (or at which the run
    /// terminated).
    pub stage_index: usize,
    /// Append-only map stage-id → outcome. Skipped stages get a
    /// `Skipped` slot so conditions can observe them; their output is
    /// Null.
    pub context: BTreeMap<StageId, StageOutcome>,
    /// Inputs supplied by the caller, exposed to templates as the
    /// pseudo-stage `inputs`.
    #[serde(default)]
    pub inputs: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Stage that caused a Failed run.
    pub failed_stage_id: Option<StageId>,
    pub version: u64,
}

impl WorkflowRun {
    pub fn new(workflow_id: Uuid, inputs: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: RunStatus::Running,
            stage_index: 0,
            context: BTreeMap::new(),
            inputs,
            started_at: Utc::now(),
            finished_at: None,
            last_error: None,
            failed_stage_id: None,
            version: 1,
        }
    }

    /// Append a stage outcome. Context is append-only: overwriting an
    /// existing slot is an invariant violation.
    pub fn record_stage(
        &mut self,
        stage_id: impl Into<StageId>,
        outcome: StageOutcome,
    ) -> Result<(), crate::domain::OrchestratorError> {
        let stage_id = stage_id.into();
        if self.context.contains_key(&stage_id) {
            return Err(crate::domain::OrchestratorError::Internal(format!(
                "stage '{stage_id}' recorded twice in run {}",
                self.id
            )));
        }
        self.context.insert(stage_id, outcome);
        self.version += 1;
        Ok(())
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.version += 1;
    }
}
