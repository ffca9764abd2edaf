//! Event envelope published on the internal bus.
//!
//! Status transitions and workflow progress are broadcast for the
//! external facade (WebSocket layer, dashboards) to consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::provider::{HealthState, ProviderId};
use super::task::TaskStatus;
use super::workflow::{RunStatus, StageId};

/// Monotonically increasing sequence number assigned by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event envelope with identity, ordering, and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub id: Uuid,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl OrchestratorEvent {
    /// Envelope with a zero sequence; the bus assigns the real one at
    /// publish time.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: SequenceNumber(0),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Task this event concerns, if any; used by subscription filters.
    pub fn task_id(&self) -> Option<Uuid> {
        match &self.payload {
            EventPayload::TaskSubmitted { task_id, .. }
            | EventPayload::TaskStatusChanged { task_id, .. }
            | EventPayload::TaskRetrying { task_id, .. }
            | EventPayload::TaskDeadLettered { task_id, .. }
            | EventPayload::TaskDeduplicated { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    /// Workflow run this event concerns, if any.
    pub fn run_id(&self) -> Option<Uuid> {
        match &self.payload {
            EventPayload::RunStarted { run_id, .. }
            | EventPayload::StageStarted { run_id, .. }
            | EventPayload::StageCompleted { run_id, .. }
            | EventPayload::RunCompleted { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }
}

/// Everything the engine announces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // Task lifecycle
    TaskSubmitted {
        task_id: Uuid,
        kind: String,
        priority: i32,
    },
    TaskStatusChanged {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        provider_id: Option<ProviderId>,
    },
    TaskRetrying {
        task_id: Uuid,
        attempt: u32,
        max_retries: u32,
        error: String,
    },
    TaskDeadLettered {
        task_id: Uuid,
        attempts: u32,
        error: String,
    },
    /// Task collapsed onto an in-flight producer or served from cache.
    TaskDeduplicated {
        task_id: Uuid,
        producer_task_id: Option<Uuid>,
        from_cache: bool,
    },

    // Provider lifecycle
    ProviderRegistered {
        provider_id: ProviderId,
    },
    ProviderDeregistered {
        provider_id: ProviderId,
    },
    ProviderHealthChanged {
        provider_id: ProviderId,
        from: HealthState,
        to: HealthState,
        consecutive_failures: u32,
    },

    // Workflow runs
    RunStarted {
        run_id: Uuid,
        workflow_id: Uuid,
        level_count: usize,
    },
    StageStarted {
        run_id: Uuid,
        stage_index: usize,
        stage_ids: Vec<StageId>,
    },
    StageCompleted {
        run_id: Uuid,
        stage_index: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    RunCompleted {
        run_id: Uuid,
        workflow_id: Uuid,
        status: RunStatus,
        failed_stage_id: Option<StageId>,
    },

    // Scheduler
    ScheduleFired {
        workflow_id: Uuid,
        run_id: Uuid,
        fire_time: DateTime<Utc>,
        catch_up: bool,
    },

    /// Invariant violation; mirrors the operator alert channel.
    InternalError {
        context: String,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_extraction() {
        let id = Uuid::new_v4();
        let event = OrchestratorEvent::new(EventPayload::TaskStatusChanged {
            task_id: id,
            from: TaskStatus::Queued,
            to: TaskStatus::Running,
            provider_id: Some(ProviderId::new("p1")),
        });
        assert_eq!(event.task_id(), Some(id));
        assert_eq!(event.run_id(), None);
    }

    #[test]
    fn test_run_id_extraction() {
        let run_id = Uuid::new_v4();
        let event = OrchestratorEvent::new(EventPayload::RunCompleted {
            run_id,
            workflow_id: Uuid::new_v4(),
            status: RunStatus::Succeeded,
            failed_stage_id: None,
        });
        assert_eq!(event.run_id(), Some(run_id));
        assert_eq!(event.task_id(), None);
    }

    #[test]
    fn test_payload_serializes_with_tag() {
        let event = OrchestratorEvent::new(EventPayload::ProviderRegistered {
            provider_id: ProviderId::new("p1"),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "provider_registered");
    }
}
