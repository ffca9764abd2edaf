//! Domain models
//!
//! Pure domain entities with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure
//! concerns.

pub mod config;
pub mod event;
pub mod fingerprint;
pub mod plan;
pub mod provider;
pub mod queue;
pub mod quota;
pub mod task;
pub mod workflow;

pub use config::{
    Config, DedupConfig, EventBusConfig, HealthConfig, LoadBalancingStrategy, LoggingConfig,
    QuotaConfig, RetryConfig, SchedulerConfig,
};
pub use event::{EventPayload, OrchestratorEvent, SequenceNumber};
pub use fingerprint::Fingerprint;
pub use plan::ExecutionPlan;
pub use provider::{
    Capabilities, CapabilityFlags, HealthState, ProviderHealth, ProviderId, ProviderSpec,
};
pub use queue::{DispatchQueue, QueueEntry};
pub use quota::{QuotaRecord, Reservation, SubKeyLimit};
pub use task::{Task, TaskKind, TaskKindOptions, TaskKindRegistry, TaskPayload, TaskStatus};
pub use workflow::{
    RunStatus, StageEdge, StageId, StageOutcome, StageStatus, TaskTemplate, Workflow,
    WorkflowRun, WorkflowSchedule,
};
