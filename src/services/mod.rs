//! Application services: the orchestration core.
//!
//! Dependency direction is one-way: Registry ← Coordinator ←
//! Processor ← WorkflowEngine ← Scheduler. Shared state is read via
//! snapshots; updates flow through the owning component only.

pub mod condition;
pub mod coordinator;
pub mod dedup_cache;
pub mod event_bus;
pub mod processor;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod workflow_engine;

pub use condition::Condition;
pub use coordinator::ProviderCoordinator;
pub use dedup_cache::{DedupCache, DedupClaim, DedupDecision, FollowerOutcome};
pub use event_bus::{EventBus, EventFilter, FilteredReceiver};
pub use processor::{ProcessorConfig, ProcessorStats, TaskProcessor};
pub use quota::QuotaLedger;
pub use registry::{InvocationOutcome, ProviderRegistry, ProviderSnapshot};
pub use scheduler::{ScheduleEntry, WorkflowScheduler};
pub use workflow_engine::WorkflowEngine;
