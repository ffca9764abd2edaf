//! Conductor - multi-provider AI task orchestration engine
//!
//! Routes heterogeneous tasks across a pool of quota-limited AI
//! providers with:
//! - Health-aware provider selection and load-balancing strategies
//! - Per-provider quota reservation with pre-emptive rotation
//! - Request dedup and result caching (producer/follower collapse)
//! - Priority dispatch queue with retry, failover, and batching
//! - DAG workflows with conditional branching and cron scheduling

pub mod domain;
pub mod infrastructure;
pub mod orchestrator;
pub mod services;

// Re-export the types most embedders need.
pub use domain::errors::{OrchestratorError, OrchestratorResult};
pub use domain::models::{
    Capabilities, CapabilityFlags, Config, LoadBalancingStrategy, ProviderId, ProviderSpec,
    SubKeyLimit, Task, TaskKind, TaskKindRegistry, TaskPayload, TaskStatus, Workflow,
    WorkflowRun,
};
pub use domain::ports::{Provider, ProviderFailure, ProviderResponse};
pub use orchestrator::Orchestrator;
