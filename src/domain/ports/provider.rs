//! Provider port - the plug-in contract for upstream AI services.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::{Capabilities, Task};

/// Result of a successful provider invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Structured result payload.
    pub output: serde_json::Value,
    /// Observed invocation latency.
    pub latency_ms: u32,
}

/// Classification of a failed provider invocation.
///
/// The processor derives retry behaviour from `retryable`; providers
/// never implement retry loops themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub kind: ProviderFailureKind,
    pub retryable: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFailureKind {
    /// Connection errors, 5xx-equivalents.
    Transport,
    /// Semantic rejection (bad payload, unsupported request).
    Rejected,
    /// The provider observed its own deadline expiring.
    Timeout,
}

impl ProviderFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderFailureKind::Transport,
            retryable: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderFailureKind::Rejected,
            retryable: false,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderFailureKind::Timeout,
            retryable: true,
            message: message.into(),
        }
    }
}

/// Result of an on-demand health probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency_ms: u32,
}

/// Cost estimate for one task, in provider quota units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub units: u64,
    /// Credential sub-key the cost should be booked against; `None`
    /// lets the ledger pick per its tie-break rules.
    pub sub_key: Option<String>,
}

impl CostEstimate {
    pub fn units(units: u64) -> Self {
        Self { units, sub_key: None }
    }
}

/// The uniform interface every provider implementation exposes.
///
/// All calls are asynchronous and must honor the supplied deadline.
/// Batch execution is optional and only invoked for providers whose
/// capabilities declare the batching flag.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Execute one task. The call must return (success or failure) by
    /// `deadline`.
    async fn execute(
        &self,
        task: &Task,
        deadline: DateTime<Utc>,
    ) -> Result<ProviderResponse, ProviderFailure>;

    /// Execute a batch of tasks in one upstream call, returning one
    /// result per task in order. Default implementation serializes.
    async fn execute_batch(
        &self,
        tasks: &[Task],
        deadline: DateTime<Utc>,
    ) -> Vec<Result<ProviderResponse, ProviderFailure>> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.execute(task, deadline).await);
        }
        results
    }

    /// Declared capabilities; must be stable for the lifetime of the
    /// registration.
    fn capabilities(&self) -> Capabilities;

    /// On-demand health check.
    async fn probe(&self) -> ProbeResult;

    /// Estimated quota cost of executing `task`.
    fn estimate_cost(&self, task: &Task) -> CostEstimate;
}

/// Timestamp helper: deadline `ms` milliseconds from `now`.
pub fn deadline_from(now: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
