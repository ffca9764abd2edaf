//! Mock provider for testing.
//!
//! Scripted per-call outcomes: success, transport failure, rejection,
//! or a hang past the deadline. Records every invocation so tests can
//! assert call counts and batch shapes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::domain::models::{Capabilities, Task};
use crate::domain::ports::{
    CostEstimate, ProbeResult, Provider, ProviderFailure, ProviderResponse,
};

/// One scripted invocation outcome.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed with this output.
    Success(serde_json::Value),
    /// Fail with a retryable transport error.
    Transport(String),
    /// Fail with a non-retryable rejection.
    Reject(String),
    /// Sleep this long before succeeding (drives timeout tests).
    Delay(std::time::Duration, serde_json::Value),
}

/// Scripted provider implementation.
pub struct MockProvider {
    capabilities: Capabilities,
    /// Outcomes consumed in order; empty script means always succeed.
    script: Mutex<VecDeque<MockOutcome>>,
    default_output: serde_json::Value,
    latency_ms: u32,
    cost_units: u64,
    cost_sub_key: Option<String>,
    healthy_probe: std::sync::atomic::AtomicBool,
    invocations: AtomicUsize,
    batch_invocations: AtomicUsize,
    executed_task_ids: Mutex<Vec<Uuid>>,
}

impl MockProvider {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            script: Mutex::new(VecDeque::new()),
            default_output: serde_json::json!({"status": "ok"}),
            latency_ms: 10,
            cost_units: 1,
            cost_sub_key: None,
            healthy_probe: std::sync::atomic::AtomicBool::new(true),
            invocations: AtomicUsize::new(0),
            batch_invocations: AtomicUsize::new(0),
            executed_task_ids: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_output(mut self, output: serde_json::Value) -> Self {
        self.default_output = output;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u32) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_cost(mut self, units: u64, sub_key: Option<&str>) -> Self {
        self.cost_units = units;
        self.cost_sub_key = sub_key.map(String::from);
        self
    }

    /// Queue outcomes consumed by subsequent `execute` calls.
    pub async fn script_outcomes(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        let mut script = self.script.lock().await;
        script.extend(outcomes);
    }

    pub fn set_probe_healthy(&self, healthy: bool) {
        self.healthy_probe.store(healthy, Ordering::SeqCst);
    }

    /// Total `execute` calls (batch members count individually).
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Number of `execute_batch` calls.
    pub fn batch_count(&self) -> usize {
        self.batch_invocations.load(Ordering::SeqCst)
    }

    pub async fn executed_task_ids(&self) -> Vec<Uuid> {
        self.executed_task_ids.lock().await.clone()
    }

    async fn next_outcome(&self) -> MockOutcome {
        let mut script = self.script.lock().await;
        script
            .pop_front()
            .unwrap_or(MockOutcome::Success(self.default_output.clone()))
    }

    async fn apply(&self, outcome: MockOutcome) -> Result<ProviderResponse, ProviderFailure> {
        match outcome {
            MockOutcome::Success(output) => Ok(ProviderResponse {
                output,
                latency_ms: self.latency_ms,
            }),
            MockOutcome::Transport(message) => Err(ProviderFailure::transport(message)),
            MockOutcome::Reject(message) => Err(ProviderFailure::rejected(message)),
            MockOutcome::Delay(duration, output) => {
                tokio::time::sleep(duration).await;
                Ok(ProviderResponse {
                    output,
                    latency_ms: self.latency_ms,
                })
            }
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn execute(
        &self,
        task: &Task,
        _deadline: DateTime<Utc>,
    ) -> Result<ProviderResponse, ProviderFailure> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.executed_task_ids.lock().await.push(task.id);
        let outcome = self.next_outcome().await;
        self.apply(outcome).await
    }

    async fn execute_batch(
        &self,
        tasks: &[Task],
        _deadline: DateTime<Utc>,
    ) -> Vec<Result<ProviderResponse, ProviderFailure>> {
        self.batch_invocations.fetch_add(1, Ordering::SeqCst);
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.executed_task_ids.lock().await.push(task.id);
            let outcome = self.next_outcome().await;
            results.push(self.apply(outcome).await);
        }
        results
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn probe(&self) -> ProbeResult {
        ProbeResult {
            healthy: self.healthy_probe.load(Ordering::SeqCst),
            latency_ms: self.latency_ms,
        }
    }

    fn estimate_cost(&self, _task: &Task) -> CostEstimate {
        CostEstimate {
            units: self.cost_units,
            sub_key: self.cost_sub_key.clone(),
        }
    }
}

/// Shared handle helper: most tests hold the mock behind an Arc to
/// inspect invocation counts after registration.
pub fn shared(provider: MockProvider) -> (Arc<MockProvider>, Arc<dyn Provider>) {
    let strong = Arc::new(provider);
    let as_port: Arc<dyn Provider> = strong.clone();
    (strong, as_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskPayload;

    #[tokio::test]
    async fn test_scripted_outcomes_in_order() {
        let provider = MockProvider::new(Capabilities::for_kinds(["analysis"]));
        provider
            .script_outcomes([
                MockOutcome::Transport("reset".into()),
                MockOutcome::Success(serde_json::json!({"n": 1})),
            ])
            .await;

        let task = Task::new("analysis", TaskPayload::default());
        let deadline = Utc::now() + chrono::Duration::seconds(5);

        assert!(provider.execute(&task, deadline).await.is_err());
        let ok = provider.execute(&task, deadline).await.unwrap();
        assert_eq!(ok.output, serde_json::json!({"n": 1}));
        assert_eq!(provider.invocation_count(), 2);
    }

    #[tokio::test]
    async fn test_default_output_when_script_empty() {
        let provider = MockProvider::new(Capabilities::for_kinds(["analysis"]))
            .with_default_output(serde_json::json!("fallback"));
        let task = Task::new("analysis", TaskPayload::default());
        let ok = provider
            .execute(&task, Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(ok.output, serde_json::json!("fallback"));
    }

    #[tokio::test]
    async fn test_batch_records_members() {
        let provider = MockProvider::new(Capabilities::for_kinds(["analysis"]).with_batching(4));
        let tasks: Vec<Task> = (0..3)
            .map(|_| Task::new("analysis", TaskPayload::default()))
            .collect();

        let results = provider
            .execute_batch(&tasks, Utc::now() + chrono::Duration::seconds(5))
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(provider.batch_count(), 1);
        assert_eq!(provider.invocation_count(), 3);
    }
}
