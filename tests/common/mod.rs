//! Shared test harness: an orchestrator wired with fast timings and
//! mock providers.
#![allow(dead_code)] // each test binary uses a subset of the helpers

use std::sync::Arc;

use conductor::domain::models::config::RetryConfig;
use conductor::domain::models::{Capabilities, Config, SubKeyLimit, TaskKindRegistry};
use conductor::infrastructure::providers::{shared, MockProvider};
use conductor::{Orchestrator, Provider, ProviderSpec};

/// Config with millisecond-scale timings so retries and backoffs
/// settle within test budgets.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.worker_count = 4;
    config.retry = RetryConfig {
        max_retries: 3,
        backoff_base_ms: 10,
        backoff_max_ms: 200,
    };
    config.request_timeout_ms = 2_000;
    config.dedup.follower_timeout_ms = 2_000;
    config.scheduler.tick_interval_ms = 20;
    config
}

/// Kinds used across the integration suite.
pub fn kinds() -> TaskKindRegistry {
    let mut registry = TaskKindRegistry::new();
    registry.register("code-review");
    registry.register("bug-fix");
    registry.register("analysis");
    registry
}

/// A started orchestrator with no providers yet.
pub async fn orchestrator(config: Config) -> Orchestrator {
    let orchestrator = Orchestrator::new(config, kinds());
    orchestrator.start().await;
    orchestrator
}

/// Register a mock provider serving the given kinds with a single
/// sub-key quota.
pub async fn add_provider(
    orchestrator: &Orchestrator,
    id: &str,
    task_kinds: &[&str],
    limit: u64,
) -> Arc<MockProvider> {
    let (mock, handle) = shared(MockProvider::new(Capabilities::for_kinds(
        task_kinds.iter().copied(),
    )));
    orchestrator
        .register_provider(
            ProviderSpec::new(id, "mock", mock.capabilities()),
            handle,
            vec![SubKeyLimit::new("main", limit, 3_600)],
        )
        .await
        .expect("provider registration");
    mock
}

/// Register an unmetered mock provider.
pub async fn add_unmetered_provider(
    orchestrator: &Orchestrator,
    id: &str,
    task_kinds: &[&str],
) -> Arc<MockProvider> {
    let (mock, handle) = shared(MockProvider::new(Capabilities::for_kinds(
        task_kinds.iter().copied(),
    )));
    orchestrator
        .register_provider(
            ProviderSpec::new(id, "mock", mock.capabilities()),
            handle,
            vec![],
        )
        .await
        .expect("provider registration");
    mock
}

pub const WAIT: std::time::Duration = std::time::Duration::from_secs(10);
