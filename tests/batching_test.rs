//! Opportunistic batching against a batch-capable provider.

mod common;

use std::sync::Arc;

use common::{fast_config, kinds, WAIT};
use conductor::domain::models::{Capabilities, SubKeyLimit, TaskStatus};
use conductor::infrastructure::providers::{shared, MockOutcome, MockProvider};
use conductor::{Orchestrator, Provider, ProviderSpec, Task, TaskPayload};
use serde_json::json;

fn analysis_task(tag: &str) -> Task {
    Task::new("analysis", TaskPayload::from_metadata(json!({ "doc": tag })))
}

/// Orchestrator with a single worker so one worker drains the queue
/// and can see multiple ready tasks at once.
async fn single_worker_orchestrator(
    provider: MockProvider,
) -> (Orchestrator, Arc<MockProvider>) {
    let mut config = fast_config();
    config.worker_count = 1;

    let orchestrator = Orchestrator::new(config, kinds());
    let (mock, handle) = shared(provider);
    orchestrator
        .register_provider(
            ProviderSpec::new("batcher", "mock", mock.capabilities()),
            handle,
            vec![SubKeyLimit::new("main", 1_000, 3_600)],
        )
        .await
        .unwrap();
    (orchestrator, mock)
}

#[tokio::test]
async fn ready_tasks_are_dispatched_in_one_batch() {
    let provider = MockProvider::new(Capabilities::for_kinds(["analysis"]).with_batching(4));
    let (orchestrator, mock) = single_worker_orchestrator(provider).await;

    // Fill the queue before any worker exists, then start.
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            orchestrator
                .submit(analysis_task(&format!("doc-{i}")))
                .await
                .unwrap(),
        );
    }
    orchestrator.start().await;

    for id in &ids {
        let status = orchestrator.wait_task(*id, WAIT).await.unwrap();
        assert_eq!(status, TaskStatus::Succeeded);
    }

    assert_eq!(mock.batch_count(), 1, "all four tasks share one batch call");
    assert_eq!(mock.invocation_count(), 4);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn batch_respects_max_batch_size() {
    let provider = MockProvider::new(Capabilities::for_kinds(["analysis"]).with_batching(3));
    let (orchestrator, mock) = single_worker_orchestrator(provider).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            orchestrator
                .submit(analysis_task(&format!("cap-{i}")))
                .await
                .unwrap(),
        );
    }
    orchestrator.start().await;

    for id in &ids {
        assert_eq!(
            orchestrator.wait_task(*id, WAIT).await.unwrap(),
            TaskStatus::Succeeded
        );
    }

    assert_eq!(mock.invocation_count(), 5);
    assert!(
        mock.batch_count() >= 1,
        "five tasks with a cap of three need at least one batch"
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn partial_batch_failure_retries_individually() {
    let provider = MockProvider::new(Capabilities::for_kinds(["analysis"]).with_batching(2));
    provider
        .script_outcomes([
            MockOutcome::Success(json!({"n": 0})),
            MockOutcome::Transport("flaky shard".into()),
            // The retried member lands here.
            MockOutcome::Success(json!({"n": 1})),
        ])
        .await;
    let (orchestrator, mock) = single_worker_orchestrator(provider).await;

    let a = orchestrator.submit(analysis_task("pb-a")).await.unwrap();
    let b = orchestrator.submit(analysis_task("pb-b")).await.unwrap();
    orchestrator.start().await;

    assert_eq!(orchestrator.wait_task(a, WAIT).await.unwrap(), TaskStatus::Succeeded);
    assert_eq!(orchestrator.wait_task(b, WAIT).await.unwrap(), TaskStatus::Succeeded);

    // One batch call plus one individual retry.
    assert_eq!(mock.invocation_count(), 3);

    let failed_task = orchestrator.get_task(b).await.unwrap();
    // One of the two tasks carries the retry; batch order matches
    // submission order, so it is the second.
    assert_eq!(failed_task.attempts, 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn non_batching_provider_never_sees_batch_calls() {
    let provider = MockProvider::new(Capabilities::for_kinds(["analysis"]));
    let (orchestrator, mock) = single_worker_orchestrator(provider).await;

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            orchestrator
                .submit(analysis_task(&format!("solo-{i}")))
                .await
                .unwrap(),
        );
    }
    orchestrator.start().await;

    for id in &ids {
        assert_eq!(
            orchestrator.wait_task(*id, WAIT).await.unwrap(),
            TaskStatus::Succeeded
        );
    }

    assert_eq!(mock.batch_count(), 0);
    assert_eq!(mock.invocation_count(), 3);

    orchestrator.shutdown().await;
}
