//! Workflow definition, compilation, and run execution.

mod common;

use common::{add_unmetered_provider, fast_config, orchestrator, WAIT};
use conductor::domain::models::{RunStatus, StageStatus};
use conductor::infrastructure::providers::MockOutcome;
use conductor::{OrchestratorError, Workflow};
use conductor::domain::models::workflow::{StageEdge, TaskTemplate};
use serde_json::json;

async fn wait_run(
    orchestrator: &conductor::Orchestrator,
    run_id: uuid::Uuid,
) -> conductor::WorkflowRun {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let run = orchestrator.get_run(run_id).await.unwrap();
        if run.status.is_terminal() {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run did not settle in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn cyclic_workflow_is_rejected_citing_stages() {
    let orchestrator = orchestrator(fast_config()).await;

    let workflow = Workflow::new("cycle")
        .with_stage(TaskTemplate::new("a", "analysis"))
        .with_stage(TaskTemplate::new("b", "analysis"))
        .with_stage(TaskTemplate::new("c", "analysis"))
        .with_edge(StageEdge::new("a", "b"))
        .with_edge(StageEdge::new("b", "c"))
        .with_edge(StageEdge::new("c", "a"));
    let workflow_id = workflow.id;

    let err = orchestrator.define_workflow(workflow).await.unwrap_err();
    match err {
        OrchestratorError::CyclicDependency { stages } => {
            assert_eq!(stages, vec!["a", "b", "c"]);
        }
        other => panic!("expected CyclicDependency, got {other:?}"),
    }

    // Nothing was stored; no run can be created.
    assert!(orchestrator.get_workflow(workflow_id).await.is_err());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn unknown_stage_reference_is_rejected() {
    let orchestrator = orchestrator(fast_config()).await;

    let workflow = Workflow::new("dangling")
        .with_stage(TaskTemplate::new("a", "analysis"))
        .with_edge(StageEdge::new("a", "ghost"));

    let err = orchestrator.define_workflow(workflow).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownStageRef { stage } if stage == "ghost"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn condition_referencing_non_upstream_stage_is_rejected() {
    let orchestrator = orchestrator(fast_config()).await;

    // b's condition peeks at c, which runs in the same level.
    let workflow = Workflow::new("sideways")
        .with_stage(TaskTemplate::new("a", "analysis"))
        .with_stage(TaskTemplate::new("b", "analysis"))
        .with_stage(TaskTemplate::new("c", "analysis"))
        .with_edge(StageEdge::new("a", "b").when("$c.status == \"succeeded\""))
        .with_edge(StageEdge::new("a", "c"));

    let err = orchestrator.define_workflow(workflow).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::BadCondition { .. }));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn define_then_get_round_trips_the_definition() {
    let orchestrator = orchestrator(fast_config()).await;

    let workflow = Workflow::new("round-trip")
        .with_owner("acct-7")
        .with_stage(TaskTemplate::new("scan", "analysis").with_payload(json!({"depth": "full"})))
        .with_stage(TaskTemplate::new("fix", "bug-fix"))
        .with_edge(StageEdge::new("scan", "fix").when("$scan.status == \"succeeded\""));
    let expected = workflow.clone();

    let id = orchestrator.define_workflow(workflow).await.unwrap();
    let stored = orchestrator.get_workflow(id).await.unwrap();

    assert_eq!(stored, expected);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn conditional_branch_runs_one_arm_and_skips_the_other() {
    let orchestrator = orchestrator(fast_config()).await;
    let provider = add_unmetered_provider(&orchestrator, "p1", &["analysis", "bug-fix"]).await;

    // A succeeds; B requires success, C requires failure.
    let workflow = Workflow::new("branch")
        .with_stage(TaskTemplate::new("a", "analysis"))
        .with_stage(TaskTemplate::new("b", "bug-fix"))
        .with_stage(TaskTemplate::new("c", "bug-fix"))
        .with_edge(StageEdge::new("a", "b").when("$a.status == \"succeeded\""))
        .with_edge(StageEdge::new("a", "c").when("$a.status == \"failed\""));

    let id = orchestrator.define_workflow(workflow).await.unwrap();
    let run_id = orchestrator.run_workflow(id, json!({})).await.unwrap();
    let run = wait_run(&orchestrator, run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.context["a"].status, StageStatus::Succeeded);
    assert_eq!(run.context["b"].status, StageStatus::Succeeded);
    assert_eq!(run.context["c"].status, StageStatus::Skipped);
    assert_eq!(run.context["c"].output, json!(null), "skipped stages contribute no output");
    // Only a and b reached a provider.
    assert_eq!(provider.invocation_count(), 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn outputs_propagate_into_downstream_payloads() {
    let orchestrator = orchestrator(fast_config()).await;
    let provider = add_unmetered_provider(&orchestrator, "p1", &["analysis", "bug-fix"]).await;
    provider
        .script_outcomes([
            MockOutcome::Success(json!({"files": ["a.rs", "b.rs"], "count": 2})),
            MockOutcome::Success(json!({"fixed": true})),
        ])
        .await;

    let workflow = Workflow::new("propagate")
        .with_stage(TaskTemplate::new("scan", "analysis").with_payload(json!({
            "repo": "${inputs.repo}",
        })))
        .with_stage(TaskTemplate::new("fix", "bug-fix").with_payload(json!({
            "files": "${scan.output.files}",
            "note": "fixing ${scan.output.count} findings in ${inputs.repo}",
        })))
        .with_edge(StageEdge::new("scan", "fix"));

    let id = orchestrator.define_workflow(workflow).await.unwrap();
    let run_id = orchestrator
        .run_workflow(id, json!({"repo": "conductor"}))
        .await
        .unwrap();
    let run = wait_run(&orchestrator, run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);

    // Inspect the rendered payload of the second stage's task.
    let executed = provider.executed_task_ids().await;
    assert_eq!(executed.len(), 2);
    let fix_task = orchestrator.get_task(executed[1]).await.unwrap();
    assert_eq!(fix_task.payload.metadata["files"], json!(["a.rs", "b.rs"]));
    assert_eq!(
        fix_task.payload.metadata["note"],
        json!("fixing 2 findings in conductor")
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn stage_failure_fails_the_run_and_skips_the_rest() {
    let orchestrator = orchestrator(fast_config()).await;
    let provider = add_unmetered_provider(&orchestrator, "p1", &["analysis", "bug-fix"]).await;
    provider
        .script_outcomes([MockOutcome::Reject("malformed input".into())])
        .await;

    let workflow = Workflow::new("fail-fast")
        .with_stage(TaskTemplate::new("a", "analysis"))
        .with_stage(TaskTemplate::new("b", "bug-fix"))
        .with_edge(StageEdge::new("a", "b"));

    let id = orchestrator.define_workflow(workflow).await.unwrap();
    let run_id = orchestrator.run_workflow(id, json!({})).await.unwrap();
    let run = wait_run(&orchestrator, run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_stage_id.as_deref(), Some("a"));
    assert!(!run.context.contains_key("b"), "later stages never start");
    assert_eq!(provider.invocation_count(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn continue_on_failure_records_error_and_proceeds() {
    let orchestrator = orchestrator(fast_config()).await;
    let provider = add_unmetered_provider(&orchestrator, "p1", &["analysis", "bug-fix"]).await;
    provider
        .script_outcomes([
            MockOutcome::Reject("flaky stage".into()),
            MockOutcome::Success(json!({"done": true})),
        ])
        .await;

    let workflow = Workflow::new("tolerant")
        .with_stage(TaskTemplate::new("a", "analysis").continue_on_failure())
        .with_stage(TaskTemplate::new("b", "bug-fix"))
        .with_edge(StageEdge::new("a", "b"));

    let id = orchestrator.define_workflow(workflow).await.unwrap();
    let run_id = orchestrator.run_workflow(id, json!({})).await.unwrap();
    let run = wait_run(&orchestrator, run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.context["a"].status, StageStatus::Failed);
    assert_eq!(run.context["a"].output["error"], json!("flaky stage"));
    assert_eq!(run.context["b"].status, StageStatus::Succeeded);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn downstream_conditions_can_branch_on_tolerated_failure() {
    let orchestrator = orchestrator(fast_config()).await;
    let provider = add_unmetered_provider(&orchestrator, "p1", &["analysis", "bug-fix"]).await;
    provider
        .script_outcomes([
            MockOutcome::Reject("broken".into()),
            MockOutcome::Success(json!({"handled": true})),
        ])
        .await;

    let workflow = Workflow::new("recover")
        .with_stage(TaskTemplate::new("probe", "analysis").continue_on_failure())
        .with_stage(TaskTemplate::new("recover", "bug-fix"))
        .with_stage(TaskTemplate::new("celebrate", "bug-fix"))
        .with_edge(StageEdge::new("probe", "recover").when("$probe.status == \"failed\""))
        .with_edge(StageEdge::new("probe", "celebrate").when("$probe.status == \"succeeded\""));

    let id = orchestrator.define_workflow(workflow).await.unwrap();
    let run_id = orchestrator.run_workflow(id, json!({})).await.unwrap();
    let run = wait_run(&orchestrator, run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.context["recover"].status, StageStatus::Succeeded);
    assert_eq!(run.context["celebrate"].status, StageStatus::Skipped);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn skip_propagates_along_unconditional_edges() {
    let orchestrator = orchestrator(fast_config()).await;
    let provider = add_unmetered_provider(&orchestrator, "p1", &["analysis", "bug-fix"]).await;

    // b is skipped (condition false); c hangs off b unconditionally.
    let workflow = Workflow::new("skip-chain")
        .with_stage(TaskTemplate::new("a", "analysis"))
        .with_stage(TaskTemplate::new("b", "bug-fix"))
        .with_stage(TaskTemplate::new("c", "bug-fix"))
        .with_edge(StageEdge::new("a", "b").when("$a.status == \"failed\""))
        .with_edge(StageEdge::new("b", "c"));

    let id = orchestrator.define_workflow(workflow).await.unwrap();
    let run_id = orchestrator.run_workflow(id, json!({})).await.unwrap();
    let run = wait_run(&orchestrator, run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.context["b"].status, StageStatus::Skipped);
    assert_eq!(run.context["c"].status, StageStatus::Skipped);
    assert_eq!(provider.invocation_count(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn parallel_stage_tasks_share_a_level() {
    let orchestrator = orchestrator(fast_config()).await;
    let provider = add_unmetered_provider(&orchestrator, "p1", &["analysis", "bug-fix"]).await;

    let workflow = Workflow::new("fan-out")
        .with_stage(TaskTemplate::new("seed", "analysis"))
        .with_stage(TaskTemplate::new("left", "bug-fix").with_payload(json!({"arm": "left"})))
        .with_stage(TaskTemplate::new("right", "bug-fix").with_payload(json!({"arm": "right"})))
        .with_stage(TaskTemplate::new("join", "analysis").with_payload(json!({"j": 1})))
        .with_edge(StageEdge::new("seed", "left"))
        .with_edge(StageEdge::new("seed", "right"))
        .with_edge(StageEdge::new("left", "join"))
        .with_edge(StageEdge::new("right", "join"));

    let id = orchestrator.define_workflow(workflow).await.unwrap();
    let run_id = orchestrator.run_workflow(id, json!({})).await.unwrap();
    let run = wait_run(&orchestrator, run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.context.len(), 4);
    assert_eq!(provider.invocation_count(), 4);

    // Workflow affinity: every stage task ran on the same provider.
    for outcome in run.context.values() {
        assert_eq!(
            outcome.provider_id,
            Some(conductor::ProviderId::new("p1"))
        );
    }

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn cancel_run_stops_before_later_stages() {
    let orchestrator = orchestrator(fast_config()).await;
    let provider = add_unmetered_provider(&orchestrator, "p1", &["analysis", "bug-fix"]).await;
    provider
        .script_outcomes([MockOutcome::Delay(
            std::time::Duration::from_secs(30),
            json!({}),
        )])
        .await;

    let workflow = Workflow::new("cancel-me")
        .with_stage(TaskTemplate::new("slow", "analysis"))
        .with_stage(TaskTemplate::new("after", "bug-fix"))
        .with_edge(StageEdge::new("slow", "after"));

    let id = orchestrator.define_workflow(workflow).await.unwrap();
    let run_id = orchestrator.run_workflow(id, json!({})).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    orchestrator.cancel_run(run_id).await.unwrap();

    let run = wait_run(&orchestrator, run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(!run.context.contains_key("after"));
    assert!(provider.invocation_count() <= 1);

    orchestrator.shutdown().await;
}
