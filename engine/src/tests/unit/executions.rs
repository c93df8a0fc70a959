use chrono::Duration as ChronoDuration;
use serde_json::json;
use std::sync::Arc;

use leadflow_shared::{Context, DelayStep, ExecutionStatus, Step, StepOutcome, WorkflowDefinition, context_from};

use crate::tests::fixtures;
use crate::tests::helpers::{CallRecorder, test_engine};
use crate::workflows::{ConditionError, FnEvaluator, WorkflowUpdate, split_branch};

#[tokio::test]
async fn test_suspend_and_resume_at_deadline() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["step_a", "step_c"]);

    let workflow = t.engine.create_workflow(fixtures::delayed_follow_up()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();

    let t0 = t.engine.now();
    let execution = t.engine.start(workflow.id, "lead-1", Context::new()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Waiting);
    assert_eq!(execution.resume_at, Some(t0 + ChronoDuration::hours(2)));
    assert_eq!(execution.current_step_id.as_deref(), Some("b"));
    assert_eq!(recorder.calls()[0].config, json!({"lead": "lead-1"}));

    // Too early: nothing moves
    t.clock.advance(ChronoDuration::minutes(119));
    let early = t.engine.resume(execution.id).await.unwrap();
    assert_eq!(early.status, ExecutionStatus::Waiting);
    assert_eq!(early.step_history.len(), execution.step_history.len());
    assert_eq!(recorder.count("step_c"), 0);

    t.clock.advance(ChronoDuration::minutes(1));
    let resumed = t.engine.resume(execution.id).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(recorder.count("step_c"), 1);

    let history = t.engine.step_history(execution.id).unwrap();
    let steps: Vec<&str> = history.iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(steps, vec!["a", "b", "b", "c"]);
    assert_eq!(history[2].outcome, StepOutcome::Resumed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resume_runs_next_step_once() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["step_a", "step_c"]);

    let workflow = t.engine.create_workflow(fixtures::delayed_follow_up()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();
    let execution = t.engine.start(workflow.id, "lead-1", Context::new()).await.unwrap();

    t.clock.advance(ChronoDuration::hours(3));
    let engine = Arc::new(t.engine);
    let (first, second, scan) = tokio::join!(
        engine.resume(execution.id),
        engine.resume(execution.id),
        engine.scheduler().resume_due()
    );

    tokio_test::assert_ok!(&first);
    tokio_test::assert_ok!(&second);
    assert!(scan.len() <= 1);
    assert_eq!(recorder.count("step_c"), 1);
    assert_eq!(
        engine.get_execution(execution.id).unwrap().status,
        ExecutionStatus::Completed
    );
}

#[tokio::test]
async fn test_false_branch_without_target_completes() {
    let t = test_engine();
    let workflow = t
        .engine
        .create_workflow(WorkflowDefinition::new("Only true").with_step(Step::condition(
            "check",
            "field_at_least",
            json!({"field": "score", "threshold": 80}),
            Some("hot"),
            None,
        )).with_step(Step::end("hot")))
        .await
        .unwrap();
    t.engine.activate(workflow.id).await.unwrap();

    let execution = t
        .engine
        .start(workflow.id, "lead-1", context_from(json!({"score": 12})))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.error.is_none());
    assert_eq!(execution.step_history.len(), 1);
    assert_eq!(execution.step_history[0].outcome, StepOutcome::Branched { result: false });
}

#[tokio::test]
async fn test_failing_evaluators_take_false_branch() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["on_true", "on_false"]);

    t.engine.register_condition(
        "always_errs",
        FnEvaluator(|_: &serde_json::Value, _: &Context| Err::<bool, _>(ConditionError::Failed("crm unavailable".to_string()))),
    );
    t.engine
        .conditions()
        .register_fn("always_panics", |_, _| panic!("evaluator bug"));

    for name in ["always_errs", "always_panics"] {
        let workflow = t
            .engine
            .create_workflow(
                WorkflowDefinition::new(name)
                    .with_step(Step::condition("check", name, json!({}), Some("yes"), Some("no")))
                    .with_step(Step::action("yes", "on_true", json!({})))
                    .with_step(Step::action("no", "on_false", json!({}))),
            )
            .await
            .unwrap();
        t.engine.activate(workflow.id).await.unwrap();

        let execution = t.engine.start(workflow.id, "lead-1", Context::new()).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed, "{}", name);
        assert_eq!(execution.step_history[0].outcome, StepOutcome::Branched { result: false });
    }

    assert_eq!(recorder.count("on_false"), 2);
    assert_eq!(recorder.count("on_true"), 0);
}

#[tokio::test]
async fn test_unknown_action_fails_execution() {
    let t = test_engine();
    let workflow = t
        .engine
        .create_workflow(
            WorkflowDefinition::new("Broken")
                .with_step(Step::action("send", "send_fax", json!({})).with_retry(3).then("done"))
                .with_step(Step::end("done")),
        )
        .await
        .unwrap();
    t.engine.activate(workflow.id).await.unwrap();

    let execution = t.engine.start(workflow.id, "lead-1", Context::new()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.as_deref().is_some_and(|e| e.contains("send_fax")));
    assert_eq!(execution.step_history[0].attempts, 1);
    assert_eq!(execution.current_step_id.as_deref(), Some("send"));
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn test_split_routes_subject_to_the_same_branch() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["variant_a", "variant_b"]);

    let workflow = t
        .engine
        .create_workflow(
            WorkflowDefinition::new("A/B")
                .with_step(Step::split("split", 50, Some("a"), Some("b")))
                .with_step(Step::action("a", "variant_a", json!({})))
                .with_step(Step::action("b", "variant_b", json!({}))),
        )
        .await
        .unwrap();
    t.engine.activate(workflow.id).await.unwrap();

    let expected = split_branch("lead-42", 50);
    for _ in 0..3 {
        let execution = t.engine.start(workflow.id, "lead-42", Context::new()).await.unwrap();
        assert_eq!(execution.step_history[0].outcome, StepOutcome::Split { branch: expected });
    }

    let taken = match expected {
        leadflow_shared::SplitBranch::A => "variant_a",
        leadflow_shared::SplitBranch::B => "variant_b",
    };
    assert_eq!(recorder.count(taken), 3);
}

#[tokio::test]
async fn test_waiting_execution_keeps_its_version() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["step_a", "step_c", "step_c_v2"]);

    let workflow = t.engine.create_workflow(fixtures::delayed_follow_up()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();
    let execution = t.engine.start(workflow.id, "lead-1", Context::new()).await.unwrap();
    assert_eq!(execution.workflow_version, 1);

    let edited = t
        .engine
        .update_step(workflow.id, Step::action("c", "step_c_v2", json!({})))
        .await
        .unwrap();
    assert_eq!(edited.version, 2);

    t.clock.advance(ChronoDuration::hours(2));
    let resumed = t.engine.resume(execution.id).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(recorder.count("step_c"), 1);
    assert_eq!(recorder.count("step_c_v2"), 0);

    // New executions pick up the edit
    let fresh = t.engine.start(workflow.id, "lead-2", Context::new()).await.unwrap();
    assert_eq!(fresh.workflow_version, 2);
}

#[tokio::test]
async fn test_paused_workflow_still_resumes_waiting_executions() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["step_a", "step_c"]);

    let workflow = t.engine.create_workflow(fixtures::delayed_follow_up()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();
    let execution = t.engine.start(workflow.id, "lead-1", Context::new()).await.unwrap();

    t.engine.pause(workflow.id).await.unwrap();
    assert!(t.engine.start(workflow.id, "lead-2", Context::new()).await.is_err());

    t.clock.advance(ChronoDuration::hours(2));
    let resumed = t.engine.resume(execution.id).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Completed);

    let renamed = t
        .engine
        .update_workflow(
            workflow.id,
            WorkflowUpdate {
                name: Some("Renamed".to_string()),
                ..WorkflowUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "Renamed");
}

#[tokio::test]
async fn test_zero_delay_passes_through() {
    let t = test_engine();
    let workflow = t
        .engine
        .create_workflow(
            WorkflowDefinition::new("No wait")
                .with_step(Step::delay("wait", DelayStep::minutes(0)).then("done"))
                .with_step(Step::end("done")),
        )
        .await
        .unwrap();
    t.engine.activate(workflow.id).await.unwrap();

    let execution = t.engine.start(workflow.id, "lead-1", Context::new()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.resume_at.is_none());
}

#[tokio::test]
async fn test_out_of_range_delay_fails_execution() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["welcome"]);

    let broken = t
        .engine
        .create_workflow(
            WorkflowDefinition::new("Forever")
                .with_step(Step::delay("wait", DelayStep::days(200_000_000)).then("done"))
                .with_step(Step::end("done")),
        )
        .await
        .unwrap();
    t.engine.activate(broken.id).await.unwrap();
    let welcome = t.engine.create_workflow(fixtures::welcome()).await.unwrap();
    t.engine.activate(welcome.id).await.unwrap();

    for workflow_id in [broken.id, welcome.id] {
        t.engine
            .register_trigger(fixtures::lead_created_trigger(workflow_id))
            .await
            .unwrap();
    }

    let started = t
        .engine
        .process_event(leadflow_shared::TriggerEvent::lead_created(
            "lead-1",
            json!({}),
            leadflow_shared::EventSource::Api,
        ))
        .await;
    assert_eq!(started, vec![broken.id, welcome.id]);
    assert_eq!(recorder.count("welcome"), 1);

    let execution = &t
        .engine
        .list_executions(&crate::workflows::ExecutionFilter::workflow(broken.id))[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("delay out of range"));
    assert!(execution.resume_at.is_none());
    assert_eq!(execution.current_step_id.as_deref(), Some("wait"));
}

#[tokio::test]
async fn test_huge_retry_count_is_capped() {
    let t = test_engine();
    t.engine.actions().register_fn("flaky", |_config, _context| async {
        Err::<crate::workflows::ActionOutput, _>(crate::workflows::ActionError::Failed(
            "crm unavailable".to_string(),
        ))
    });

    let workflow = t
        .engine
        .create_workflow(
            WorkflowDefinition::new("Retry forever")
                .with_step(Step::action("call", "flaky", json!({})).with_retry(u32::MAX)),
        )
        .await
        .unwrap();
    t.engine.activate(workflow.id).await.unwrap();

    let execution = t.engine.start(workflow.id, "lead-1", Context::new()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.step_history[0].attempts,
        crate::workflows::actions::MAX_RETRIES + 1
    );
}
