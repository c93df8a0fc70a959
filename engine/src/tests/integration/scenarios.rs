use chrono::Duration as ChronoDuration;
use serde_json::json;

use leadflow_shared::{EventSource, EventType, ExecutionStatus, StepOutcome, TriggerEvent, context_from};

use crate::tests::fixtures;
use crate::tests::helpers::{CallRecorder, test_engine};
use crate::workflows::ExecutionFilter;

#[tokio::test]
async fn test_score_routing_end_to_end() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["notify", "nurture_email"]);

    let workflow = t.engine.create_workflow(fixtures::score_routing()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();

    let hot = t
        .engine
        .start(workflow.id, "hot-lead", context_from(json!({"score": 90})))
        .await
        .unwrap();
    assert_eq!(hot.status, ExecutionStatus::Completed);
    assert!(hot.resume_at.is_none());
    assert_eq!(hot.step_history.len(), 2);
    assert_eq!(hot.step_history[0].outcome, StepOutcome::Branched { result: true });
    assert_eq!(hot.step_history[1].step_id, "notify");
    assert!(!hot.step_history.iter().any(|r| matches!(r.outcome, StepOutcome::Suspended { .. })));
    assert_eq!(
        recorder.calls()[0].config,
        json!({"message": "Hot lead hot-lead"})
    );

    let cold = t
        .engine
        .start(workflow.id, "cold-lead", context_from(json!({"score": 40})))
        .await
        .unwrap();
    assert_eq!(cold.status, ExecutionStatus::Waiting);
    assert_eq!(cold.current_step_id.as_deref(), Some("wait"));
    assert_eq!(cold.resume_at, Some(t.engine.now() + ChronoDuration::days(1)));
    assert_eq!(recorder.count("nurture_email"), 0);

    t.clock.advance(ChronoDuration::days(1));
    let resumed = t.engine.scheduler().resume_due().await;
    assert_eq!(resumed, vec![cold.id]);

    let cold = t.engine.get_execution(cold.id).unwrap();
    assert_eq!(cold.status, ExecutionStatus::Completed);
    assert_eq!(recorder.count_for("nurture_email", "cold-lead"), 1);
    assert_eq!(recorder.count("notify"), 1);

    let stats = t.engine.workflow_stats(workflow.id);
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 2);
}

#[tokio::test]
async fn test_score_change_event_drives_workflow() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["notify", "nurture_email"]);

    let workflow = t.engine.create_workflow(fixtures::score_routing()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();
    t.engine
        .register_trigger(leadflow_shared::Trigger::new(
            "Score moved",
            EventType::LeadScoreChanged,
            workflow.id,
        ))
        .await
        .unwrap();

    let started = t
        .engine
        .process_event(TriggerEvent::score_changed("lead-5", 60, 85))
        .await;
    assert_eq!(started, vec![workflow.id]);

    let executions = t.engine.list_executions(&ExecutionFilter::workflow(workflow.id));
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.context["trigger_data"]["old_score"], 60);
    assert_eq!(execution.context["event_type"], "lead_score_changed");

    // Other event types are ignored
    let ignored = t
        .engine
        .emit_event(EventType::PageVisited, "lead-5", Default::default(), EventSource::Webhook)
        .await;
    assert!(ignored.is_empty());
}

#[tokio::test]
async fn test_cancelled_execution_is_never_resumed() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["notify", "nurture_email"]);

    let workflow = t.engine.create_workflow(fixtures::score_routing()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();

    let waiting = t
        .engine
        .start(workflow.id, "lead-1", context_from(json!({"score": 10})))
        .await
        .unwrap();
    let other = t
        .engine
        .start(workflow.id, "lead-2", context_from(json!({"score": 10})))
        .await
        .unwrap();

    t.engine.cancel(waiting.id).await.unwrap();
    t.clock.advance(ChronoDuration::days(2));

    let resumed = t.engine.scheduler().resume_due().await;
    assert_eq!(resumed, vec![other.id]);
    assert_eq!(recorder.count_for("nurture_email", "lead-1"), 0);
    assert_eq!(
        t.engine.get_execution(waiting.id).unwrap().status,
        ExecutionStatus::Cancelled
    );

    let cancelled = t
        .engine
        .list_executions(&ExecutionFilter::default().with_status(ExecutionStatus::Cancelled));
    assert_eq!(cancelled.len(), 1);
}
