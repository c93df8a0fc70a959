use chrono::Duration as ChronoDuration;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use leadflow_shared::{Context, EventSource, EventType, ExecutionStatus, context_from};

use crate::clock::ManualClock;
use crate::storage::{Collection, FileRepository, SharedRepository};
use crate::tests::fixtures;
use crate::tests::helpers::{CallRecorder, engine_with_repo};

async fn file_repo(dir: &TempDir) -> SharedRepository {
    Arc::new(FileRepository::open(dir.path()).await.unwrap())
}

#[tokio::test]
async fn test_waiting_execution_survives_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());

    let (workflow_id, execution_id) = {
        let t = engine_with_repo(file_repo(&dir).await, clock.clone());
        let recorder = CallRecorder::new();
        recorder.register(&t.engine, &["notify", "nurture_email"]);

        let workflow = t.engine.create_workflow(fixtures::score_routing()).await.unwrap();
        t.engine.activate(workflow.id).await.unwrap();
        let execution = t
            .engine
            .start(workflow.id, "lead-1", context_from(json!({"score": 20})))
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Waiting);
        (workflow.id, execution.id)
    };

    let t = engine_with_repo(file_repo(&dir).await, clock.clone());
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["notify", "nurture_email"]);
    assert_eq!(t.engine.recover().await.unwrap(), 0);

    let reloaded = t.engine.get_execution(execution_id).unwrap();
    assert_eq!(reloaded.status, ExecutionStatus::Waiting);
    assert!(t.engine.get_workflow(workflow_id).is_some());

    clock.advance(ChronoDuration::days(1));
    assert_eq!(t.engine.scheduler().resume_due().await, vec![execution_id]);
    assert_eq!(recorder.count("nurture_email"), 1);

    let finished = t.engine.get_execution(execution_id).unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    let (current, context) = finished.replay();
    assert_eq!(current, finished.current_step_id);
    assert_eq!(context["score"], 20);
}

#[tokio::test]
async fn test_cooldown_survives_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());

    {
        let t = engine_with_repo(file_repo(&dir).await, clock.clone());
        let workflow = t.engine.create_workflow(fixtures::welcome()).await.unwrap();
        t.engine.activate(workflow.id).await.unwrap();
        t.engine
            .register_trigger(fixtures::lead_created_trigger(workflow.id).with_cooldown(60))
            .await
            .unwrap();
        let started = t
            .engine
            .emit_event(EventType::LeadCreated, "lead-1", Context::new(), EventSource::Form)
            .await;
        assert_eq!(started.len(), 1);
    }

    let t = engine_with_repo(file_repo(&dir).await, clock.clone());
    t.engine.recover().await.unwrap();
    assert_eq!(t.engine.triggers().list().len(), 1);
    assert_eq!(t.engine.subject_history("lead-1", 5).await.len(), 1);

    clock.advance(ChronoDuration::minutes(30));
    let blocked = t
        .engine
        .emit_event(EventType::LeadCreated, "lead-1", Context::new(), EventSource::Form)
        .await;
    assert!(blocked.is_empty());

    clock.advance(ChronoDuration::minutes(31));
    let started = t
        .engine
        .emit_event(EventType::LeadCreated, "lead-1", Context::new(), EventSource::Form)
        .await;
    assert_eq!(started.len(), 1);
}

#[tokio::test]
async fn test_published_versions_are_stored() {
    let dir = TempDir::new().unwrap();
    let t = engine_with_repo(file_repo(&dir).await, Arc::new(ManualClock::starting_now()));

    let workflow = t.engine.create_workflow(fixtures::delayed_follow_up()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();
    t.engine
        .update_workflow(
            workflow.id,
            crate::workflows::WorkflowUpdate {
                description: Some("v2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let versions = t.repo.query(Collection::WorkflowVersions).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert!(t.engine.store().get_version(workflow.id, 1).is_some());
    assert_eq!(t.engine.get_workflow(workflow.id).unwrap().version, 2);
}

#[tokio::test]
async fn test_fire_cap_survives_restart_for_similar_subject_ids() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let subjects = ["lead/1", "lead_1", "a@b.com", "a_b.com"];

    {
        let t = engine_with_repo(file_repo(&dir).await, clock.clone());
        let workflow = t.engine.create_workflow(fixtures::welcome()).await.unwrap();
        t.engine.activate(workflow.id).await.unwrap();
        t.engine
            .register_trigger(fixtures::lead_created_trigger(workflow.id).with_max_fires(1))
            .await
            .unwrap();

        for subject in subjects {
            let started = t
                .engine
                .emit_event(EventType::LeadCreated, subject, Context::new(), EventSource::Form)
                .await;
            assert_eq!(started.len(), 1, "{}", subject);
        }
    }

    let t = engine_with_repo(file_repo(&dir).await, clock.clone());
    t.engine.recover().await.unwrap();

    for subject in subjects {
        assert_eq!(t.engine.subject_history(subject, 5).await.len(), 1, "{}", subject);
        let started = t
            .engine
            .emit_event(EventType::LeadCreated, subject, Context::new(), EventSource::Form)
            .await;
        assert!(started.is_empty(), "{} fired twice", subject);
    }
}
