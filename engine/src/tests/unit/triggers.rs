use chrono::Duration as ChronoDuration;
use serde_json::json;

use leadflow_shared::{
    Context, EventSource, EventType, FieldCondition, FilterCriteria, PriceBand, TriggerEvent, context_from,
};

use crate::tests::fixtures;
use crate::tests::helpers::{CallRecorder, test_engine};
use crate::workflows::ExecutionFilter;

#[tokio::test]
async fn test_cooldown_enforced_through_emit_event() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["welcome"]);

    let workflow = t.engine.create_workflow(fixtures::welcome()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();
    t.engine
        .register_trigger(fixtures::lead_created_trigger(workflow.id).with_cooldown(30))
        .await
        .unwrap();

    let started = t
        .engine
        .emit_event(EventType::LeadCreated, "lead-1", Context::new(), EventSource::Form)
        .await;
    assert_eq!(started, vec![workflow.id]);

    t.clock.advance(ChronoDuration::minutes(10));
    let started = t
        .engine
        .emit_event(EventType::LeadCreated, "lead-1", Context::new(), EventSource::Form)
        .await;
    assert!(started.is_empty());
    assert_eq!(recorder.count("welcome"), 1);

    // Cooldown is per subject
    let other = t
        .engine
        .emit_event(EventType::LeadCreated, "lead-2", Context::new(), EventSource::Form)
        .await;
    assert_eq!(other.len(), 1);

    t.clock.advance(ChronoDuration::minutes(21));
    let started = t
        .engine
        .emit_event(EventType::LeadCreated, "lead-1", Context::new(), EventSource::Form)
        .await;
    assert_eq!(started.len(), 1);
    assert_eq!(recorder.count_for("welcome", "lead-1"), 2);
    assert_eq!(t.engine.subject_history("lead-1", 10).await.len(), 2);
}

#[tokio::test]
async fn test_max_fire_cap_holds_for_every_event() {
    let t = test_engine();
    let recorder = CallRecorder::new();
    recorder.register(&t.engine, &["welcome"]);

    let workflow = t.engine.create_workflow(fixtures::welcome()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();
    t.engine
        .register_trigger(fixtures::lead_created_trigger(workflow.id).with_max_fires(1))
        .await
        .unwrap();

    for _ in 0..5 {
        t.engine
            .process_event(TriggerEvent::lead_created("lead-7", json!({}), EventSource::Api))
            .await;
        t.clock.advance(ChronoDuration::days(1));
    }

    assert_eq!(recorder.count_for("welcome", "lead-7"), 1);
    let executions = t.engine.list_executions(&ExecutionFilter::subject("lead-7"));
    assert_eq!(executions.len(), 1);
}

#[tokio::test]
async fn test_conditions_and_filters_gate_starts() {
    let t = test_engine();
    let workflow = t.engine.create_workflow(fixtures::welcome()).await.unwrap();
    t.engine.activate(workflow.id).await.unwrap();
    t.engine.actions().register_fn("welcome", |_config, _context| async {
        Ok(crate::workflows::ActionOutput::message("hi"))
    });

    t.engine
        .register_trigger(
            fixtures::lead_created_trigger(workflow.id)
                .with_condition(FieldCondition::equals("lead_type", json!("buyer")))
                .with_filter(FilterCriteria {
                    price_band: Some(PriceBand {
                        min: Some(200_000.0),
                        max: Some(500_000.0),
                    }),
                    cities: vec!["Austin".to_string()],
                    ..FilterCriteria::default()
                }),
        )
        .await
        .unwrap();

    let emit = |subject: &'static str, payload: serde_json::Value| {
        let engine = &t.engine;
        async move {
            engine
                .emit_event(EventType::LeadCreated, subject, context_from(payload), EventSource::Crm)
                .await
        }
    };

    assert!(emit("seller", json!({"lead_type": "seller", "budget": 300000, "city": "Austin"})).await.is_empty());
    assert!(emit("too-cheap", json!({"lead_type": "buyer", "budget": 100000, "city": "Austin"})).await.is_empty());
    assert!(emit("elsewhere", json!({"lead_type": "buyer", "budget": 300000, "city": "Dallas"})).await.is_empty());
    assert_eq!(
        emit("match", json!({"lead_type": "buyer", "budget": 300000, "city": "austin"})).await,
        vec![workflow.id]
    );
}

#[tokio::test]
async fn test_disabled_trigger_and_inactive_workflow() {
    let t = test_engine();
    let workflow = t.engine.create_workflow(fixtures::welcome()).await.unwrap();
    let trigger = t
        .engine
        .register_trigger(fixtures::lead_created_trigger(workflow.id))
        .await
        .unwrap();

    // Draft workflow: the trigger matches but nothing starts
    let started = t
        .engine
        .emit_event(EventType::LeadCreated, "lead-1", Context::new(), EventSource::System)
        .await;
    assert!(started.is_empty());
    assert!(t.engine.list_executions(&ExecutionFilter::default()).is_empty());

    t.engine.activate(workflow.id).await.unwrap();
    t.engine.disable_trigger(trigger.id).await.unwrap();
    let started = t
        .engine
        .emit_event(EventType::LeadCreated, "lead-2", Context::new(), EventSource::System)
        .await;
    assert!(started.is_empty());

    t.engine.enable_trigger(trigger.id).await.unwrap();
    let started = t
        .engine
        .emit_event(EventType::LeadCreated, "lead-2", Context::new(), EventSource::System)
        .await;
    assert_eq!(started, vec![workflow.id]);
}

#[tokio::test]
async fn test_trigger_for_unknown_workflow_is_rejected() {
    let t = test_engine();
    let result = t
        .engine
        .register_trigger(fixtures::lead_created_trigger(uuid::Uuid::new_v4()))
        .await;
    assert!(matches!(result, Err(crate::EngineError::WorkflowNotFound(_))));
}
