// Workflow Triggers - match inbound events to workflows
//
// A trigger fires when its match conditions and filters hold, the subject is
// out of cooldown and under the fire cap. The cooldown and cap checks run under
// the same lock as the history append, so concurrent events for one subject
// cannot both slip under a cap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use leadflow_shared::{Context, EventType, FilterCriteria, Trigger, TriggerEvent, TriggerFire};

use super::conditions::evaluate_field_condition;
use super::executor::lookup_path;
use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::storage::{self, Collection, SharedRepository};

/// Persisted per-subject fire history
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubjectHistory {
    subject_id: String,
    fires: Vec<TriggerFire>,
}

pub struct TriggerRegistry {
    repo: SharedRepository,
    clock: SharedClock,
    // Registration order
    triggers: RwLock<Vec<Arc<Trigger>>>,
    history: Mutex<HashMap<String, Vec<TriggerFire>>>,
    history_limit: usize,
    next_sequence: AtomicU64,
    // Serializes trigger snapshot swaps with their persistence
    write_lock: Mutex<()>,
}

impl TriggerRegistry {
    pub fn new(repo: SharedRepository, clock: SharedClock, history_limit: usize) -> Self {
        Self {
            repo,
            clock,
            triggers: RwLock::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            history_limit: history_limit.max(1),
            next_sequence: AtomicU64::new(1),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> EngineResult<usize> {
        let mut triggers: Vec<Trigger> = storage::load_all(self.repo.as_ref(), Collection::Triggers).await?;
        let histories: Vec<SubjectHistory> =
            storage::load_all(self.repo.as_ref(), Collection::TriggerHistory).await?;

        triggers.sort_by_key(|t| t.sequence);
        let next = triggers.iter().map(|t| t.sequence).max().unwrap_or(0) + 1;
        self.next_sequence.store(next, Ordering::SeqCst);

        let count = triggers.len();
        *self.triggers.write().unwrap_or_else(|e| e.into_inner()) = triggers.into_iter().map(Arc::new).collect();

        let mut history = self.history.lock().await;
        history.clear();
        history.extend(histories.into_iter().map(|h| (h.subject_id, h.fires)));

        info!(triggers = count, subjects = history.len(), "Triggers loaded");
        Ok(count)
    }

    // ===== CRUD =====

    pub async fn register(&self, mut trigger: Trigger) -> EngineResult<Arc<Trigger>> {
        let _guard = self.write_lock.lock().await;

        trigger.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        trigger.fire_count = 0;
        trigger.last_fired_at = None;

        let trigger = Arc::new(trigger);
        self.persist(&trigger).await?;
        self.triggers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(trigger.clone());

        info!(
            trigger_id = %trigger.id,
            workflow_id = %trigger.workflow_id,
            event_type = %trigger.event_type,
            "Trigger registered"
        );
        Ok(trigger)
    }

    /// Replace a trigger's configuration. Identity, order and fire counters are kept.
    pub async fn update(&self, trigger: Trigger) -> EngineResult<Arc<Trigger>> {
        self.modify(trigger.id, |existing| {
            *existing = Trigger {
                id: existing.id,
                sequence: existing.sequence,
                created_at: existing.created_at,
                fire_count: existing.fire_count,
                last_fired_at: existing.last_fired_at,
                ..trigger
            };
        })
        .await
    }

    pub async fn enable(&self, id: Uuid) -> EngineResult<Arc<Trigger>> {
        self.modify(id, |t| t.enabled = true).await
    }

    pub async fn disable(&self, id: Uuid) -> EngineResult<Arc<Trigger>> {
        self.modify(id, |t| t.enabled = false).await
    }

    pub async fn remove(&self, id: Uuid) -> EngineResult<Arc<Trigger>> {
        let _guard = self.write_lock.lock().await;

        let removed = {
            let mut triggers = self.triggers.write().unwrap_or_else(|e| e.into_inner());
            let index = triggers
                .iter()
                .position(|t| t.id == id)
                .ok_or(EngineError::TriggerNotFound(id))?;
            triggers.remove(index)
        };
        self.repo.delete(Collection::Triggers, &id.to_string()).await?;

        info!(trigger_id = %id, "Trigger removed");
        Ok(removed)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Trigger>> {
        self.snapshot().into_iter().find(|t| t.id == id)
    }

    pub fn list(&self) -> Vec<Arc<Trigger>> {
        self.snapshot()
    }

    pub fn for_workflow(&self, workflow_id: Uuid) -> Vec<Arc<Trigger>> {
        self.snapshot()
            .into_iter()
            .filter(|t| t.workflow_id == workflow_id)
            .collect()
    }

    pub fn by_event_type(&self, event_type: EventType) -> Vec<Arc<Trigger>> {
        self.snapshot()
            .into_iter()
            .filter(|t| t.event_type == event_type)
            .collect()
    }

    /// The subject's most recent fires, oldest first.
    pub async fn subject_history(&self, subject_id: &str, limit: usize) -> Vec<TriggerFire> {
        let history = self.history.lock().await;
        match history.get(subject_id) {
            Some(fires) => fires[fires.len().saturating_sub(limit)..].to_vec(),
            None => Vec::new(),
        }
    }

    fn snapshot(&self) -> Vec<Arc<Trigger>> {
        self.triggers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ===== Matching =====

    /// Fire every eligible trigger for the event and return the target
    /// workflow ids in registration order.
    pub async fn match_event(&self, event: &TriggerEvent) -> Vec<Uuid> {
        let candidates: Vec<Arc<Trigger>> = self
            .snapshot()
            .into_iter()
            .filter(|t| t.enabled && t.event_type == event.event_type)
            .filter(|t| conditions_hold(t, &event.payload) && filters_hold(&t.filter_criteria, &event.payload))
            .collect();

        if candidates.is_empty() {
            debug!(event_type = %event.event_type, subject_id = %event.subject_id, "No triggers matched");
            return Vec::new();
        }

        let now = self.clock.now();
        let fired = self.record_fires(event, candidates, now).await;

        for trigger in &fired {
            if let Err(e) = self.bump_counters(trigger.id, now).await {
                error!(trigger_id = %trigger.id, error = %e, "Failed to update trigger counters");
            }
        }

        fired.iter().map(|t| t.workflow_id).collect()
    }

    async fn record_fires(&self, event: &TriggerEvent, candidates: Vec<Arc<Trigger>>, now: DateTime<Utc>) -> Vec<Arc<Trigger>> {
        let mut history = self.history.lock().await;
        let fires = history.entry(event.subject_id.clone()).or_default();
        let mut fired = Vec::new();

        for trigger in candidates {
            let previous = fires.iter().filter(|f| f.trigger_id == trigger.id);
            let count = previous.clone().count();
            let last = previous.map(|f| f.timestamp).max();

            if trigger.cooldown_minutes > 0 && last.is_some_and(|at| now - at < trigger.cooldown()) {
                debug!(trigger_id = %trigger.id, subject_id = %event.subject_id, "Trigger in cooldown");
                continue;
            }
            if trigger.max_fires_per_subject > 0 && count >= trigger.max_fires_per_subject as usize {
                debug!(trigger_id = %trigger.id, subject_id = %event.subject_id, "Trigger fire cap reached");
                continue;
            }

            fires.push(TriggerFire {
                trigger_id: trigger.id,
                workflow_id: trigger.workflow_id,
                event_type: event.event_type,
                timestamp: now,
            });
            info!(
                trigger_id = %trigger.id,
                trigger = %trigger.name,
                subject_id = %event.subject_id,
                "Trigger fired"
            );
            fired.push(trigger);
        }

        if fires.len() > self.history_limit {
            let excess = fires.len() - self.history_limit;
            fires.drain(..excess);
        }

        if !fired.is_empty() {
            let document = SubjectHistory {
                subject_id: event.subject_id.clone(),
                fires: fires.clone(),
            };
            if let Err(e) =
                storage::save_entity(self.repo.as_ref(), Collection::TriggerHistory, &event.subject_id, &document).await
            {
                error!(subject_id = %event.subject_id, error = %e, "Failed to persist trigger history");
            }
        }

        fired
    }

    async fn bump_counters(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<Arc<Trigger>> {
        self.modify(id, |t| {
            t.fire_count += 1;
            t.last_fired_at = Some(now);
        })
        .await
    }

    /// Copy-on-write update of one trigger, persisted before it becomes visible.
    async fn modify<F>(&self, id: Uuid, apply: F) -> EngineResult<Arc<Trigger>>
    where
        F: FnOnce(&mut Trigger),
    {
        let _guard = self.write_lock.lock().await;

        let existing = self.get(id).ok_or(EngineError::TriggerNotFound(id))?;
        let mut trigger = (*existing).clone();
        apply(&mut trigger);

        let trigger = Arc::new(trigger);
        self.persist(&trigger).await?;

        let mut triggers = self.triggers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = triggers.iter_mut().find(|t| t.id == id) {
            *slot = trigger.clone();
        }
        Ok(trigger)
    }

    async fn persist(&self, trigger: &Trigger) -> EngineResult<()> {
        storage::save_entity(self.repo.as_ref(), Collection::Triggers, &trigger.id.to_string(), trigger).await?;
        Ok(())
    }
}

fn conditions_hold(trigger: &Trigger, payload: &Context) -> bool {
    trigger.match_conditions.iter().all(|condition| {
        evaluate_field_condition(condition, payload).unwrap_or_else(|e| {
            warn!(
                trigger_id = %trigger.id,
                field = %condition.field,
                error = %e,
                "Trigger condition could not be evaluated"
            );
            false
        })
    })
}

fn filters_hold(filter: &FilterCriteria, payload: &Context) -> bool {
    if filter.is_empty() {
        return true;
    }

    let text = |field: &str| lookup_path(payload, field).and_then(Value::as_str);

    if let Some(lead_type) = &filter.lead_type {
        if !text("lead_type").is_some_and(|v| v.eq_ignore_ascii_case(lead_type)) {
            return false;
        }
    }

    if let Some(property_type) = &filter.property_type {
        if !text("property_type").is_some_and(|v| v.eq_ignore_ascii_case(property_type)) {
            return false;
        }
    }

    if let Some(band) = &filter.price_band {
        let Some(budget) = lookup_path(payload, "budget").and_then(Value::as_f64) else {
            return band.min.is_none() && band.max.is_none();
        };
        if band.min.is_some_and(|min| budget < min) || band.max.is_some_and(|max| budget > max) {
            return false;
        }
    }

    if !filter.cities.is_empty() {
        let Some(city) = text("city") else {
            return false;
        };
        if !filter.cities.iter().any(|c| c.eq_ignore_ascii_case(city)) {
            return false;
        }
    }

    true
}
