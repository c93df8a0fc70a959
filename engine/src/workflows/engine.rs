// Workflow Engine - executions and the public engine facade
//
// Every execution lives in its own slot guarded by a tokio Mutex. Whoever holds
// the lock (start, resume, cancel or the resumer) is the only one advancing it.
// A published snapshot of the latest state is kept next to the lock so reads
// never wait on a step that is still running.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use leadflow_shared::{
    Context, EventSource, EventType, ExecutionStatus, Step, StepKind, StepOutcome, StepRecord, Trigger,
    TriggerEvent, TriggerFire, WorkflowDefinition, WorkflowExecution, WorkflowStats, WorkflowStatus,
};

use super::actions::{ActionDispatcher, ActionHandler};
use super::conditions::{ConditionEvaluator, ConditionRegistry};
use super::executor::WorkflowExecutor;
use super::store::{WorkflowStore, WorkflowUpdate};
use super::triggers::TriggerRegistry;
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::{self, Collection, SharedRepository};

/// Read-side filter for `list_executions`
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<Uuid>,
    pub subject_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn workflow(workflow_id: Uuid) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Self::default()
        }
    }

    pub fn subject(subject_id: &str) -> Self {
        Self {
            subject_id: Some(subject_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.workflow_id.is_none_or(|id| execution.workflow_id == id)
            && self.subject_id.as_ref().is_none_or(|s| &execution.subject_id == s)
            && self.status.is_none_or(|s| execution.status == s)
    }
}

struct ExecutionSlot {
    state: Mutex<WorkflowExecution>,
    published: RwLock<WorkflowExecution>,
    cancel_requested: AtomicBool,
}

impl ExecutionSlot {
    fn new(execution: WorkflowExecution) -> Self {
        Self {
            published: RwLock::new(execution.clone()),
            state: Mutex::new(execution),
            cancel_requested: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> WorkflowExecution {
        self.published.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// ============================================
// Execution scheduler
// ============================================

pub struct ExecutionScheduler {
    repo: SharedRepository,
    clock: SharedClock,
    store: Arc<WorkflowStore>,
    executor: Arc<WorkflowExecutor>,
    slots: RwLock<HashMap<Uuid, Arc<ExecutionSlot>>>,
    resume_concurrency: usize,
}

impl ExecutionScheduler {
    pub fn new(
        repo: SharedRepository,
        clock: SharedClock,
        store: Arc<WorkflowStore>,
        executor: Arc<WorkflowExecutor>,
        resume_concurrency: usize,
    ) -> Self {
        Self {
            repo,
            clock,
            store,
            executor,
            slots: RwLock::new(HashMap::new()),
            resume_concurrency: resume_concurrency.max(1),
        }
    }

    /// Reload persisted executions. Does not advance anything.
    pub async fn load(&self) -> EngineResult<usize> {
        let executions: Vec<WorkflowExecution> = storage::load_all(self.repo.as_ref(), Collection::Executions).await?;
        let count = executions.len();

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.clear();
        slots.extend(executions.into_iter().map(|e| (e.id, Arc::new(ExecutionSlot::new(e)))));

        info!(executions = count, "Executions loaded");
        Ok(count)
    }

    fn slot(&self, id: Uuid) -> EngineResult<Arc<ExecutionSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    fn all_slots(&self) -> Vec<Arc<ExecutionSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Start an execution of an active workflow and drive it until it
    /// finishes or suspends.
    pub async fn start(&self, workflow_id: Uuid, subject_id: &str, initial_context: Context) -> EngineResult<WorkflowExecution> {
        let workflow = self
            .store
            .get(workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        if workflow.status != WorkflowStatus::Active {
            return Err(EngineError::WorkflowNotActive {
                id: workflow_id,
                status: workflow.status,
            });
        }

        let mut execution = WorkflowExecution::new(&workflow, subject_id, initial_context, self.clock.now());
        execution.status = ExecutionStatus::Running;

        let slot = Arc::new(ExecutionSlot::new(execution.clone()));
        let mut state = slot.state.lock().await;
        storage::save_entity(self.repo.as_ref(), Collection::Executions, &execution.id.to_string(), &execution).await?;
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(execution.id, slot.clone());

        info!(
            execution_id = %execution.id,
            workflow_id = %workflow_id,
            version = workflow.version,
            subject_id,
            "Execution started"
        );

        self.drive(&slot, &mut state, &workflow).await;
        Ok(state.clone())
    }

    /// Resume a waiting execution whose delay has elapsed. Anything else is
    /// a no-op that returns the current state.
    pub async fn resume(&self, execution_id: Uuid) -> EngineResult<WorkflowExecution> {
        let (execution, _) = self.try_resume(execution_id).await?;
        Ok(execution)
    }

    async fn try_resume(&self, execution_id: Uuid) -> EngineResult<(WorkflowExecution, bool)> {
        let slot = self.slot(execution_id)?;
        let mut state = slot.state.lock().await;
        let now = self.clock.now();

        if !state.is_due(now) {
            debug!(execution_id = %execution_id, status = %state.status, "Resume skipped");
            return Ok((state.clone(), false));
        }

        let Some(workflow) = self.store.get_version(state.workflow_id, state.workflow_version) else {
            let message = format!(
                "workflow {} version {} is no longer available",
                state.workflow_id, state.workflow_version
            );
            error!(execution_id = %execution_id, "{}", message);
            state.fail(&message, now);
            self.persist(&slot, &state).await;
            return Ok((state.clone(), true));
        };

        let delay_step = state.current_step_id.clone().unwrap_or_default();
        let next_step_id = workflow.step(&delay_step).and_then(Step::successor).cloned();

        state.status = ExecutionStatus::Running;
        state.resume_at = None;
        state.record(StepRecord {
            step_id: delay_step.clone(),
            step_name: workflow.step(&delay_step).map(|s| s.name.clone()).unwrap_or_default(),
            executed_at: now,
            outcome: StepOutcome::Resumed,
            attempts: 0,
            context_updates: Context::new(),
            next_step_id,
        });
        info!(execution_id = %execution_id, step_id = %delay_step, "Execution resumed");

        self.drive(&slot, &mut state, &workflow).await;
        Ok((state.clone(), true))
    }

    /// Cancel a pending, running or waiting execution. A running execution
    /// stops before its next step.
    pub async fn cancel(&self, execution_id: Uuid) -> EngineResult<WorkflowExecution> {
        let slot = self.slot(execution_id)?;
        slot.cancel_requested.store(true, Ordering::SeqCst);

        let mut state = slot.state.lock().await;
        match state.status {
            // The step loop saw the flag first
            ExecutionStatus::Cancelled => Ok(state.clone()),
            status if status.is_terminal() => Err(EngineError::InvalidTransition {
                id: execution_id,
                status,
            }),
            _ => {
                state.cancel(self.clock.now());
                self.persist(&slot, &state).await;
                info!(execution_id = %execution_id, "Execution cancelled");
                Ok(state.clone())
            }
        }
    }

    /// Resume every due execution, at most `resume_concurrency` at a time.
    /// Executions currently locked by another caller are left for the next scan.
    pub async fn resume_due(&self) -> Vec<Uuid> {
        let now = self.clock.now();
        let due: Vec<Uuid> = self
            .all_slots()
            .into_iter()
            .filter_map(|slot| {
                let state = slot.state.try_lock().ok()?;
                state.is_due(now).then_some(state.id)
            })
            .collect();

        if due.is_empty() {
            return Vec::new();
        }
        debug!(count = due.len(), "Resuming due executions");

        let results: Vec<(Uuid, EngineResult<(WorkflowExecution, bool)>)> = stream::iter(due)
            .map(|id| async move { (id, self.try_resume(id).await) })
            .buffer_unordered(self.resume_concurrency)
            .collect()
            .await;

        let mut resumed = Vec::new();
        for (id, result) in results {
            match result {
                Ok((_, true)) => resumed.push(id),
                Ok((_, false)) => {}
                Err(e) => error!(execution_id = %id, error = %e, "Failed to resume execution"),
            }
        }
        resumed
    }

    /// Re-drive executions that were pending or running when the process
    /// stopped. The interrupted step runs again.
    pub async fn recover(&self) -> EngineResult<usize> {
        let mut recovered = 0;

        for slot in self.all_slots() {
            let mut state = slot.state.lock().await;
            if !matches!(state.status, ExecutionStatus::Pending | ExecutionStatus::Running) {
                continue;
            }

            let Some(workflow) = self.store.get_version(state.workflow_id, state.workflow_version) else {
                let now = self.clock.now();
                state.fail("workflow definition missing on recovery", now);
                self.persist(&slot, &state).await;
                continue;
            };

            warn!(execution_id = %state.id, step_id = ?state.current_step_id, "Recovering interrupted execution");
            state.status = ExecutionStatus::Running;
            self.drive(&slot, &mut state, &workflow).await;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Remove terminal executions that finished before `now - older_than`.
    pub async fn purge_finished(&self, older_than: ChronoDuration) -> EngineResult<usize> {
        let cutoff = self.clock.now() - older_than;
        let expired: Vec<Uuid> = self
            .all_slots()
            .iter()
            .map(|slot| slot.snapshot())
            .filter(|e| e.is_terminal() && e.completed_at.is_some_and(|at| at < cutoff))
            .map(|e| e.id)
            .collect();

        for id in &expired {
            self.repo.delete(Collection::Executions, &id.to_string()).await?;
            self.slots.write().unwrap_or_else(|e| e.into_inner()).remove(id);
        }

        if !expired.is_empty() {
            info!(purged = expired.len(), "Purged finished executions");
        }
        Ok(expired.len())
    }

    pub fn get(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.slot(execution_id).ok().map(|slot| slot.snapshot())
    }

    pub fn list(&self, filter: &ExecutionFilter) -> Vec<WorkflowExecution> {
        let mut executions: Vec<WorkflowExecution> = self
            .all_slots()
            .iter()
            .map(|slot| slot.snapshot())
            .filter(|e| filter.matches(e))
            .collect();
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        executions
    }

    pub fn history(&self, execution_id: Uuid) -> EngineResult<Vec<StepRecord>> {
        Ok(self.slot(execution_id)?.snapshot().step_history)
    }

    pub fn stats(&self, workflow_id: Uuid) -> WorkflowStats {
        let mut stats = WorkflowStats {
            workflow_id,
            ..WorkflowStats::default()
        };
        for execution in self.list(&ExecutionFilter::workflow(workflow_id)) {
            stats.add(execution.status);
        }
        stats
    }

    /// The step loop. Runs with the slot lock held.
    async fn drive(&self, slot: &ExecutionSlot, execution: &mut WorkflowExecution, workflow: &WorkflowDefinition) {
        while execution.status == ExecutionStatus::Running {
            if slot.cancel_requested.load(Ordering::SeqCst) {
                execution.cancel(self.clock.now());
                info!(execution_id = %execution.id, "Execution cancelled between steps");
                break;
            }

            let Some(step) = execution.current_step_id.as_deref().and_then(|id| workflow.step(id)) else {
                debug!(execution_id = %execution.id, step_id = ?execution.current_step_id, "Reached graph end");
                execution.complete(self.clock.now());
                break;
            };

            if matches!(step.kind, StepKind::End) {
                execution.complete(self.clock.now());
                break;
            }

            debug!(execution_id = %execution.id, step_id = %step.id, kind = step.kind_name(), "Executing step");
            let record = self.executor.execute_step(execution, step).await;
            let outcome = record.outcome.clone();
            let has_next = record.next_step_id.is_some();
            execution.record(record);

            match outcome {
                StepOutcome::Failed { error } => {
                    warn!(execution_id = %execution.id, step_id = %step.id, error = %error, "Execution failed");
                    execution.fail(&error, self.clock.now());
                }
                StepOutcome::Suspended { resume_at } => {
                    info!(execution_id = %execution.id, step_id = %step.id, %resume_at, "Execution waiting");
                    execution.suspend(resume_at);
                }
                _ if !has_next => execution.complete(self.clock.now()),
                _ => self.persist(slot, execution).await,
            }
        }

        self.persist(slot, execution).await;
        if execution.status == ExecutionStatus::Completed {
            info!(execution_id = %execution.id, steps = execution.step_history.len(), "Execution completed");
        }
    }

    /// Write the execution through to storage and publish it to readers.
    /// Storage failures are logged; the in-memory state stays authoritative.
    async fn persist(&self, slot: &ExecutionSlot, execution: &WorkflowExecution) {
        if let Err(e) =
            storage::save_entity(self.repo.as_ref(), Collection::Executions, &execution.id.to_string(), execution).await
        {
            error!(execution_id = %execution.id, error = %e, "Failed to persist execution");
        }
        *slot.published.write().unwrap_or_else(|e| e.into_inner()) = execution.clone();
    }
}

// ============================================
// Engine facade
// ============================================

pub struct WorkflowEngine {
    clock: SharedClock,
    store: Arc<WorkflowStore>,
    triggers: Arc<TriggerRegistry>,
    scheduler: Arc<ExecutionScheduler>,
    actions: Arc<ActionDispatcher>,
    conditions: Arc<ConditionRegistry>,
}

impl WorkflowEngine {
    pub fn new(config: &EngineConfig, repo: SharedRepository) -> Self {
        Self::with_clock(config, repo, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &EngineConfig, repo: SharedRepository, clock: SharedClock) -> Self {
        let actions = Arc::new(ActionDispatcher::with_builtins(config.action_timeout, config.retry_delay));
        let conditions = Arc::new(ConditionRegistry::with_builtins(clock.clone()));
        let executor = Arc::new(WorkflowExecutor::new(actions.clone(), conditions.clone(), clock.clone()));
        let store = Arc::new(WorkflowStore::new(repo.clone(), clock.clone()));
        let triggers = Arc::new(TriggerRegistry::new(repo.clone(), clock.clone(), config.trigger_history_limit));
        let scheduler = Arc::new(ExecutionScheduler::new(
            repo,
            clock.clone(),
            store.clone(),
            executor,
            config.resume_concurrency,
        ));

        Self {
            clock,
            store,
            triggers,
            scheduler,
            actions,
            conditions,
        }
    }

    pub fn scheduler(&self) -> &Arc<ExecutionScheduler> {
        &self.scheduler
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    /// Reload workflows, triggers and executions from storage.
    pub async fn load(&self) -> EngineResult<()> {
        self.store.load().await?;
        self.triggers.load().await?;
        self.scheduler.load().await?;
        Ok(())
    }

    /// Load state and re-drive executions interrupted by a restart.
    pub async fn recover(&self) -> EngineResult<usize> {
        self.load().await?;
        let recovered = self.scheduler.recover().await?;
        if recovered > 0 {
            warn!(recovered, "Re-drove interrupted executions");
        }
        Ok(recovered)
    }

    // ===== Event ingestion =====

    pub async fn emit_event(
        &self,
        event_type: EventType,
        subject_id: &str,
        payload: Context,
        source: EventSource,
    ) -> Vec<Uuid> {
        let mut event = TriggerEvent::new(event_type, subject_id, payload, source);
        event.timestamp = self.clock.now();
        self.process_event(event).await
    }

    /// Match an event against the triggers and start one execution per fired
    /// workflow. Returns the workflows that were started; a failed start is
    /// logged and does not stop the others.
    pub async fn process_event(&self, event: TriggerEvent) -> Vec<Uuid> {
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            subject_id = %event.subject_id,
            "Processing event"
        );

        let mut started = Vec::new();
        for workflow_id in self.triggers.match_event(&event).await {
            let context = start_context(&event);
            match self.scheduler.start(workflow_id, &event.subject_id, context).await {
                Ok(execution) => {
                    debug!(execution_id = %execution.id, status = %execution.status, "Triggered execution");
                    started.push(workflow_id);
                }
                Err(e) => warn!(workflow_id = %workflow_id, error = %e, "Could not start triggered workflow"),
            }
        }
        started
    }

    // ===== Definitions =====

    pub async fn create_workflow(&self, workflow: WorkflowDefinition) -> EngineResult<Arc<WorkflowDefinition>> {
        self.store.create(workflow).await
    }

    pub fn get_workflow(&self, id: Uuid) -> Option<Arc<WorkflowDefinition>> {
        self.store.get(id)
    }

    pub fn list_workflows(&self, status: Option<WorkflowStatus>) -> Vec<Arc<WorkflowDefinition>> {
        self.store.list(status)
    }

    pub async fn update_workflow(&self, id: Uuid, update: WorkflowUpdate) -> EngineResult<Arc<WorkflowDefinition>> {
        self.store.update_workflow(id, update).await
    }

    pub async fn add_step(&self, id: Uuid, step: Step) -> EngineResult<Arc<WorkflowDefinition>> {
        self.store.add_step(id, step).await
    }

    pub async fn update_step(&self, id: Uuid, step: Step) -> EngineResult<Arc<WorkflowDefinition>> {
        self.store.update_step(id, step).await
    }

    pub async fn remove_step(&self, id: Uuid, step_id: &str) -> EngineResult<Arc<WorkflowDefinition>> {
        self.store.remove_step(id, step_id).await
    }

    pub async fn set_entry_step(&self, id: Uuid, step_id: &str) -> EngineResult<Arc<WorkflowDefinition>> {
        self.store.set_entry_step(id, step_id).await
    }

    pub async fn activate(&self, id: Uuid) -> EngineResult<Arc<WorkflowDefinition>> {
        self.store.activate(id).await
    }

    pub async fn pause(&self, id: Uuid) -> EngineResult<Arc<WorkflowDefinition>> {
        self.store.pause(id).await
    }

    pub async fn archive(&self, id: Uuid) -> EngineResult<Arc<WorkflowDefinition>> {
        self.store.archive(id).await
    }

    pub async fn delete_workflow(&self, id: Uuid) -> EngineResult<()> {
        self.store.delete(id).await
    }

    // ===== Triggers =====

    pub async fn register_trigger(&self, trigger: Trigger) -> EngineResult<Arc<Trigger>> {
        if self.store.get(trigger.workflow_id).is_none() {
            return Err(EngineError::WorkflowNotFound(trigger.workflow_id));
        }
        self.triggers.register(trigger).await
    }

    pub async fn update_trigger(&self, trigger: Trigger) -> EngineResult<Arc<Trigger>> {
        self.triggers.update(trigger).await
    }

    pub async fn remove_trigger(&self, id: Uuid) -> EngineResult<Arc<Trigger>> {
        self.triggers.remove(id).await
    }

    pub async fn enable_trigger(&self, id: Uuid) -> EngineResult<Arc<Trigger>> {
        self.triggers.enable(id).await
    }

    pub async fn disable_trigger(&self, id: Uuid) -> EngineResult<Arc<Trigger>> {
        self.triggers.disable(id).await
    }

    pub async fn subject_history(&self, subject_id: &str, limit: usize) -> Vec<TriggerFire> {
        self.triggers.subject_history(subject_id, limit).await
    }

    // ===== Registration =====

    pub fn register_action<H>(&self, name: &str, handler: H)
    where
        H: ActionHandler + 'static,
    {
        self.actions.register(name, handler);
    }

    pub fn register_condition<E>(&self, name: &str, evaluator: E)
    where
        E: ConditionEvaluator + 'static,
    {
        self.conditions.register(name, evaluator);
    }

    pub fn actions(&self) -> &Arc<ActionDispatcher> {
        &self.actions
    }

    pub fn conditions(&self) -> &Arc<ConditionRegistry> {
        &self.conditions
    }

    // ===== Executions =====

    pub async fn start(&self, workflow_id: Uuid, subject_id: &str, context: Context) -> EngineResult<WorkflowExecution> {
        self.scheduler.start(workflow_id, subject_id, context).await
    }

    pub async fn resume(&self, execution_id: Uuid) -> EngineResult<WorkflowExecution> {
        self.scheduler.resume(execution_id).await
    }

    pub async fn cancel(&self, execution_id: Uuid) -> EngineResult<WorkflowExecution> {
        self.scheduler.cancel(execution_id).await
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.scheduler.get(execution_id)
    }

    pub fn list_executions(&self, filter: &ExecutionFilter) -> Vec<WorkflowExecution> {
        self.scheduler.list(filter)
    }

    pub fn step_history(&self, execution_id: Uuid) -> EngineResult<Vec<StepRecord>> {
        self.scheduler.history(execution_id)
    }

    pub fn workflow_stats(&self, workflow_id: Uuid) -> WorkflowStats {
        self.scheduler.stats(workflow_id)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Payload fields at the top level plus the event metadata.
fn start_context(event: &TriggerEvent) -> Context {
    let mut context = event.payload.clone();
    context.insert("subject_id".to_string(), json!(event.subject_id));
    context.insert("event_type".to_string(), json!(event.event_type));
    context.insert("source".to_string(), json!(event.source.to_string()));
    context.insert(
        "trigger_data".to_string(),
        serde_json::Value::Object(event.payload.clone()),
    );
    context
}
