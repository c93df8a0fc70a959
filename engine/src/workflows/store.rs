// Workflow Store - versioned workflow definitions
//
// Definitions are immutable Arc snapshots. A draft is edited in place; once a
// workflow has been published every graph edit bumps the version and keeps the
// previous snapshot, so running executions never see a step graph change
// underneath them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use leadflow_shared::{Step, StepId, WorkflowDefinition, WorkflowStatus};

use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::storage::{self, Collection, SharedRepository};

/// Partial update applied by `update_workflow`. `steps` replaces the whole graph.
#[derive(Debug, Clone, Default)]
pub struct WorkflowUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub steps: Option<Vec<Step>>,
    pub entry_step_id: Option<StepId>,
}

fn version_key(id: Uuid, version: u32) -> String {
    format!("{}.v{}", id, version)
}

pub struct WorkflowStore {
    repo: SharedRepository,
    clock: SharedClock,
    current: RwLock<HashMap<Uuid, Arc<WorkflowDefinition>>>,
    versions: RwLock<HashMap<(Uuid, u32), Arc<WorkflowDefinition>>>,
    // Serializes read-modify-persist cycles
    write_lock: Mutex<()>,
}

impl WorkflowStore {
    pub fn new(repo: SharedRepository, clock: SharedClock) -> Self {
        Self {
            repo,
            clock,
            current: RwLock::new(HashMap::new()),
            versions: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Reload current definitions and published snapshots from the repository.
    pub async fn load(&self) -> EngineResult<usize> {
        let workflows: Vec<WorkflowDefinition> = storage::load_all(self.repo.as_ref(), Collection::Workflows).await?;
        let snapshots: Vec<WorkflowDefinition> =
            storage::load_all(self.repo.as_ref(), Collection::WorkflowVersions).await?;

        let count = workflows.len();
        {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            current.clear();
            current.extend(workflows.into_iter().map(|w| (w.id, Arc::new(w))));
        }
        {
            let mut versions = self.versions.write().unwrap_or_else(|e| e.into_inner());
            versions.clear();
            versions.extend(snapshots.into_iter().map(|w| ((w.id, w.version), Arc::new(w))));
        }

        info!(workflows = count, "Workflow definitions loaded");
        Ok(count)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<WorkflowDefinition>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// The definition an execution pinned to `version` runs against.
    pub fn get_version(&self, id: Uuid, version: u32) -> Option<Arc<WorkflowDefinition>> {
        if let Some(snapshot) = self
            .versions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(id, version))
        {
            return Some(snapshot.clone());
        }
        self.get(id).filter(|w| w.version == version)
    }

    pub fn list(&self, status: Option<WorkflowStatus>) -> Vec<Arc<WorkflowDefinition>> {
        let mut workflows: Vec<_> = self
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|w| status.is_none_or(|s| w.status == s))
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        workflows
    }

    /// Store a new definition as a draft at version 1.
    pub async fn create(&self, mut workflow: WorkflowDefinition) -> EngineResult<Arc<WorkflowDefinition>> {
        let _guard = self.write_lock.lock().await;

        if self.get(workflow.id).is_some() {
            return Err(EngineError::InvalidDefinition(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }

        let now = self.clock.now();
        workflow.status = WorkflowStatus::Draft;
        workflow.version = 1;
        workflow.created_at = now;
        workflow.updated_at = now;

        let workflow = self.commit(workflow, false).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "Workflow created");
        Ok(workflow)
    }

    pub async fn update_workflow(&self, id: Uuid, update: WorkflowUpdate) -> EngineResult<Arc<WorkflowDefinition>> {
        self.edit(id, |workflow| {
            if let Some(name) = update.name {
                workflow.name = name;
            }
            if let Some(description) = update.description {
                workflow.description = Some(description);
            }
            if let Some(steps) = update.steps {
                workflow.steps = steps.into_iter().map(|s| (s.id.clone(), s)).collect();
                if update.entry_step_id.is_none() {
                    let entry_survives = workflow
                        .entry_step_id
                        .as_ref()
                        .is_some_and(|entry| workflow.steps.contains_key(entry));
                    if !entry_survives {
                        workflow.entry_step_id = None;
                    }
                }
            }
            if let Some(entry) = update.entry_step_id {
                ensure_step(workflow, &entry)?;
                workflow.entry_step_id = Some(entry);
            }
            Ok(())
        })
        .await
    }

    pub async fn add_step(&self, id: Uuid, step: Step) -> EngineResult<Arc<WorkflowDefinition>> {
        self.edit(id, |workflow| {
            if workflow.steps.contains_key(&step.id) {
                return Err(EngineError::InvalidDefinition(format!(
                    "step '{}' already exists",
                    step.id
                )));
            }
            workflow.insert_step(step);
            Ok(())
        })
        .await
    }

    pub async fn update_step(&self, id: Uuid, step: Step) -> EngineResult<Arc<WorkflowDefinition>> {
        self.edit(id, |workflow| {
            ensure_step(workflow, &step.id)?;
            workflow.steps.insert(step.id.clone(), step);
            Ok(())
        })
        .await
    }

    /// Remove a step and every edge pointing at it.
    pub async fn remove_step(&self, id: Uuid, step_id: &str) -> EngineResult<Arc<WorkflowDefinition>> {
        self.edit(id, |workflow| {
            ensure_step(workflow, step_id)?;
            workflow.remove_step(step_id);
            Ok(())
        })
        .await
    }

    pub async fn set_entry_step(&self, id: Uuid, step_id: &str) -> EngineResult<Arc<WorkflowDefinition>> {
        self.edit(id, |workflow| {
            ensure_step(workflow, step_id)?;
            workflow.entry_step_id = Some(step_id.to_string());
            Ok(())
        })
        .await
    }

    pub async fn activate(&self, id: Uuid) -> EngineResult<Arc<WorkflowDefinition>> {
        self.transition(id, WorkflowStatus::Active, |from| {
            matches!(from, WorkflowStatus::Draft | WorkflowStatus::Paused)
        })
        .await
    }

    pub async fn pause(&self, id: Uuid) -> EngineResult<Arc<WorkflowDefinition>> {
        self.transition(id, WorkflowStatus::Paused, |from| from == WorkflowStatus::Active)
            .await
    }

    pub async fn archive(&self, id: Uuid) -> EngineResult<Arc<WorkflowDefinition>> {
        self.transition(id, WorkflowStatus::Archived, |from| from != WorkflowStatus::Archived)
            .await
    }

    /// Drop the current definition. Published snapshots stay so in-flight
    /// executions can finish.
    pub async fn delete(&self, id: Uuid) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;

        if self.get(id).is_none() {
            return Err(EngineError::WorkflowNotFound(id));
        }

        self.repo.delete(Collection::Workflows, &id.to_string()).await?;
        self.current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);

        info!(workflow_id = %id, "Workflow deleted");
        Ok(())
    }

    async fn edit<F>(&self, id: Uuid, apply: F) -> EngineResult<Arc<WorkflowDefinition>>
    where
        F: FnOnce(&mut WorkflowDefinition) -> EngineResult<()>,
    {
        let _guard = self.write_lock.lock().await;

        let existing = self.get(id).ok_or(EngineError::WorkflowNotFound(id))?;
        if existing.status == WorkflowStatus::Archived {
            return Err(EngineError::InvalidDefinition(format!(
                "workflow {} is archived and cannot be edited",
                id
            )));
        }

        let mut workflow = (*existing).clone();
        apply(&mut workflow)?;
        workflow.updated_at = self.clock.now();

        let published = workflow.status.is_published();
        if published {
            validate(&workflow)?;
            workflow.version += 1;
        }

        let workflow = self.commit(workflow, published).await?;
        info!(
            workflow_id = %id,
            version = workflow.version,
            "Workflow definition updated"
        );
        Ok(workflow)
    }

    async fn transition<F>(&self, id: Uuid, to: WorkflowStatus, allowed: F) -> EngineResult<Arc<WorkflowDefinition>>
    where
        F: FnOnce(WorkflowStatus) -> bool,
    {
        let _guard = self.write_lock.lock().await;

        let existing = self.get(id).ok_or(EngineError::WorkflowNotFound(id))?;
        let from = existing.status;
        if !allowed(from) {
            return Err(EngineError::InvalidStatusChange { id, from, to });
        }

        let mut workflow = (*existing).clone();
        if to == WorkflowStatus::Active {
            validate(&workflow)?;
        }
        workflow.status = to;
        workflow.updated_at = self.clock.now();

        // Leaving draft publishes the current graph
        let publish = from == WorkflowStatus::Draft;
        let workflow = self.commit(workflow, publish).await?;

        info!(workflow_id = %id, from = %from, to = %to, "Workflow status changed");
        Ok(workflow)
    }

    /// Persist, then swap the in-memory snapshot.
    async fn commit(&self, workflow: WorkflowDefinition, snapshot: bool) -> EngineResult<Arc<WorkflowDefinition>> {
        let id = workflow.id;
        let version = workflow.version;

        if snapshot {
            storage::save_entity(
                self.repo.as_ref(),
                Collection::WorkflowVersions,
                &version_key(id, version),
                &workflow,
            )
            .await?;
        }
        storage::save_entity(self.repo.as_ref(), Collection::Workflows, &id.to_string(), &workflow).await?;

        let workflow = Arc::new(workflow);
        if snapshot {
            self.versions
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert((id, version), workflow.clone());
        }
        self.current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, workflow.clone());

        Ok(workflow)
    }
}

fn ensure_step(workflow: &WorkflowDefinition, step_id: &str) -> EngineResult<()> {
    if workflow.steps.contains_key(step_id) {
        Ok(())
    } else {
        Err(EngineError::StepNotFound {
            workflow_id: workflow.id,
            step_id: step_id.to_string(),
        })
    }
}

/// A runnable graph has an entry step and no dangling edges.
pub fn validate(workflow: &WorkflowDefinition) -> EngineResult<()> {
    let entry = workflow
        .entry_step_id
        .as_ref()
        .ok_or_else(|| EngineError::InvalidDefinition(format!("workflow '{}' has no entry step", workflow.name)))?;
    ensure_step(workflow, entry)?;

    for step in workflow.steps.values() {
        if let Some(missing) = step.targets().into_iter().find(|t| !workflow.steps.contains_key(*t)) {
            return Err(EngineError::InvalidDefinition(format!(
                "step '{}' points at unknown step '{}'",
                step.id, missing
            )));
        }
    }

    Ok(())
}
