// Engine-level errors surfaced to callers of the workflow API.

use thiserror::Error;
use uuid::Uuid;

use leadflow_shared::{ExecutionStatus, WorkflowStatus};

use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),
    #[error("Workflow {id} is not active (status: {status})")]
    WorkflowNotActive { id: Uuid, status: WorkflowStatus },
    #[error("Step '{step_id}' not found in workflow {workflow_id}")]
    StepNotFound { workflow_id: Uuid, step_id: String },
    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),
    #[error("Trigger not found: {0}")]
    TriggerNotFound(Uuid),
    #[error("Execution {id} is already {status}")]
    InvalidTransition { id: Uuid, status: ExecutionStatus },
    #[error("Workflow {id} cannot go from {from} to {to}")]
    InvalidStatusChange {
        id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;
