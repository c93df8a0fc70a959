// Workflow Executor - runs a single step of an execution
//
// The executor never mutates an execution. It turns (execution, step) into a
// StepRecord; the scheduler appends the record and decides what happens next.

use ring::digest;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use leadflow_shared::{
    Context, SplitBranch, Step, StepKind, StepOutcome, StepRecord, WorkflowExecution,
};

use super::actions::ActionDispatcher;
use super::conditions::ConditionRegistry;
use crate::clock::SharedClock;

/// What a handler sees while its step runs
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub subject_id: String,
    pub step_id: String,
    pub variables: Context,
}

impl ExecutionContext {
    pub fn for_step(execution: &WorkflowExecution, step: &Step) -> Self {
        Self {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            subject_id: execution.subject_id.clone(),
            step_id: step.id.clone(),
            variables: execution.context.clone(),
        }
    }
}

/// Resolve a dot separated path (`lead.address.city`, `tags.0`) in a context.
/// A literal key containing dots wins over the nested interpretation.
pub fn lookup_path<'a>(context: &'a Context, path: &str) -> Option<&'a Value> {
    if let Some(value) = context.get(path) {
        return Some(value);
    }

    let mut parts = path.split('.');
    let mut current = context.get(parts.next()?)?;

    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Stable 0-99 bucket for a subject: the first 8 bytes of SHA-256 read as a
/// big-endian integer, modulo 100. Identical across processes and restarts.
pub fn split_bucket(subject_id: &str) -> u8 {
    let hash = digest::digest(&digest::SHA256, subject_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_ref()[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

pub fn split_branch(subject_id: &str, percentage: u8) -> SplitBranch {
    if split_bucket(subject_id) < percentage {
        SplitBranch::A
    } else {
        SplitBranch::B
    }
}

pub struct WorkflowExecutor {
    actions: Arc<ActionDispatcher>,
    conditions: Arc<ConditionRegistry>,
    clock: SharedClock,
}

impl WorkflowExecutor {
    pub fn new(actions: Arc<ActionDispatcher>, conditions: Arc<ConditionRegistry>, clock: SharedClock) -> Self {
        Self {
            actions,
            conditions,
            clock,
        }
    }

    pub fn actions(&self) -> &Arc<ActionDispatcher> {
        &self.actions
    }

    pub fn conditions(&self) -> &Arc<ConditionRegistry> {
        &self.conditions
    }

    /// Run one step and describe the transition it produces.
    pub async fn execute_step(&self, execution: &WorkflowExecution, step: &Step) -> StepRecord {
        let executed_at = self.clock.now();
        let mut record = StepRecord {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            executed_at,
            outcome: StepOutcome::Succeeded { message: String::new() },
            attempts: 0,
            context_updates: Context::new(),
            next_step_id: None,
        };

        match &step.kind {
            StepKind::Action(action) => {
                let context = ExecutionContext::for_step(execution, step);
                let result = self
                    .actions
                    .execute_with_policy(
                        &action.action,
                        &action.config,
                        &context,
                        action.retry_on_failure,
                        action.max_retries,
                    )
                    .await;

                record.attempts = result.attempts;
                if result.success {
                    record.outcome = StepOutcome::Succeeded { message: result.message };
                    record.context_updates = result.data;
                    record.next_step_id = step.successor().cloned();
                } else {
                    record.outcome = StepOutcome::Failed {
                        error: result.error.unwrap_or_else(|| "action failed".to_string()),
                    };
                }
            }
            StepKind::Condition(condition) if !self.conditions.contains(&condition.condition) => {
                warn!(
                    execution_id = %execution.id,
                    condition = %condition.condition,
                    "Unknown condition evaluator"
                );
                record.outcome = StepOutcome::Failed {
                    error: format!("Unknown condition: {}", condition.condition),
                };
            }
            StepKind::Condition(condition) => {
                let result = self
                    .conditions
                    .evaluate(&condition.condition, &condition.config, &execution.context);
                debug!(
                    execution_id = %execution.id,
                    step_id = %step.id,
                    condition = %condition.condition,
                    result,
                    "Condition evaluated"
                );
                record.outcome = StepOutcome::Branched { result };
                record.next_step_id = condition.target(result).cloned();
            }
            StepKind::Delay(delay) => {
                if delay.total_minutes() > 0 {
                    match executed_at.checked_add_signed(delay.duration()) {
                        Some(resume_at) => {
                            record.outcome = StepOutcome::Suspended { resume_at };
                            record.next_step_id = step.successor().cloned();
                        }
                        None => {
                            warn!(
                                execution_id = %execution.id,
                                step_id = %step.id,
                                minutes = delay.total_minutes(),
                                "Delay out of range"
                            );
                            record.outcome = StepOutcome::Failed {
                                error: "delay out of range".to_string(),
                            };
                        }
                    }
                } else {
                    record.next_step_id = step.successor().cloned();
                    record.outcome = StepOutcome::Succeeded {
                        message: "zero-length delay".to_string(),
                    };
                }
            }
            StepKind::Split(split) => {
                let branch = split_branch(&execution.subject_id, split.percentage);
                record.outcome = StepOutcome::Split { branch };
                record.next_step_id = split.target(branch).cloned();
            }
            // The scheduler completes on End without recording it
            StepKind::End => {
                record.outcome = StepOutcome::Succeeded {
                    message: "end".to_string(),
                };
            }
        }

        record
    }
}
