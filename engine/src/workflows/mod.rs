// Workflow Automation Engine
//
// Event-driven automation for lead follow-up. Triggers start executions of
// versioned step graphs; delay steps suspend them until the resumer picks
// them back up.

pub mod actions;
pub mod conditions;
pub mod engine;
pub mod executor;
pub mod store;
pub mod triggers;

pub use actions::{ActionDispatcher, ActionError, ActionHandler, ActionOutput, ActionResult, FnHandler};
pub use conditions::{ConditionError, ConditionEvaluator, ConditionRegistry, FnEvaluator};
pub use engine::{ExecutionFilter, ExecutionScheduler, WorkflowEngine};
pub use executor::{ExecutionContext, WorkflowExecutor, split_branch, split_bucket};
pub use store::{WorkflowStore, WorkflowUpdate};
pub use triggers::TriggerRegistry;
