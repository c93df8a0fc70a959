pub mod executions;
pub mod triggers;
