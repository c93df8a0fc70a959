// Lead workflow engine
//
// Trigger matching, step-graph execution with suspend/resume, and the
// persistence and background jobs around them.

pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod storage;
pub mod workflows;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{EngineConfig, StorageConfig};
pub use error::{EngineError, EngineResult};
pub use leadflow_shared as model;
pub use workflows::WorkflowEngine;

#[cfg(test)]
mod tests;
