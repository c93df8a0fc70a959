// Shared setup for engine tests

use std::sync::{Arc, Mutex, Once};

use tracing_subscriber::EnvFilter;

use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::storage::{MemoryRepository, SharedRepository};
use crate::workflows::{ActionOutput, WorkflowEngine};

static TRACING: Once = Once::new();

/// Route engine logs through the test writer; `RUST_LOG=debug` shows them.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct TestEngine {
    pub engine: WorkflowEngine,
    pub clock: Arc<ManualClock>,
    pub repo: SharedRepository,
}

pub fn test_engine() -> TestEngine {
    engine_with_repo(Arc::new(MemoryRepository::new()), Arc::new(ManualClock::starting_now()))
}

pub fn engine_with_repo(repo: SharedRepository, clock: Arc<ManualClock>) -> TestEngine {
    init_tracing();
    let engine = WorkflowEngine::with_clock(&EngineConfig::default(), repo.clone(), clock.clone());
    TestEngine { engine, clock, repo }
}

/// One recorded handler call
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub action: String,
    pub subject_id: String,
    pub config: serde_json::Value,
}

/// Registers actions that only remember they were called.
#[derive(Clone, Default)]
pub struct CallRecorder {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl CallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, engine: &WorkflowEngine, names: &[&str]) {
        for name in names {
            let calls = self.calls.clone();
            let action = name.to_string();
            engine.actions().register_fn(name, move |config, context| {
                let calls = calls.clone();
                let action = action.clone();
                async move {
                    // Gives a concurrent caller a chance to interleave
                    tokio::task::yield_now().await;
                    calls.lock().unwrap().push(RecordedCall {
                        action: action.clone(),
                        subject_id: context.subject_id.clone(),
                        config,
                    });
                    Ok(ActionOutput::message(format!("{} done", action)))
                }
            });
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, action: &str) -> usize {
        self.calls().iter().filter(|c| c.action == action).count()
    }

    pub fn count_for(&self, action: &str, subject_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.action == action && c.subject_id == subject_id)
            .count()
    }
}
