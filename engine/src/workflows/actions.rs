// Workflow Actions - named side effects invoked by action steps
//
// Concrete business actions (email, SMS, CRM writes) live outside the engine
// and are plugged in through the ActionHandler trait. The dispatcher renders
// `{{path}}` templates in the step config, bounds every attempt with a timeout
// and applies the step's retry policy.

use async_trait::async_trait;
use futures::FutureExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use leadflow_shared::Context;

use super::executor::{ExecutionContext, lookup_path};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Invalid action config: {0}")]
    InvalidConfig(String),
    #[error("Action timed out after {0:?}")]
    Timeout(Duration),
    #[error("Action failed: {0}")]
    Failed(String),
}

impl ActionError {
    /// Unknown actions and bad configs fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Failed(_))
    }
}

/// What a handler returns on success. `data` is merged into the execution
/// context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionOutput {
    pub message: String,
    #[serde(default)]
    pub data: Context,
}

impl ActionOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: Context::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

pub type ActionOutcome = Result<ActionOutput, ActionError>;

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, config: &Value, context: &ExecutionContext) -> ActionOutcome;
}

/// Adapts an async closure taking owned arguments into a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = ActionOutcome> + Send + 'static,
{
    async fn execute(&self, config: &Value, context: &ExecutionContext) -> ActionOutcome {
        (self.0)(config.clone(), context.clone()).await
    }
}

/// Result of running an action, across all attempts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    pub data: Context,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: i64,
}

impl ActionResult {
    pub fn success(output: ActionOutput) -> Self {
        Self {
            success: true,
            message: output.message,
            data: output.data,
            error: None,
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn failure(error: &ActionError) -> Self {
        Self {
            success: false,
            message: String::new(),
            data: Context::new(),
            error: Some(error.to_string()),
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Upper bound on a step's `max_retries`
pub const MAX_RETRIES: u32 = 10;

pub struct ActionDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    timeout: Duration,
    retry_delay: Duration,
}

impl ActionDispatcher {
    pub fn new(timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            timeout,
            retry_delay,
        }
    }

    /// Dispatcher with the context-only built-ins registered.
    pub fn with_builtins(timeout: Duration, retry_delay: Duration) -> Self {
        let dispatcher = Self::new(timeout, retry_delay);
        dispatcher.register("set_fields", SetFields);
        dispatcher.register("log_activity", LogActivity);
        dispatcher
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn register<H>(&self, name: &str, handler: H)
    where
        H: ActionHandler + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(name.to_string(), Arc::new(handler)).is_some() {
            debug!(action = name, "Replaced action handler");
        }
    }

    pub fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionOutcome> + Send + 'static,
    {
        self.register(name, FnHandler(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Run an action once.
    pub async fn execute(&self, name: &str, config: &Value, context: &ExecutionContext) -> ActionResult {
        self.execute_with_policy(name, config, context, false, 0).await
    }

    /// Run an action with up to `1 + max_retries` attempts when
    /// `retry_on_failure` is set, with `max_retries` capped at `MAX_RETRIES`.
    /// Unknown actions are never retried.
    pub async fn execute_with_policy(
        &self,
        name: &str,
        config: &Value,
        context: &ExecutionContext,
        retry_on_failure: bool,
        max_retries: u32,
    ) -> ActionResult {
        let start = Instant::now();

        let Some(handler) = self.get(name) else {
            let e = ActionError::UnknownAction(name.to_string());
            error!(action = name, execution_id = %context.execution_id, "Unknown action");
            return ActionResult::failure(&e).with_duration(elapsed_ms(start));
        };

        let config = render_config(config, context);
        let max_attempts = if retry_on_failure {
            max_retries.min(MAX_RETRIES).saturating_add(1)
        } else {
            1
        };
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(
                action = name,
                execution_id = %context.execution_id,
                step_id = %context.step_id,
                attempt,
                "Executing action"
            );

            match self.attempt(handler.as_ref(), &config, context).await {
                Ok(output) => {
                    return ActionResult::success(output)
                        .with_attempts(attempt)
                        .with_duration(elapsed_ms(start));
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(action = name, error = %e, "Action failed, retrying ({}/{})", attempt, max_attempts);
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => {
                    error!(action = name, attempts = attempt, error = %e, "Action failed");
                    return ActionResult::failure(&e)
                        .with_attempts(attempt)
                        .with_duration(elapsed_ms(start));
                }
            }
        }
    }

    async fn attempt(&self, handler: &dyn ActionHandler, config: &Value, context: &ExecutionContext) -> ActionOutcome {
        let call = AssertUnwindSafe(handler.execute(config, context)).catch_unwind();

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ActionError::Failed("action handler panicked".to_string())),
            Err(_) => Err(ActionError::Timeout(self.timeout)),
        }
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

// ============================================
// Templating
// ============================================

static TEMPLATE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("template pattern is valid")
});

/// Resolve `{{path}}` placeholders in every string of a config value.
pub fn render_config(config: &Value, context: &ExecutionContext) -> Value {
    match config {
        Value::String(s) => Value::String(render_template(s, context)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_config(v, context)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_config(v, context)).collect()),
        _ => config.clone(),
    }
}

/// Placeholders that resolve to nothing are left verbatim.
pub fn render_template(template: &str, context: &ExecutionContext) -> String {
    TEMPLATE_VAR
        .replace_all(template, |caps: &regex::Captures| {
            let path = &caps[1];
            match resolve_var(path, context) {
                Some(value) => value,
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn resolve_var(path: &str, context: &ExecutionContext) -> Option<String> {
    match path {
        "execution_id" => return Some(context.execution_id.to_string()),
        "workflow_id" => return Some(context.workflow_id.to_string()),
        "step_id" => return Some(context.step_id.clone()),
        _ => {}
    }

    if let Some(value) = lookup_path(&context.variables, path) {
        return match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        };
    }

    (path == "subject_id").then(|| context.subject_id.clone())
}

// ============================================
// Built-in handlers
// ============================================

/// `{"fields": {...}}`: writes the (rendered) fields into the context.
pub struct SetFields;

#[async_trait]
impl ActionHandler for SetFields {
    async fn execute(&self, config: &Value, _context: &ExecutionContext) -> ActionOutcome {
        let fields = config
            .get("fields")
            .and_then(Value::as_object)
            .ok_or_else(|| ActionError::InvalidConfig("set_fields needs a 'fields' object".to_string()))?;

        Ok(ActionOutput {
            message: format!("Set {} field(s)", fields.len()),
            data: fields.clone(),
        })
    }
}

/// `{"message": "..."}`: records an activity line in the log.
pub struct LogActivity;

#[async_trait]
impl ActionHandler for LogActivity {
    async fn execute(&self, config: &Value, context: &ExecutionContext) -> ActionOutcome {
        let message = config.get("message").and_then(Value::as_str).unwrap_or("workflow activity");
        info!(
            subject_id = %context.subject_id,
            execution_id = %context.execution_id,
            "Activity: {}",
            message
        );
        Ok(ActionOutput::message(message))
    }
}
