// Workflow Conditions - named boolean predicates over an execution context
//
// Condition steps look evaluators up by name. The registry is fail-closed: an
// unknown name, an evaluator error or a panicking evaluator all evaluate to
// false and are logged.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use leadflow_shared::{ConditionOperator, Context, FieldCondition};

use super::executor::lookup_path;
use crate::clock::SharedClock;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Invalid condition config: {0}")]
    InvalidConfig(String),
    #[error("Field '{field}' is not {expected}")]
    TypeMismatch { field: String, expected: &'static str },
    #[error("Condition failed: {0}")]
    Failed(String),
}

pub type ConditionResult<T> = Result<T, ConditionError>;

pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, config: &Value, context: &Context) -> ConditionResult<bool>;
}

/// Adapts a plain function or closure into an evaluator.
pub struct FnEvaluator<F>(pub F);

impl<F> ConditionEvaluator for FnEvaluator<F>
where
    F: Fn(&Value, &Context) -> ConditionResult<bool> + Send + Sync,
{
    fn evaluate(&self, config: &Value, context: &Context) -> ConditionResult<bool> {
        (self.0)(config, context)
    }
}

#[derive(Default)]
pub struct ConditionRegistry {
    evaluators: RwLock<HashMap<String, Arc<dyn ConditionEvaluator>>>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the generic lead predicates.
    pub fn with_builtins(clock: SharedClock) -> Self {
        let registry = Self::new();
        registry.register("field_at_least", FieldAtLeast);
        registry.register("field_equals", FieldEquals);
        registry.register("has_tag", HasTag);
        registry.register("in_range", InRange);
        registry.register("days_since", DaysSince { clock });
        registry.register("flag_set", FlagSet);
        registry
    }

    /// Register an evaluator, replacing any previous one with the same name.
    pub fn register<E>(&self, name: &str, evaluator: E)
    where
        E: ConditionEvaluator + 'static,
    {
        let mut evaluators = self.evaluators.write().unwrap_or_else(|e| e.into_inner());
        if evaluators.insert(name.to_string(), Arc::new(evaluator)).is_some() {
            debug!(condition = name, "Replaced condition evaluator");
        }
    }

    pub fn register_fn<F>(&self, name: &str, f: F)
    where
        F: Fn(&Value, &Context) -> ConditionResult<bool> + Send + Sync + 'static,
    {
        self.register(name, FnEvaluator(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.evaluators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .evaluators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<Arc<dyn ConditionEvaluator>> {
        self.evaluators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn evaluate(&self, name: &str, config: &Value, context: &Context) -> bool {
        let Some(evaluator) = self.get(name) else {
            warn!(condition = name, "Unknown condition evaluator, evaluating to false");
            return false;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(config, context))) {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(condition = name, error = %e, "Condition evaluation failed, evaluating to false");
                false
            }
            Err(_) => {
                warn!(condition = name, "Condition evaluator panicked, evaluating to false");
                false
            }
        }
    }
}

// ============================================
// Field conditions (trigger match conditions)
// ============================================

/// Evaluate a trigger match condition against an event payload.
///
/// A missing or null field is "not matched" rather than an error; only
/// IsNull matches it. Type mismatches are errors so the caller can log them.
pub fn evaluate_field_condition(condition: &FieldCondition, payload: &Context) -> ConditionResult<bool> {
    let field = condition.field.as_str();
    let actual = lookup_path(payload, field).filter(|v| !v.is_null());
    let expected = &condition.value;

    let Some(actual) = actual else {
        return Ok(condition.operator == ConditionOperator::IsNull);
    };

    match condition.operator {
        ConditionOperator::Equals => Ok(values_equal(actual, expected)),
        ConditionOperator::NotEquals => Ok(!values_equal(actual, expected)),
        ConditionOperator::Contains => contains(field, actual, expected),
        ConditionOperator::GreaterThan => compare(field, actual, expected, |a, b| a > b),
        ConditionOperator::GreaterThanOrEquals => compare(field, actual, expected, |a, b| a >= b),
        ConditionOperator::LessThan => compare(field, actual, expected, |a, b| a < b),
        ConditionOperator::LessThanOrEquals => compare(field, actual, expected, |a, b| a <= b),
        ConditionOperator::In => Ok(expect_list(expected)?.iter().any(|v| values_equal(actual, v))),
        ConditionOperator::NotIn => Ok(!expect_list(expected)?.iter().any(|v| values_equal(actual, v))),
        ConditionOperator::IsNull => Ok(false),
        ConditionOperator::IsNotNull => Ok(true),
    }
}

/// JSON equality that treats 5 and 5.0 as equal and ignores string case.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        _ => a == b,
    }
}

fn contains(field: &str, actual: &Value, expected: &Value) -> ConditionResult<bool> {
    match actual {
        Value::String(s) => {
            let needle = expected
                .as_str()
                .ok_or_else(|| ConditionError::InvalidConfig("contains expects a string value".to_string()))?;
            Ok(s.to_lowercase().contains(&needle.to_lowercase()))
        }
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, expected))),
        _ => Err(ConditionError::TypeMismatch {
            field: field.to_string(),
            expected: "a string or array",
        }),
    }
}

fn compare(field: &str, actual: &Value, expected: &Value, op: fn(f64, f64) -> bool) -> ConditionResult<bool> {
    let threshold = expected
        .as_f64()
        .ok_or_else(|| ConditionError::InvalidConfig(format!("numeric comparison on '{}' needs a number", field)))?;
    let value = actual.as_f64().ok_or_else(|| ConditionError::TypeMismatch {
        field: field.to_string(),
        expected: "a number",
    })?;
    Ok(op(value, threshold))
}

fn expect_list(expected: &Value) -> ConditionResult<&Vec<Value>> {
    expected
        .as_array()
        .ok_or_else(|| ConditionError::InvalidConfig("in/not_in expects an array value".to_string()))
}

// ============================================
// Built-in evaluators
// ============================================

fn config_str<'a>(config: &'a Value, key: &str, default: &'a str) -> &'a str {
    config.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn config_f64(config: &Value, key: &str) -> ConditionResult<Option<f64>> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| ConditionError::InvalidConfig(format!("'{}' must be a number", key))),
    }
}

fn numeric_field(context: &Context, field: &str) -> ConditionResult<Option<f64>> {
    match lookup_path(context, field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or_else(|| ConditionError::TypeMismatch {
            field: field.to_string(),
            expected: "a number",
        }),
    }
}

/// `{"field": "score", "threshold": 50}`: numeric field at or above threshold.
pub struct FieldAtLeast;

impl ConditionEvaluator for FieldAtLeast {
    fn evaluate(&self, config: &Value, context: &Context) -> ConditionResult<bool> {
        let field = config_str(config, "field", "score");
        let threshold = config_f64(config, "threshold")?.unwrap_or(50.0);
        Ok(numeric_field(context, field)?.is_some_and(|value| value >= threshold))
    }
}

/// `{"field": "status", "value": "qualified"}`
pub struct FieldEquals;

impl ConditionEvaluator for FieldEquals {
    fn evaluate(&self, config: &Value, context: &Context) -> ConditionResult<bool> {
        let field = config
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| ConditionError::InvalidConfig("field_equals needs 'field'".to_string()))?;
        let expected = config.get("value").unwrap_or(&Value::Null);
        Ok(lookup_path(context, field).is_some_and(|actual| values_equal(actual, expected)))
    }
}

/// `{"tag": "hot", "field": "tags"}`: case-insensitive tag membership.
pub struct HasTag;

impl ConditionEvaluator for HasTag {
    fn evaluate(&self, config: &Value, context: &Context) -> ConditionResult<bool> {
        let tag = config
            .get("tag")
            .and_then(Value::as_str)
            .ok_or_else(|| ConditionError::InvalidConfig("has_tag needs 'tag'".to_string()))?;
        let field = config_str(config, "field", "tags");

        match lookup_path(context, field) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Array(tags)) => Ok(tags
                .iter()
                .filter_map(Value::as_str)
                .any(|t| t.eq_ignore_ascii_case(tag))),
            Some(_) => Err(ConditionError::TypeMismatch {
                field: field.to_string(),
                expected: "a list of tags",
            }),
        }
    }
}

/// `{"field": "budget", "min": 200000, "max": 500000}`, either bound optional.
pub struct InRange;

impl ConditionEvaluator for InRange {
    fn evaluate(&self, config: &Value, context: &Context) -> ConditionResult<bool> {
        let field = config_str(config, "field", "budget");
        let min = config_f64(config, "min")?;
        let max = config_f64(config, "max")?;

        let Some(value) = numeric_field(context, field)? else {
            return Ok(false);
        };
        Ok(min.is_none_or(|min| value >= min) && max.is_none_or(|max| value <= max))
    }
}

/// `{"field": "created_at", "days": 7}`: at least N days since an RFC 3339 timestamp.
pub struct DaysSince {
    clock: SharedClock,
}

impl ConditionEvaluator for DaysSince {
    fn evaluate(&self, config: &Value, context: &Context) -> ConditionResult<bool> {
        let field = config_str(config, "field", "created_at");
        let days = config_f64(config, "days")?.unwrap_or(0.0);

        let raw = match lookup_path(context, field) {
            None | Some(Value::Null) => return Ok(false),
            Some(Value::String(raw)) => raw,
            Some(_) => {
                return Err(ConditionError::TypeMismatch {
                    field: field.to_string(),
                    expected: "a timestamp",
                });
            }
        };

        let since = DateTime::parse_from_rfc3339(raw)
            .map_err(|e| ConditionError::Failed(format!("cannot parse '{}': {}", field, e)))?
            .with_timezone(&Utc);
        let elapsed = self.clock.now() - since;
        Ok(elapsed >= Duration::seconds((days * 86_400.0) as i64))
    }
}

/// `{"field": "email_opened"}`: true only for a boolean true.
pub struct FlagSet;

impl ConditionEvaluator for FlagSet {
    fn evaluate(&self, config: &Value, context: &Context) -> ConditionResult<bool> {
        let field = config
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| ConditionError::InvalidConfig("flag_set needs 'field'".to_string()))?;
        Ok(matches!(lookup_path(context, field), Some(Value::Bool(true))))
    }
}
