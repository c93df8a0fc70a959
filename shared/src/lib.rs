// Shared data model for the lead workflow engine.
//
// Everything here is plain serializable data: workflow definitions, the step
// graph, triggers, inbound events and execution state. Behaviour lives in the
// engine crate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Mutable key/value context carried by an execution and by event payloads.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Identifier of a node inside one workflow's step graph.
pub type StepId = String;

/// Convert a JSON value into a context map. Non-object values yield an empty map.
pub fn context_from(value: serde_json::Value) -> Context {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Context::new(),
    }
}

// ============================================
// Workflow definitions
// ============================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }

    /// A workflow is published once it has left draft. Graph edits on a
    /// published workflow produce a new version instead of mutating in place.
    pub fn is_published(&self) -> bool {
        !matches!(self, Self::Draft)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, versioned step graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "first_version")]
    pub version: u32,
    #[serde(default)]
    pub entry_step_id: Option<StepId>,
    #[serde(default)]
    pub steps: BTreeMap<StepId, Step>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn first_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            version: first_version(),
            entry_step_id: None,
            steps: BTreeMap::new(),
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Add a step. The first step added becomes the entry step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.insert_step(step);
        self
    }

    pub fn with_entry(mut self, step_id: &str) -> Self {
        self.entry_step_id = Some(step_id.to_string());
        self
    }

    pub fn insert_step(&mut self, step: Step) {
        if self.entry_step_id.is_none() {
            self.entry_step_id = Some(step.id.clone());
        }
        self.steps.insert(step.id.clone(), step);
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }

    /// Remove a step and unlink every reference to it from the rest of the graph.
    pub fn remove_step(&mut self, step_id: &str) -> Option<Step> {
        let removed = self.steps.remove(step_id)?;

        for step in self.steps.values_mut() {
            step.unlink(step_id);
        }
        if self.entry_step_id.as_deref() == Some(step_id) {
            self.entry_step_id = None;
        }

        Some(removed)
    }
}

/// One node in the step graph.
///
/// `next_steps` is ordered; its first entry is the successor of action and
/// delay steps. Condition and split steps carry their own targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub next_steps: Vec<StepId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Action(ActionStep),
    Condition(ConditionStep),
    Delay(DelayStep),
    Split(SplitStep),
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStep {
    /// Name of the registered action handler.
    pub action: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionStep {
    /// Name of the registered condition evaluator.
    pub condition: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub true_target: Option<StepId>,
    #[serde(default)]
    pub false_target: Option<StepId>,
}

impl ConditionStep {
    pub fn target(&self, outcome: bool) -> Option<&StepId> {
        if outcome {
            self.true_target.as_ref()
        } else {
            self.false_target.as_ref()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelayStep {
    #[serde(default)]
    pub minutes: u32,
    #[serde(default)]
    pub hours: u32,
    #[serde(default)]
    pub days: u32,
}

impl DelayStep {
    pub fn minutes(minutes: u32) -> Self {
        Self { minutes, ..Self::default() }
    }

    pub fn hours(hours: u32) -> Self {
        Self { hours, ..Self::default() }
    }

    pub fn days(days: u32) -> Self {
        Self { days, ..Self::default() }
    }

    pub fn total_minutes(&self) -> i64 {
        i64::from(self.minutes) + i64::from(self.hours) * 60 + i64::from(self.days) * 24 * 60
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.total_minutes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitStep {
    /// Share of subjects (0-100) routed to branch A.
    #[serde(default = "default_split_percentage")]
    pub percentage: u8,
    #[serde(default)]
    pub branch_a: Option<StepId>,
    #[serde(default)]
    pub branch_b: Option<StepId>,
}

fn default_split_percentage() -> u8 {
    50
}

impl SplitStep {
    pub fn target(&self, branch: SplitBranch) -> Option<&StepId> {
        match branch {
            SplitBranch::A => self.branch_a.as_ref(),
            SplitBranch::B => self.branch_b.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitBranch {
    A,
    B,
}

impl Step {
    fn new(id: &str, kind: StepKind) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            next_steps: Vec::new(),
        }
    }

    pub fn action(id: &str, action: &str, config: serde_json::Value) -> Self {
        Self::new(
            id,
            StepKind::Action(ActionStep {
                action: action.to_string(),
                config,
                retry_on_failure: false,
                max_retries: default_max_retries(),
            }),
        )
    }

    pub fn condition(
        id: &str,
        condition: &str,
        config: serde_json::Value,
        true_target: Option<&str>,
        false_target: Option<&str>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Condition(ConditionStep {
                condition: condition.to_string(),
                config,
                true_target: true_target.map(str::to_string),
                false_target: false_target.map(str::to_string),
            }),
        )
    }

    pub fn delay(id: &str, delay: DelayStep) -> Self {
        Self::new(id, StepKind::Delay(delay))
    }

    pub fn split(id: &str, percentage: u8, branch_a: Option<&str>, branch_b: Option<&str>) -> Self {
        Self::new(
            id,
            StepKind::Split(SplitStep {
                percentage,
                branch_a: branch_a.map(str::to_string),
                branch_b: branch_b.map(str::to_string),
            }),
        )
    }

    pub fn end(id: &str) -> Self {
        Self::new(id, StepKind::End)
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Append a successor.
    pub fn then(mut self, next: &str) -> Self {
        self.next_steps.push(next.to_string());
        self
    }

    /// Enable retries on an action step. No effect on other kinds.
    pub fn with_retry(mut self, max_retries: u32) -> Self {
        if let StepKind::Action(action) = &mut self.kind {
            action.retry_on_failure = true;
            action.max_retries = max_retries;
        }
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Action(_) => "action",
            StepKind::Condition(_) => "condition",
            StepKind::Delay(_) => "delay",
            StepKind::Split(_) => "split",
            StepKind::End => "end",
        }
    }

    /// Successor for linear steps (action, delay).
    pub fn successor(&self) -> Option<&StepId> {
        self.next_steps.first()
    }

    /// Every step id this node can route to.
    pub fn targets(&self) -> Vec<&StepId> {
        let mut targets: Vec<&StepId> = self.next_steps.iter().collect();
        match &self.kind {
            StepKind::Condition(c) => targets.extend(c.true_target.iter().chain(c.false_target.iter())),
            StepKind::Split(s) => targets.extend(s.branch_a.iter().chain(s.branch_b.iter())),
            _ => {}
        }
        targets
    }

    fn unlink(&mut self, step_id: &str) {
        self.next_steps.retain(|id| id != step_id);
        match &mut self.kind {
            StepKind::Condition(c) => {
                if c.true_target.as_deref() == Some(step_id) {
                    c.true_target = None;
                }
                if c.false_target.as_deref() == Some(step_id) {
                    c.false_target = None;
                }
            }
            StepKind::Split(s) => {
                if s.branch_a.as_deref() == Some(step_id) {
                    s.branch_a = None;
                }
                if s.branch_b.as_deref() == Some(step_id) {
                    s.branch_b = None;
                }
            }
            _ => {}
        }
    }
}

// ============================================
// Triggers and events
// ============================================

/// Inbound event types the trigger layer understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Lead lifecycle
    LeadCreated,
    LeadUpdated,
    LeadStatusChanged,
    LeadScoreChanged,
    LeadAssigned,
    LeadTagAdded,

    // Engagement
    FormSubmitted,
    PageVisited,
    EmailOpened,
    EmailClicked,
    EmailReplied,
    SmsReceived,
    CallCompleted,

    // Property interest
    PropertyViewed,
    PropertySaved,
    PropertyInquiry,
    ShowingScheduled,
    ShowingCompleted,

    // Time based
    Schedule,
    DateReached,
    Inactivity,

    // External
    Webhook,
    ApiCall,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadCreated => "lead_created",
            Self::LeadUpdated => "lead_updated",
            Self::LeadStatusChanged => "lead_status_changed",
            Self::LeadScoreChanged => "lead_score_changed",
            Self::LeadAssigned => "lead_assigned",
            Self::LeadTagAdded => "lead_tag_added",
            Self::FormSubmitted => "form_submitted",
            Self::PageVisited => "page_visited",
            Self::EmailOpened => "email_opened",
            Self::EmailClicked => "email_clicked",
            Self::EmailReplied => "email_replied",
            Self::SmsReceived => "sms_received",
            Self::CallCompleted => "call_completed",
            Self::PropertyViewed => "property_viewed",
            Self::PropertySaved => "property_saved",
            Self::PropertyInquiry => "property_inquiry",
            Self::ShowingScheduled => "showing_scheduled",
            Self::ShowingCompleted => "showing_completed",
            Self::Schedule => "schedule",
            Self::DateReached => "date_reached",
            Self::Inactivity => "inactivity",
            Self::Webhook => "webhook",
            Self::ApiCall => "api_call",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    System,
    Form,
    Crm,
    Messaging,
    Webhook,
    Scheduler,
    Api,
    Integration(String),
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Form => f.write_str("form"),
            Self::Crm => f.write_str("crm"),
            Self::Messaging => f.write_str("messaging"),
            Self::Webhook => f.write_str("webhook"),
            Self::Scheduler => f.write_str("scheduler"),
            Self::Api => f.write_str("api"),
            Self::Integration(name) => write!(f, "integration:{}", name),
        }
    }
}

/// An inbound fact about a subject (usually a lead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub subject_id: String,
    #[serde(default)]
    pub payload: Context,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl TriggerEvent {
    pub fn new(event_type: EventType, subject_id: &str, payload: Context, source: EventSource) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            subject_id: subject_id.to_string(),
            payload,
            source,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn lead_created(subject_id: &str, lead: serde_json::Value, source: EventSource) -> Self {
        Self::new(EventType::LeadCreated, subject_id, context_from(lead), source)
    }

    pub fn status_changed(subject_id: &str, old_status: &str, new_status: &str) -> Self {
        Self::new(
            EventType::LeadStatusChanged,
            subject_id,
            context_from(serde_json::json!({
                "old_status": old_status,
                "new_status": new_status
            })),
            EventSource::Crm,
        )
    }

    pub fn score_changed(subject_id: &str, old_score: i64, new_score: i64) -> Self {
        Self::new(
            EventType::LeadScoreChanged,
            subject_id,
            context_from(serde_json::json!({
                "old_score": old_score,
                "score": new_score
            })),
            EventSource::System,
        )
    }

    pub fn form_submitted(subject_id: &str, form_id: &str, fields: serde_json::Value) -> Self {
        let mut payload = context_from(fields);
        payload.insert("form_id".to_string(), serde_json::json!(form_id));
        Self::new(EventType::FormSubmitted, subject_id, payload, EventSource::Form)
    }

    pub fn page_visited(subject_id: &str, page_url: &str) -> Self {
        Self::new(
            EventType::PageVisited,
            subject_id,
            context_from(serde_json::json!({ "page_url": page_url })),
            EventSource::Api,
        )
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Comparison applied by a field condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

/// A predicate on one (possibly nested, dot separated) payload field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl FieldCondition {
    pub fn new(field: &str, operator: ConditionOperator, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn equals(field: &str, value: serde_json::Value) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, ConditionOperator::Contains, serde_json::json!(value))
    }

    pub fn at_least(field: &str, threshold: f64) -> Self {
        Self::new(field, ConditionOperator::GreaterThanOrEquals, serde_json::json!(threshold))
    }

    pub fn at_most(field: &str, threshold: f64) -> Self {
        Self::new(field, ConditionOperator::LessThanOrEquals, serde_json::json!(threshold))
    }

    pub fn in_list(field: &str, values: Vec<serde_json::Value>) -> Self {
        Self::new(field, ConditionOperator::In, serde_json::Value::Array(values))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PriceBand {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Structural filters evaluated after the match conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterCriteria {
    #[serde(default)]
    pub lead_type: Option<String>,
    #[serde(default)]
    pub property_type: Option<String>,
    /// Compared against the payload's `budget`.
    #[serde(default)]
    pub price_band: Option<PriceBand>,
    /// Case-insensitive allow-list for the payload's `city`.
    #[serde(default)]
    pub cities: Vec<String>,
}

impl FilterCriteria {
    pub fn is_empty(&self) -> bool {
        self.lead_type.is_none()
            && self.property_type.is_none()
            && self.price_band.is_none()
            && self.cities.is_empty()
    }
}

/// Binds an event pattern to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub id: Uuid,
    pub name: String,
    pub event_type: EventType,
    pub workflow_id: Uuid,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub match_conditions: Vec<FieldCondition>,
    #[serde(default)]
    pub filter_criteria: FilterCriteria,
    /// Minimum gap between two fires for the same subject. 0 disables the check.
    #[serde(default)]
    pub cooldown_minutes: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_fires_per_subject: u32,
    /// Registration order, assigned by the registry.
    #[serde(default)]
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fire_count: u64,
}

fn enabled_by_default() -> bool {
    true
}

impl Trigger {
    pub fn new(name: &str, event_type: EventType, workflow_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            event_type,
            workflow_id,
            enabled: true,
            match_conditions: Vec::new(),
            filter_criteria: FilterCriteria::default(),
            cooldown_minutes: 0,
            max_fires_per_subject: 0,
            sequence: 0,
            created_at: Utc::now(),
            last_fired_at: None,
            fire_count: 0,
        }
    }

    pub fn with_condition(mut self, condition: FieldCondition) -> Self {
        self.match_conditions.push(condition);
        self
    }

    pub fn with_filter(mut self, filter: FilterCriteria) -> Self {
        self.filter_criteria = filter;
        self
    }

    pub fn with_cooldown(mut self, minutes: u32) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    pub fn with_max_fires(mut self, max_fires_per_subject: u32) -> Self {
        self.max_fires_per_subject = max_fires_per_subject;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::minutes(i64::from(self.cooldown_minutes))
    }
}

/// One entry of a subject's trigger history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerFire {
    pub trigger_id: Uuid,
    pub workflow_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

// ============================================
// Executions
// ============================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened when a step ran.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded {
        #[serde(default)]
        message: String,
    },
    Branched {
        result: bool,
    },
    Split {
        branch: SplitBranch,
    },
    Suspended {
        resume_at: DateTime<Utc>,
    },
    /// The delay this record refers to has elapsed.
    Resumed,
    Failed {
        error: String,
    },
}

/// Append-only audit entry for one step transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: StepId,
    #[serde(default)]
    pub step_name: String,
    pub executed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    #[serde(default)]
    pub attempts: u32,
    /// Top-level keys merged into the execution context by this step.
    #[serde(default)]
    pub context_updates: Context,
    #[serde(default)]
    pub next_step_id: Option<StepId>,
}

impl StepRecord {
    /// The step the execution sits on after this record is applied.
    pub fn resulting_step(&self) -> Option<&StepId> {
        match self.outcome {
            StepOutcome::Suspended { .. } | StepOutcome::Failed { .. } => Some(&self.step_id),
            _ => self.next_step_id.as_ref(),
        }
    }
}

/// One run of a workflow definition for one subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Definition version this execution is pinned to.
    pub workflow_version: u32,
    pub subject_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub entry_step_id: Option<StepId>,
    #[serde(default)]
    pub current_step_id: Option<StepId>,
    #[serde(default)]
    pub initial_context: Context,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub step_history: Vec<StepRecord>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(
        definition: &WorkflowDefinition,
        subject_id: &str,
        context: Context,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: definition.id,
            workflow_version: definition.version,
            subject_id: subject_id.to_string(),
            status: ExecutionStatus::Pending,
            entry_step_id: definition.entry_step_id.clone(),
            current_step_id: definition.entry_step_id.clone(),
            initial_context: context.clone(),
            context,
            resume_at: None,
            step_history: Vec::new(),
            error: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Waiting and past its resume time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Waiting && self.resume_at.is_some_and(|at| at <= now)
    }

    /// Append a record, applying its context updates and step transition.
    pub fn record(&mut self, record: StepRecord) {
        apply_updates(&mut self.context, &record.context_updates);
        self.current_step_id = record.resulting_step().cloned();
        self.updated_at = record.executed_at;
        self.step_history.push(record);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Completed;
        self.resume_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.to_string());
        self.resume_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Cancelled;
        self.resume_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn suspend(&mut self, resume_at: DateTime<Utc>) {
        self.status = ExecutionStatus::Waiting;
        self.resume_at = Some(resume_at);
    }

    /// Rebuild the current step and context from the initial context and the
    /// step history alone.
    pub fn replay(&self) -> (Option<StepId>, Context) {
        let mut current = self.entry_step_id.clone();
        let mut context = self.initial_context.clone();

        for record in &self.step_history {
            apply_updates(&mut context, &record.context_updates);
            current = record.resulting_step().cloned();
        }

        (current, context)
    }
}

fn apply_updates(context: &mut Context, updates: &Context) {
    for (key, value) in updates {
        context.insert(key.clone(), value.clone());
    }
}

/// Execution counts for one workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowStats {
    pub workflow_id: Uuid,
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub waiting: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl WorkflowStats {
    pub fn add(&mut self, status: ExecutionStatus) {
        self.total += 1;
        match status {
            ExecutionStatus::Pending => self.pending += 1,
            ExecutionStatus::Running => self.running += 1,
            ExecutionStatus::Waiting => self.waiting += 1,
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Cancelled => self.cancelled += 1,
        }
    }
}
