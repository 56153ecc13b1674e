//! Core automation type definitions
//!
//! Data model for macro automation:
//! - MacroDefinition: trigger + action tree + execution policy
//! - MacroTrigger / TriggerKind: what causes a macro to be considered
//! - MacroAction / ActionKind: effect leaves and flow-control containers
//! - MacroExecution / ActionResult: one run and its per-action audit trail
//! - EventEnvelope: normalized representation of any inbound occurrence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::condition::ConditionExpr;

/// Variable scope for one execution: event payload + parameters + step outputs.
/// Later writes shadow earlier ones.
pub type Scope = serde_json::Map<String, Value>;

/// Number of execution summaries kept on a definition for fast inspection
pub const RECENT_EXECUTIONS_LIMIT: usize = 10;

// ============================================================================
// Events
// ============================================================================

/// Normalized event envelope, the common currency of router and matcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier
    pub id: Uuid,

    /// Event kind
    pub kind: EventKind,

    /// Where the event came from
    pub origin: EventOrigin,

    /// Kind-specific payload fields (item id, field name, states, ...)
    #[serde(default)]
    pub payload: serde_json::Map<String, Value>,

    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Build an envelope with a fresh id and the current timestamp
    pub fn new(kind: EventKind, origin: EventOrigin, payload: serde_json::Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            origin,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Kinds of inbound occurrences the engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Manual,
    Scheduled,
    ItemCreated,
    ItemUpdated,
    ItemTransitioned,
    FieldChanged,
    CommentAdded,
    SystemStartup,
    UserLogin,
    IntegrationEvent,
}

/// Origin of an event, also the rate-limiter bucket key component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventOrigin {
    /// A user-initiated action (manual trigger, item edit)
    User { name: String },
    /// Emitted by the scheduler
    Scheduler,
    /// Posted by an external caller through the webhook ingress
    Webhook { source: String },
    /// Internal system occurrence (startup, maintenance)
    System,
}

impl EventOrigin {
    /// Bucket key for rate limiting
    pub fn key(&self) -> String {
        match self {
            EventOrigin::User { name } => format!("user:{name}"),
            EventOrigin::Scheduler => "scheduler".to_string(),
            EventOrigin::Webhook { source } => format!("webhook:{source}"),
            EventOrigin::System => "system".to_string(),
        }
    }

    /// The acting user, if this origin carries one
    pub fn user(&self) -> Option<&str> {
        match self {
            EventOrigin::User { name } => Some(name),
            _ => None,
        }
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// Trigger kind with kind-specific configuration.
/// Composite groups evaluate children recursively; a group with zero
/// children matches nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Scheduled,
    ItemCreated,
    ItemUpdated,
    ItemTransitioned {
        #[serde(skip_serializing_if = "Option::is_none")]
        from_state: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to_state: Option<String>,
    },
    FieldChanged {
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    CommentAdded,
    SystemStartup,
    UserLogin,
    IntegrationEvent {
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// All sub-triggers must match
    AllOf { triggers: Vec<TriggerKind> },
    /// At least one sub-trigger must match
    AnyOf { triggers: Vec<TriggerKind> },
}

/// Trigger: a kind plus an optional condition over the event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroTrigger {
    #[serde(flatten)]
    pub kind: TriggerKind,

    /// Optional predicate over the event payload, evaluated after the
    /// kind matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpr>,
}

impl MacroTrigger {
    pub fn new(kind: TriggerKind) -> Self {
        Self { kind, condition: None }
    }

    pub fn with_condition(kind: TriggerKind, condition: ConditionExpr) -> Self {
        Self { kind, condition: Some(condition) }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Action kind: effect leaves dispatched through the handler registry,
/// flow-control containers traversed by the engine itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Apply field changes to a work item
    MutateItem {
        item: String,
        changes: serde_json::Map<String, Value>,
    },
    /// Move a work item to a target state
    TransitionItem { item: String, target_state: String },
    /// Add a comment to a work item
    AddComment { item: String, text: String },
    /// Link two work items
    AddRelationship {
        item: String,
        other: String,
        relationship: String,
    },
    /// Send a notification on a channel
    SendNotification { channel: String, message: String },
    /// Call an external webhook
    CallWebhook {
        url: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_header: Option<String>,
    },
    /// Evaluate a predicate and run exactly one of two child subtrees
    Condition {
        condition: ConditionExpr,
        #[serde(default)]
        then_actions: Vec<MacroAction>,
        #[serde(default)]
        else_actions: Vec<MacroAction>,
    },
    /// Re-run a child subtree while a predicate holds or for a bounded count.
    /// The engine enforces a hard iteration maximum on top of this bound.
    Loop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<ConditionExpr>,
        max_iterations: u32,
        actions: Vec<MacroAction>,
    },
    /// Suspend only this execution's traversal for a duration
    Delay { duration_ms: u64 },
    /// Suspend until an external resume call supplies a response,
    /// written into scope under `output`
    UserPrompt { prompt: String, output: String },
}

impl ActionKind {
    /// Registry tag for this kind
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::MutateItem { .. } => "mutate_item",
            ActionKind::TransitionItem { .. } => "transition_item",
            ActionKind::AddComment { .. } => "add_comment",
            ActionKind::AddRelationship { .. } => "add_relationship",
            ActionKind::SendNotification { .. } => "send_notification",
            ActionKind::CallWebhook { .. } => "call_webhook",
            ActionKind::Condition { .. } => "condition",
            ActionKind::Loop { .. } => "loop",
            ActionKind::Delay { .. } => "delay",
            ActionKind::UserPrompt { .. } => "user_prompt",
        }
    }

    /// True for effect leaves resolved through the handler registry
    pub fn is_leaf(&self) -> bool {
        !matches!(
            self,
            ActionKind::Condition { .. }
                | ActionKind::Loop { .. }
                | ActionKind::Delay { .. }
                | ActionKind::UserPrompt { .. }
        )
    }
}

/// One node of the action tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroAction {
    #[serde(flatten)]
    pub kind: ActionKind,

    /// Execution order among siblings (ascending)
    #[serde(default)]
    pub order: u32,

    /// Optional guard; when false the node and its subtree are skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<ConditionExpr>,
}

impl MacroAction {
    pub fn new(kind: ActionKind) -> Self {
        Self { kind, order: 0, guard: None }
    }
}

// ============================================================================
// Schedules
// ============================================================================

/// Recurrence rule for time-based triggers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    /// Execute once at a specific instant
    OneShot { at: DateTime<Utc> },
    /// Execute at a fixed interval
    Interval { every_ms: u64 },
    /// Execute every day at a time of day
    Daily { hour: u32, minute: u32 },
    /// Execute on specific days of the week (1 = Monday .. 7 = Sunday)
    Weekly { days: Vec<u32>, hour: u32, minute: u32 },
    /// Execute on specific days of the month (1..=31)
    Monthly { days: Vec<u32>, hour: u32, minute: u32 },
}

/// Schedule for time-based macro execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSchedule {
    pub recurrence: Recurrence,

    /// Time zone as a fixed offset from UTC, for calendar-style rules
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// No occurrences after this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,

    /// Total execution cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions: Option<u32>,
}

// ============================================================================
// Definitions
// ============================================================================

/// Per-macro rate limit override for the (macro, origin) token bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Bucket capacity (burst size)
    pub capacity: u32,
    /// Tokens restored per second
    pub refill_per_sec: f64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self { capacity: 10, refill_per_sec: 1.0 }
    }
}

/// What happens when a macro's concurrency limit is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for a running execution to finish
    #[default]
    Queue,
    /// Record a cancelled execution immediately
    Reject,
}

/// User-defined automation rule: one trigger plus an ordered action tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroDefinition {
    /// Unique identifier
    pub id: Uuid,

    /// Display name
    pub name: String,

    /// Owning user
    pub owner: String,

    /// Whether the macro is eligible for matching
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Matching priority (higher = instantiated earlier)
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// What fires this macro
    pub trigger: MacroTrigger,

    /// Ordered, branching action tree
    pub actions: Vec<MacroAction>,

    /// Named values seeded into every execution's scope
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,

    /// Optional time-based schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<MacroSchedule>,

    /// Keep executing remaining actions after a leaf failure
    #[serde(default)]
    pub continue_on_error: bool,

    /// Cap on simultaneously running executions of this macro
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u32>,

    /// Behavior when the concurrency limit is reached
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Wall-clock budget per execution in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Per-macro rate limit override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,

    /// Auto-disable after this many consecutive failed executions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_after_failures: Option<u32>,

    /// Creation instant, the matching tie-breaker
    pub created_at: DateTime<Utc>,

    /// Bounded ring of recent execution summaries, newest first.
    /// Written back by the engine, read-only for everyone else.
    #[serde(default)]
    pub recent_executions: Vec<ExecutionSummary>,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i32 {
    100
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl MacroDefinition {
    /// Minimal definition with engine defaults
    pub fn new(name: impl Into<String>, owner: impl Into<String>, trigger: MacroTrigger, actions: Vec<MacroAction>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner: owner.into(),
            enabled: true,
            priority: default_priority(),
            trigger,
            actions,
            parameters: serde_json::Map::new(),
            schedule: None,
            continue_on_error: false,
            concurrency_limit: None,
            overflow_policy: OverflowPolicy::default(),
            timeout_ms: default_timeout_ms(),
            rate_limit: None,
            disable_after_failures: None,
            created_at: Utc::now(),
            recent_executions: Vec::new(),
        }
    }
}

// ============================================================================
// Executions
// ============================================================================

/// Execution lifecycle: PENDING -> RUNNING -> {COMPLETED | FAILED | CANCELLED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Why an execution ended CANCELLED; every non-completed terminal state
/// carries a reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelReason {
    RateLimited,
    PermissionDenied,
    ConcurrencyLimit,
    Timeout,
    External,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::RateLimited => "RATE_LIMITED",
            CancelReason::PermissionDenied => "PERMISSION_DENIED",
            CancelReason::ConcurrencyLimit => "CONCURRENCY_LIMIT",
            CancelReason::Timeout => "TIMEOUT",
            CancelReason::External => "EXTERNAL",
        }
    }
}

/// Per-action outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Completed,
    Failed,
    Skipped,
}

/// Record of one action node in traversal order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Tree position, e.g. "2" or "2.then.1"
    pub path: String,

    /// Action kind tag
    pub kind: String,

    pub status: ActionStatus,

    /// Handler output, also written into scope as `step_N`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Attempts made, > 1 only for retryable leaves
    pub attempts: u32,
}

/// One run of one macro in response to one matched event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroExecution {
    pub id: Uuid,
    pub macro_id: Uuid,

    /// The triggering event envelope
    pub event: EventEnvelope,

    pub status: ExecutionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Per-action results in traversal order
    #[serde(default)]
    pub action_results: Vec<ActionResult>,

    /// Variable scope snapshot at termination
    #[serde(default)]
    pub scope: Scope,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Set iff status is CANCELLED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
}

impl MacroExecution {
    /// A fresh PENDING execution for a matched (macro, event) pair
    pub fn pending(macro_id: Uuid, event: EventEnvelope) -> Self {
        Self {
            id: Uuid::new_v4(),
            macro_id,
            event,
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            action_results: Vec::new(),
            scope: Scope::new(),
            error_message: None,
            cancel_reason: None,
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id,
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_message: self.error_message.clone(),
        }
    }
}

/// Compact execution record kept on the definition's recent ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Permissions a user holds on a macro
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MacroPermissions {
    pub owner: bool,
    pub can_execute: bool,
    pub can_edit: bool,
    pub can_view: bool,
    pub elevated: bool,
}

impl MacroPermissions {
    pub fn all() -> Self {
        Self { owner: true, can_execute: true, can_edit: true, can_view: true, elevated: true }
    }

    /// Whether the holder may fire this macro
    pub fn allows_execute(&self) -> bool {
        self.owner || self.can_execute || self.elevated
    }
}
