//! Macro Engine - Work-Item Automation Library
//!
//! An event-driven automation engine for work-item tracking systems:
//! - Event routing from user actions, schedules, webhooks and system hooks
//! - Trigger matching with predicate trees over event payloads
//! - Action-tree execution with branching, loops, delays and prompts
//! - Closed handler registry with retry for outbound effects
//! - Persisted scheduling with catch-up-once recovery
//! - Execution history, permissions and token-bucket rate limits
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │ EventRouter │────▶│ RuleMatcher  │────▶│   Engine    │
//! │  (intake)   │     │  (triggers)  │     │ (traversal) │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!        ▲                                        │
//!        │                                        ▼
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  Scheduler  │     │    Guard     │◀───▶│  Executor   │
//! │ (next-run)  │     │ (rate/perm)  │     │ (handlers)  │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!        │                                        │
//!        └──────────────▶ SQLite ◀────────────────┘
//! ```

pub mod condition;
pub mod effects;
pub mod engine;
pub mod error;
pub mod executor;
pub mod guard;
pub mod matcher;
pub mod repository;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod suspend;
pub mod types;

// Re-export public API
pub use condition::{CompareOp, ConditionExpr, ConditionGroup, FieldCondition, LogicOp};
pub use effects::{
    AllowAllPermissions, DefinitionSource, MemoryDefinitions, MemoryEffects,
    NotificationEgress, OwnerPermissions, PermissionSource, RecordedEffect, WorkItemEffects,
};
pub use engine::{AutomationEngine, LOOP_ITERATION_CAP};
pub use error::{MacroError, Result};
pub use executor::{ActionExecutor, ActionHandler, RetryPolicy};
pub use guard::{ExecutionGuard, GuardDecision, RateLimiter};
pub use matcher::RuleMatcher;
pub use repository::{connect, init_schema, SqliteExecutionStore, SqliteScheduleStore};
pub use router::{EventPublisher, EventRouter};
pub use scheduler::{MacroScheduler, MemoryScheduleStore, ScheduleState, ScheduleStore};
pub use store::{ExecutionStore, HistoryFilter, MemoryExecutionStore};
pub use suspend::{PendingPrompt, ResumeTable};

// Re-export core types for convenience
pub use types::{
    ActionKind, ActionResult, ActionStatus, CancelReason, EventEnvelope, EventKind,
    EventOrigin, ExecutionStatus, ExecutionSummary, MacroAction, MacroDefinition,
    MacroExecution, MacroPermissions, MacroSchedule, MacroTrigger, OverflowPolicy,
    RateLimit, Recurrence, Scope, TriggerKind,
};
