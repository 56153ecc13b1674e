//! Automation engine
//!
//! Turns a matched (definition, event) pair into one execution: admission
//! through the guard, upfront variable validation, then a depth-first walk
//! of the action tree under the definition's wall-clock budget. Every
//! lifecycle transition is written to the execution store, so history
//! shows denied and timed-out runs next to completed ones.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::effects::DefinitionSource;
use crate::error::{MacroError, Result};
use crate::executor::{collect_tokens, ActionExecutor};
use crate::guard::{ExecutionGuard, GuardDecision};
use crate::store::ExecutionStore;
use crate::suspend::ResumeTable;
use crate::types::{
    ActionKind, ActionResult, ActionStatus, CancelReason, EventEnvelope, ExecutionStatus,
    MacroAction, MacroDefinition, MacroExecution, Scope,
};

/// Hard per-loop iteration cap, applied on top of any configured bound
pub const LOOP_ITERATION_CAP: u32 = 100;

/// Mutable state of one running traversal. Shared behind an Arc so the
/// partial audit trail survives when the timeout abandons the walk.
/// Locks are only held across synchronous sections, never awaits.
struct RunState {
    scope: Mutex<Scope>,
    results: Mutex<Vec<ActionResult>>,
    steps: AtomicU32,
}

impl RunState {
    fn new(scope: Scope) -> Self {
        Self {
            scope: Mutex::new(scope),
            results: Mutex::new(Vec::new()),
            steps: AtomicU32::new(0),
        }
    }

    fn next_step(&self) -> u32 {
        self.steps.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn push(&self, result: ActionResult) {
        self.results.lock().push(result);
    }
}

pub struct AutomationEngine {
    executor: ActionExecutor,
    store: Arc<dyn ExecutionStore>,
    defs: Arc<dyn DefinitionSource>,
    guard: ExecutionGuard,
    resume: Arc<ResumeTable>,
    failure_streaks: DashMap<Uuid, u32>,
}

impl AutomationEngine {
    pub fn new(
        executor: ActionExecutor,
        store: Arc<dyn ExecutionStore>,
        defs: Arc<dyn DefinitionSource>,
        guard: ExecutionGuard,
    ) -> Self {
        Self {
            executor,
            store,
            defs,
            guard,
            resume: Arc::new(ResumeTable::new()),
            failure_streaks: DashMap::new(),
        }
    }

    /// Table used to answer suspended `user_prompt` actions
    pub fn resume_table(&self) -> Arc<ResumeTable> {
        self.resume.clone()
    }

    /// Deliver a prompt response to a suspended execution
    pub fn resume(&self, execution_id: Uuid, value: Value) -> Result<()> {
        self.resume.resume(execution_id, value)
    }

    /// Run one matched definition against one event, through the full
    /// lifecycle. The returned record is terminal.
    pub async fn execute(
        &self,
        def: &MacroDefinition,
        event: EventEnvelope,
    ) -> Result<MacroExecution> {
        let mut execution = MacroExecution::pending(def.id, event);
        self.store.record(&execution).await?;
        tracing::debug!(macro_id = %def.id, execution_id = %execution.id, "execution instantiated");

        if let GuardDecision::Deny(reason) = self.guard.admit(def, &execution.event).await? {
            execution.cancel_reason = Some(reason);
            execution.error_message = Some(format!("cancelled: {}", reason.as_str()));
            return self.finish(def, execution, ExecutionStatus::Cancelled).await;
        }

        // The permit, when a limit is configured, is held until the
        // execution record is finalized.
        let _permit = match def.concurrency_limit {
            Some(limit) => {
                match self
                    .guard
                    .concurrency()
                    .acquire(def.id, limit, def.overflow_policy)
                    .await
                {
                    Some(permit) => Some(permit),
                    None => {
                        execution.cancel_reason = Some(CancelReason::ConcurrencyLimit);
                        execution.error_message =
                            Some("cancelled: CONCURRENCY_LIMIT".to_string());
                        return self.finish(def, execution, ExecutionStatus::Cancelled).await;
                    },
                }
            },
            None => None,
        };

        let scope = initial_scope(def, &execution.event);
        if let Err(err) = validate_references(def, &scope) {
            // Bad configuration fails before the run starts
            execution.error_message = Some(err.to_string());
            return self.finish(def, execution, ExecutionStatus::Failed).await;
        }

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.store.update(&execution).await?;

        let state = Arc::new(RunState::new(scope));
        let budget = Duration::from_millis(def.timeout_ms);
        let walk = self.run_actions(def, execution.id, &def.actions, String::new(), &state);

        let status = match tokio::time::timeout(budget, walk).await {
            Ok(Ok(())) => ExecutionStatus::Completed,
            Ok(Err(err)) => {
                execution.error_message = Some(err.to_string());
                ExecutionStatus::Failed
            },
            Err(_) => {
                // The walk future is dropped here; a parked prompt waiter
                // must not outlive it.
                self.resume.cancel(execution.id);
                execution.cancel_reason = Some(CancelReason::Timeout);
                execution.error_message =
                    Some(format!("execution timed out after {}ms", def.timeout_ms));
                ExecutionStatus::Cancelled
            },
        };

        execution.action_results = state.results.lock().clone();
        execution.scope = state.scope.lock().clone();
        self.finish(def, execution, status).await
    }

    /// Finalize the record: terminal status, store update, recent ring,
    /// failure-streak bookkeeping
    async fn finish(
        &self,
        def: &MacroDefinition,
        mut execution: MacroExecution,
        status: ExecutionStatus,
    ) -> Result<MacroExecution> {
        execution.status = status;
        execution.finished_at = Some(Utc::now());
        self.store.update(&execution).await?;
        self.defs.push_recent(def.id, execution.summary()).await?;

        match status {
            ExecutionStatus::Failed => self.note_failure(def).await?,
            ExecutionStatus::Completed => {
                self.failure_streaks.remove(&def.id);
            },
            _ => {},
        }

        tracing::info!(
            macro_id = %def.id,
            execution_id = %execution.id,
            status = status.as_str(),
            actions = execution.action_results.len(),
            "execution finished"
        );
        Ok(execution)
    }

    async fn note_failure(&self, def: &MacroDefinition) -> Result<()> {
        let Some(threshold) = def.disable_after_failures else {
            return Ok(());
        };
        let streak = {
            let mut entry = self.failure_streaks.entry(def.id).or_insert(0);
            *entry += 1;
            *entry
        };
        if streak >= threshold {
            tracing::warn!(macro_id = %def.id, streak, "disabling macro after consecutive failures");
            self.defs.set_enabled(def.id, false).await?;
            self.failure_streaks.remove(&def.id);
        }
        Ok(())
    }

    /// Depth-first walk of one sibling list. Boxed for async recursion.
    fn run_actions<'a>(
        &'a self,
        def: &'a MacroDefinition,
        execution_id: Uuid,
        actions: &'a [MacroAction],
        prefix: String,
        state: &'a Arc<RunState>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut ordered: Vec<&MacroAction> = actions.iter().collect();
            ordered.sort_by_key(|a| a.order);

            for (position, action) in ordered.into_iter().enumerate() {
                let path = if prefix.is_empty() {
                    format!("{}", position + 1)
                } else {
                    format!("{prefix}.{}", position + 1)
                };

                if let Some(guard) = &action.guard {
                    let holds = guard.evaluate(&state.scope.lock());
                    if !holds {
                        state.push(ActionResult {
                            path,
                            kind: action.kind.name().to_string(),
                            status: ActionStatus::Skipped,
                            output: None,
                            error: None,
                            attempts: 0,
                        });
                        continue;
                    }
                }

                if let Err(err) = self.run_node(def, execution_id, action, &path, state).await {
                    if def.continue_on_error {
                        tracing::warn!(
                            execution_id = %execution_id,
                            path = %path,
                            error = %err,
                            "action failed, continuing"
                        );
                        continue;
                    }
                    return Err(err);
                }
            }
            Ok(())
        })
    }

    async fn run_node(
        &self,
        def: &MacroDefinition,
        execution_id: Uuid,
        action: &MacroAction,
        path: &str,
        state: &Arc<RunState>,
    ) -> Result<()> {
        match &action.kind {
            ActionKind::Condition { condition, then_actions, else_actions } => {
                let holds = condition.evaluate(&state.scope.lock());
                let (branch, children) = if holds {
                    ("then", then_actions)
                } else {
                    ("else", else_actions)
                };
                self.run_actions(def, execution_id, children, format!("{path}.{branch}"), state)
                    .await?;
                // Container results follow their children, as loops do
                state.push(ActionResult {
                    path: path.to_string(),
                    kind: action.kind.name().to_string(),
                    status: ActionStatus::Completed,
                    output: Some(json!({ "branch": branch })),
                    error: None,
                    attempts: 1,
                });
                Ok(())
            },
            ActionKind::Loop { condition, max_iterations, actions } => {
                let cap = (*max_iterations).min(LOOP_ITERATION_CAP);
                let mut iterations = 0;
                while iterations < cap {
                    if let Some(condition) = condition {
                        if !condition.evaluate(&state.scope.lock()) {
                            break;
                        }
                    }
                    state
                        .scope
                        .lock()
                        .insert("loop_index".to_string(), json!(iterations));
                    self.run_actions(
                        def,
                        execution_id,
                        actions,
                        format!("{path}.{}", iterations + 1),
                        state,
                    )
                    .await?;
                    iterations += 1;
                }
                let capped = iterations == LOOP_ITERATION_CAP && *max_iterations > LOOP_ITERATION_CAP;
                if capped {
                    tracing::warn!(execution_id = %execution_id, path = %path, "loop stopped at iteration cap");
                }
                state.push(ActionResult {
                    path: path.to_string(),
                    kind: action.kind.name().to_string(),
                    status: ActionStatus::Completed,
                    output: Some(json!({ "iterations": iterations, "capped": capped })),
                    error: None,
                    attempts: 1,
                });
                Ok(())
            },
            ActionKind::Delay { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                state.push(ActionResult {
                    path: path.to_string(),
                    kind: action.kind.name().to_string(),
                    status: ActionStatus::Completed,
                    output: Some(json!({ "slept_ms": duration_ms })),
                    error: None,
                    attempts: 1,
                });
                Ok(())
            },
            ActionKind::UserPrompt { prompt, output } => {
                let receiver = self.resume.register(execution_id, def.id, prompt, output);
                tracing::debug!(execution_id = %execution_id, prompt = %prompt, "execution suspended on prompt");
                let value = receiver
                    .await
                    .map_err(|_| MacroError::Execution("prompt response never arrived".to_string()))?;
                state.scope.lock().insert(output.clone(), value.clone());
                state.push(ActionResult {
                    path: path.to_string(),
                    kind: action.kind.name().to_string(),
                    status: ActionStatus::Completed,
                    output: Some(value),
                    error: None,
                    attempts: 1,
                });
                Ok(())
            },
            leaf => {
                let scope_snapshot = state.scope.lock().clone();
                let outcome = self.executor.run_leaf(leaf, &scope_snapshot).await;
                let step = state.next_step();
                match outcome.result {
                    Ok(output) => {
                        state
                            .scope
                            .lock()
                            .insert(format!("step_{step}"), output.clone());
                        state.push(ActionResult {
                            path: path.to_string(),
                            kind: leaf.name().to_string(),
                            status: ActionStatus::Completed,
                            output: Some(output),
                            error: None,
                            attempts: outcome.attempts,
                        });
                        Ok(())
                    },
                    Err(err) => {
                        state.push(ActionResult {
                            path: path.to_string(),
                            kind: leaf.name().to_string(),
                            status: ActionStatus::Failed,
                            output: None,
                            error: Some(err.to_string()),
                            attempts: outcome.attempts,
                        });
                        Err(err)
                    },
                }
            },
        }
    }
}

/// Seed scope: event payload first, definition parameters shadow it
fn initial_scope(def: &MacroDefinition, event: &EventEnvelope) -> Scope {
    let mut scope = event.payload.clone();
    for (key, value) in &def.parameters {
        scope.insert(key.clone(), value.clone());
    }
    scope
}

/// Check every `{{name}}` reference in the action tree resolves to the
/// initial scope, a step output, a loop index or a prompt output
fn validate_references(def: &MacroDefinition, scope: &Scope) -> Result<()> {
    let rendered = serde_json::to_value(&def.actions)?;
    let mut tokens = BTreeSet::new();
    collect_tokens(&rendered, &mut tokens);

    let mut prompt_outputs = BTreeSet::new();
    collect_prompt_outputs(&def.actions, &mut prompt_outputs);

    for token in tokens {
        let root = token.split('.').next().unwrap_or(&token);
        let known = scope.contains_key(root)
            || root.starts_with("step_")
            || root == "loop_index"
            || prompt_outputs.contains(root);
        if !known {
            return Err(MacroError::Validation(format!(
                "unresolvable variable '{{{{{token}}}}}' in macro '{}'",
                def.name
            )));
        }
    }
    Ok(())
}

fn collect_prompt_outputs(actions: &[MacroAction], out: &mut BTreeSet<String>) {
    for action in actions {
        match &action.kind {
            ActionKind::UserPrompt { output, .. } => {
                out.insert(output.clone());
            },
            ActionKind::Condition { then_actions, else_actions, .. } => {
                collect_prompt_outputs(then_actions, out);
                collect_prompt_outputs(else_actions, out);
            },
            ActionKind::Loop { actions, .. } => collect_prompt_outputs(actions, out),
            _ => {},
        }
    }
}
