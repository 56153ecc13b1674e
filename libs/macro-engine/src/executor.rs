//! Action executor
//!
//! Dispatches effect leaves through a closed handler registry. Each leaf's
//! configuration is the serialized action with `{{variable}}` references
//! resolved against the execution scope before the handler sees it.
//! Retryable handlers get exponential backoff; everything else fails on
//! the first error.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::condition::lookup_path;
use crate::effects::{NotificationEgress, WorkItemEffects};
use crate::error::{MacroError, Result};
use crate::types::{ActionKind, Scope};

/// Retry behavior for retryable handlers
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 100, max_delay_ms: 2_000 }
    }
}

impl RetryPolicy {
    /// Backoff before the given attempt (2nd attempt = base, then doubling)
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(2));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// One registered effect handler
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Registry tag, must equal the corresponding `ActionKind` tag
    fn kind(&self) -> &'static str;

    /// Whether transient failures should be retried
    fn retryable(&self) -> bool {
        false
    }

    /// Apply the effect. `config` is the substituted action object.
    async fn apply(&self, config: &Scope) -> Result<Value>;
}

/// Outcome of one leaf dispatch, with the attempt count for the audit trail
pub struct LeafOutcome {
    pub result: Result<Value>,
    pub attempts: u32,
}

/// Closed registry of effect handlers
pub struct ActionExecutor {
    handlers: HashMap<&'static str, Arc<dyn ActionHandler>>,
    retry: RetryPolicy,
}

impl ActionExecutor {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { handlers: HashMap::new(), retry }
    }

    /// Registry with the standard work-item and egress handlers
    pub fn standard(
        work_items: Arc<dyn WorkItemEffects>,
        egress: Arc<dyn NotificationEgress>,
    ) -> Self {
        let mut executor = Self::new(RetryPolicy::default());
        executor.register(Arc::new(MutateItemHandler { work_items: work_items.clone() }));
        executor.register(Arc::new(TransitionItemHandler { work_items: work_items.clone() }));
        executor.register(Arc::new(AddCommentHandler { work_items: work_items.clone() }));
        executor.register(Arc::new(AddRelationshipHandler { work_items }));
        executor.register(Arc::new(SendNotificationHandler { egress: egress.clone() }));
        executor.register(Arc::new(CallWebhookHandler { egress }));
        executor
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Dispatch one effect leaf against the current scope
    pub async fn run_leaf(&self, kind: &ActionKind, scope: &Scope) -> LeafOutcome {
        let Some(handler) = self.handlers.get(kind.name()) else {
            return LeafOutcome {
                result: Err(MacroError::Validation(format!(
                    "no handler registered for action '{}'",
                    kind.name()
                ))),
                attempts: 0,
            };
        };

        let config = match render_config(kind, scope) {
            Ok(config) => config,
            Err(err) => return LeafOutcome { result: Err(err), attempts: 0 },
        };

        let max_attempts = if handler.retryable() { self.retry.max_attempts } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match handler.apply(&config).await {
                Ok(output) => {
                    return LeafOutcome { result: Ok(output), attempts: attempt };
                },
                Err(err) if attempt < max_attempts => {
                    let delay = self.retry.delay(attempt + 1);
                    tracing::warn!(
                        action = kind.name(),
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "action failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(err) => {
                    return LeafOutcome { result: Err(err), attempts: attempt };
                },
            }
        }
    }
}

/// Serialize the action and resolve its variable references
fn render_config(kind: &ActionKind, scope: &Scope) -> Result<Scope> {
    let raw = serde_json::to_value(kind)?;
    let substituted = substitute(&raw, scope)?;
    match substituted {
        Value::Object(map) => Ok(map),
        other => Err(MacroError::Validation(format!(
            "action config must be an object, got {other}"
        ))),
    }
}

/// Resolve `{{name}}` references in a JSON value against the scope.
/// A string that is exactly one reference keeps the referenced value's
/// type; embedded references are stringified in place.
pub fn substitute(value: &Value, scope: &Scope) -> Result<Value> {
    match value {
        Value::String(s) => substitute_string(s, scope),
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(|v| substitute(v, scope)).collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                out.insert(key.clone(), substitute(v, scope)?);
            }
            Ok(Value::Object(out))
        },
        other => Ok(other.clone()),
    }
}

fn substitute_string(s: &str, scope: &Scope) -> Result<Value> {
    if let Some(name) = whole_token(s) {
        return resolve(name, scope).cloned();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unterminated braces pass through literally
            out.push_str(rest);
            rest = "";
            break;
        };
        out.push_str(&rest[..start]);
        let name = after[..end].trim();
        let resolved = resolve(name, scope)?;
        match resolved {
            Value::String(inner) => out.push_str(inner),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn resolve<'a>(name: &str, scope: &'a Scope) -> Result<&'a Value> {
    lookup_path(scope, name)
        .ok_or_else(|| MacroError::Validation(format!("unresolved variable '{{{{{name}}}}}'")))
}

/// The string between braces if the whole string is one reference
fn whole_token(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    let inner = inner.trim();
    // Reject "{{a}} and {{b}}"
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

/// All `{{name}}` references appearing anywhere in a JSON value
pub fn collect_tokens(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("{{") {
                let after = &rest[start + 2..];
                let Some(end) = after.find("}}") else { break };
                out.insert(after[..end].trim().to_string());
                rest = &after[end + 2..];
            }
        },
        Value::Array(items) => {
            for v in items {
                collect_tokens(v, out);
            }
        },
        Value::Object(map) => {
            for v in map.values() {
                collect_tokens(v, out);
            }
        },
        _ => {},
    }
}

fn str_field<'a>(config: &'a Scope, name: &str) -> Result<&'a str> {
    config
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| MacroError::Validation(format!("missing string field '{name}'")))
}

struct MutateItemHandler {
    work_items: Arc<dyn WorkItemEffects>,
}

#[async_trait]
impl ActionHandler for MutateItemHandler {
    fn kind(&self) -> &'static str {
        "mutate_item"
    }

    async fn apply(&self, config: &Scope) -> Result<Value> {
        let item = str_field(config, "item")?;
        let changes = config
            .get("changes")
            .and_then(Value::as_object)
            .ok_or_else(|| MacroError::Validation("missing object field 'changes'".to_string()))?;
        self.work_items.mutate(item, changes).await
    }
}

struct TransitionItemHandler {
    work_items: Arc<dyn WorkItemEffects>,
}

#[async_trait]
impl ActionHandler for TransitionItemHandler {
    fn kind(&self) -> &'static str {
        "transition_item"
    }

    async fn apply(&self, config: &Scope) -> Result<Value> {
        let item = str_field(config, "item")?;
        let target_state = str_field(config, "target_state")?;
        self.work_items.transition(item, target_state).await
    }
}

struct AddCommentHandler {
    work_items: Arc<dyn WorkItemEffects>,
}

#[async_trait]
impl ActionHandler for AddCommentHandler {
    fn kind(&self) -> &'static str {
        "add_comment"
    }

    async fn apply(&self, config: &Scope) -> Result<Value> {
        let item = str_field(config, "item")?;
        let text = str_field(config, "text")?;
        self.work_items.add_comment(item, text).await
    }
}

struct AddRelationshipHandler {
    work_items: Arc<dyn WorkItemEffects>,
}

#[async_trait]
impl ActionHandler for AddRelationshipHandler {
    fn kind(&self) -> &'static str {
        "add_relationship"
    }

    async fn apply(&self, config: &Scope) -> Result<Value> {
        let item = str_field(config, "item")?;
        let other = str_field(config, "other")?;
        let relationship = str_field(config, "relationship")?;
        self.work_items.add_relationship(item, other, relationship).await
    }
}

struct SendNotificationHandler {
    egress: Arc<dyn NotificationEgress>,
}

#[async_trait]
impl ActionHandler for SendNotificationHandler {
    fn kind(&self) -> &'static str {
        "send_notification"
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn apply(&self, config: &Scope) -> Result<Value> {
        let channel = str_field(config, "channel")?;
        let message = str_field(config, "message")?;
        self.egress.send(channel, message).await
    }
}

struct CallWebhookHandler {
    egress: Arc<dyn NotificationEgress>,
}

#[async_trait]
impl ActionHandler for CallWebhookHandler {
    fn kind(&self) -> &'static str {
        "call_webhook"
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn apply(&self, config: &Scope) -> Result<Value> {
        let url = str_field(config, "url")?;
        let payload = config.get("payload").cloned().unwrap_or(Value::Null);
        let auth_header = config.get("auth_header").and_then(Value::as_str);
        self.egress.call_webhook(url, &payload, auth_header).await
    }
}
