//! Outbound effect boundaries
//!
//! Traits at the edge of the engine: work-item mutations, notification
//! egress, macro definition lookup and permission resolution. Production
//! wires HTTP-backed implementations; tests and embedded use wire the
//! memory implementations below.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{MacroError, Result};
use crate::types::{
    ExecutionSummary, MacroDefinition, MacroPermissions, Scope, RECENT_EXECUTIONS_LIMIT,
};

/// Mutations applied to work items in the tracking system
#[async_trait]
pub trait WorkItemEffects: Send + Sync {
    async fn mutate(&self, item: &str, changes: &Scope) -> Result<Value>;

    async fn transition(&self, item: &str, target_state: &str) -> Result<Value>;

    async fn add_comment(&self, item: &str, text: &str) -> Result<Value>;

    async fn add_relationship(&self, item: &str, other: &str, relationship: &str)
        -> Result<Value>;
}

/// Outbound notifications and webhooks
#[async_trait]
pub trait NotificationEgress: Send + Sync {
    async fn send(&self, channel: &str, message: &str) -> Result<Value>;

    async fn call_webhook(
        &self,
        url: &str,
        payload: &Value,
        auth_header: Option<&str>,
    ) -> Result<Value>;
}

/// Source of macro definitions
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// All enabled definitions, unordered
    async fn list_enabled(&self) -> Result<Vec<MacroDefinition>>;

    async fn get(&self, id: Uuid) -> Result<MacroDefinition>;

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()>;

    /// Prepend a summary to the definition's recent-execution ring
    async fn push_recent(&self, id: Uuid, summary: ExecutionSummary) -> Result<()>;
}

/// Resolves what a user may do with a macro
#[async_trait]
pub trait PermissionSource: Send + Sync {
    async fn resolve(&self, user: &str, macro_id: Uuid) -> Result<MacroPermissions>;
}

/// In-memory definition store
#[derive(Default)]
pub struct MemoryDefinitions {
    defs: DashMap<Uuid, MacroDefinition>,
}

impl MemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, def: MacroDefinition) {
        self.defs.insert(def.id, def);
    }

    pub fn remove(&self, id: Uuid) -> Option<MacroDefinition> {
        self.defs.remove(&id).map(|(_, def)| def)
    }
}

#[async_trait]
impl DefinitionSource for MemoryDefinitions {
    async fn list_enabled(&self) -> Result<Vec<MacroDefinition>> {
        Ok(self
            .defs
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<MacroDefinition> {
        self.defs
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or_else(|| MacroError::NotFound(format!("macro {id}")))
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let mut entry = self
            .defs
            .get_mut(&id)
            .ok_or_else(|| MacroError::NotFound(format!("macro {id}")))?;
        entry.enabled = enabled;
        Ok(())
    }

    async fn push_recent(&self, id: Uuid, summary: ExecutionSummary) -> Result<()> {
        let mut entry = self
            .defs
            .get_mut(&id)
            .ok_or_else(|| MacroError::NotFound(format!("macro {id}")))?;
        entry.recent_executions.insert(0, summary);
        entry.recent_executions.truncate(RECENT_EXECUTIONS_LIMIT);
        Ok(())
    }
}

/// Permission source that grants everything
pub struct AllowAllPermissions;

#[async_trait]
impl PermissionSource for AllowAllPermissions {
    async fn resolve(&self, _user: &str, _macro_id: Uuid) -> Result<MacroPermissions> {
        Ok(MacroPermissions::all())
    }
}

/// Permission source backed by the definition owner: only the owner may
/// execute or edit, everyone may view.
pub struct OwnerPermissions {
    defs: Arc<dyn DefinitionSource>,
}

impl OwnerPermissions {
    pub fn new(defs: Arc<dyn DefinitionSource>) -> Self {
        Self { defs }
    }
}

#[async_trait]
impl PermissionSource for OwnerPermissions {
    async fn resolve(&self, user: &str, macro_id: Uuid) -> Result<MacroPermissions> {
        let def = self.defs.get(macro_id).await?;
        let is_owner = def.owner == user;
        Ok(MacroPermissions {
            owner: is_owner,
            can_execute: is_owner,
            can_edit: is_owner,
            can_view: true,
            elevated: false,
        })
    }
}

/// A single recorded work-item effect, for assertions in tests
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEffect {
    Mutate { item: String, changes: Scope },
    Transition { item: String, target_state: String },
    Comment { item: String, text: String },
    Relationship { item: String, other: String, relationship: String },
    Notification { channel: String, message: String },
    Webhook { url: String, payload: Value },
}

/// Recording implementation of both effect traits. Webhook calls can be
/// made to fail a configured number of times to exercise retry paths.
#[derive(Default)]
pub struct MemoryEffects {
    recorded: parking_lot::Mutex<Vec<RecordedEffect>>,
    webhook_failures: std::sync::atomic::AtomicU32,
}

impl MemoryEffects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` webhook calls fail
    pub fn fail_next_webhooks(&self, n: u32) {
        self.webhook_failures
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<RecordedEffect> {
        self.recorded.lock().clone()
    }

    fn record(&self, effect: RecordedEffect) {
        self.recorded.lock().push(effect);
    }
}

#[async_trait]
impl WorkItemEffects for MemoryEffects {
    async fn mutate(&self, item: &str, changes: &Scope) -> Result<Value> {
        self.record(RecordedEffect::Mutate {
            item: item.to_string(),
            changes: changes.clone(),
        });
        Ok(json!({"item": item, "updated": changes.len()}))
    }

    async fn transition(&self, item: &str, target_state: &str) -> Result<Value> {
        self.record(RecordedEffect::Transition {
            item: item.to_string(),
            target_state: target_state.to_string(),
        });
        Ok(json!({"item": item, "state": target_state}))
    }

    async fn add_comment(&self, item: &str, text: &str) -> Result<Value> {
        self.record(RecordedEffect::Comment {
            item: item.to_string(),
            text: text.to_string(),
        });
        Ok(json!({"item": item}))
    }

    async fn add_relationship(
        &self,
        item: &str,
        other: &str,
        relationship: &str,
    ) -> Result<Value> {
        self.record(RecordedEffect::Relationship {
            item: item.to_string(),
            other: other.to_string(),
            relationship: relationship.to_string(),
        });
        Ok(json!({"item": item, "other": other}))
    }
}

#[async_trait]
impl NotificationEgress for MemoryEffects {
    async fn send(&self, channel: &str, message: &str) -> Result<Value> {
        self.record(RecordedEffect::Notification {
            channel: channel.to_string(),
            message: message.to_string(),
        });
        Ok(json!({"channel": channel, "delivered": true}))
    }

    async fn call_webhook(
        &self,
        url: &str,
        payload: &Value,
        _auth_header: Option<&str>,
    ) -> Result<Value> {
        use std::sync::atomic::Ordering;
        let remaining = self.webhook_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.webhook_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(MacroError::Action(format!("webhook {url} returned 503")));
        }
        self.record(RecordedEffect::Webhook {
            url: url.to_string(),
            payload: payload.clone(),
        });
        Ok(json!({"status": 200}))
    }
}
