//! Suspension and resume
//!
//! `user_prompt` actions park their execution here. The traversal task
//! stays alive awaiting a oneshot; an external resume call delivers the
//! response value and the traversal continues in place, no engine-wide
//! state machine.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{MacroError, Result};

/// An execution waiting on a prompt response
#[derive(Debug, Clone, Serialize)]
pub struct PendingPrompt {
    pub execution_id: Uuid,
    pub macro_id: Uuid,
    pub prompt: String,
    /// Scope variable the response is written to
    pub output: String,
    pub asked_at: DateTime<Utc>,
}

struct Waiter {
    info: PendingPrompt,
    sender: oneshot::Sender<Value>,
}

/// Registry of suspended executions, keyed by execution id
#[derive(Default)]
pub struct ResumeTable {
    waiting: DashMap<Uuid, Waiter>,
}

impl ResumeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an execution. The returned receiver resolves when `resume`
    /// is called with the same execution id.
    pub fn register(
        &self,
        execution_id: Uuid,
        macro_id: Uuid,
        prompt: &str,
        output: &str,
    ) -> oneshot::Receiver<Value> {
        let (sender, receiver) = oneshot::channel();
        self.waiting.insert(
            execution_id,
            Waiter {
                info: PendingPrompt {
                    execution_id,
                    macro_id,
                    prompt: prompt.to_string(),
                    output: output.to_string(),
                    asked_at: Utc::now(),
                },
                sender,
            },
        );
        receiver
    }

    /// Deliver a response to a suspended execution
    pub fn resume(&self, execution_id: Uuid, value: Value) -> Result<()> {
        let (_, waiter) = self
            .waiting
            .remove(&execution_id)
            .ok_or_else(|| MacroError::NotSuspended(execution_id.to_string()))?;
        // Receiver gone means the execution already timed out
        waiter
            .sender
            .send(value)
            .map_err(|_| MacroError::NotSuspended(execution_id.to_string()))
    }

    /// Drop the waiter without delivering a value, e.g. when the
    /// execution's time budget expires
    pub fn cancel(&self, execution_id: Uuid) {
        self.waiting.remove(&execution_id);
    }

    pub fn pending(&self) -> Vec<PendingPrompt> {
        self.waiting.iter().map(|w| w.info.clone()).collect()
    }

    pub fn is_suspended(&self, execution_id: Uuid) -> bool {
        self.waiting.contains_key(&execution_id)
    }
}
