//! Execution history store
//!
//! Every instantiated execution is recorded before it runs and updated at
//! every status change, so the history shows cancelled and failed runs the
//! same as completed ones. SQLite persistence lives in `repository`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{MacroError, Result};
use crate::types::{ExecutionStatus, MacroExecution};

/// Filter for history queries
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub status: Option<ExecutionStatus>,
    pub since: Option<DateTime<Utc>>,
    /// Maximum records returned, newest first. 0 means no limit.
    pub limit: usize,
}

impl HistoryFilter {
    pub fn latest(limit: usize) -> Self {
        Self { limit, ..Self::default() }
    }

    fn matches(&self, exec: &MacroExecution) -> bool {
        if let Some(status) = self.status {
            if exec.status != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if exec.event.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Persistence boundary for execution records
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new execution record
    async fn record(&self, execution: &MacroExecution) -> Result<()>;

    /// Overwrite an existing record with its current state
    async fn update(&self, execution: &MacroExecution) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<MacroExecution>;

    /// Executions of one macro, newest first
    async fn history(&self, macro_id: Uuid, filter: &HistoryFilter)
        -> Result<Vec<MacroExecution>>;
}

/// In-memory store, insertion ordered
#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: parking_lot::Mutex<Vec<MacroExecution>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.lock().is_empty()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn record(&self, execution: &MacroExecution) -> Result<()> {
        self.executions.lock().push(execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &MacroExecution) -> Result<()> {
        let mut executions = self.executions.lock();
        let slot = executions
            .iter_mut()
            .find(|e| e.id == execution.id)
            .ok_or_else(|| MacroError::NotFound(format!("execution {}", execution.id)))?;
        *slot = execution.clone();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<MacroExecution> {
        self.executions
            .lock()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| MacroError::NotFound(format!("execution {id}")))
    }

    async fn history(
        &self,
        macro_id: Uuid,
        filter: &HistoryFilter,
    ) -> Result<Vec<MacroExecution>> {
        let executions = self.executions.lock();
        let mut matched: Vec<MacroExecution> = executions
            .iter()
            .rev()
            .filter(|e| e.macro_id == macro_id && filter.matches(e))
            .cloned()
            .collect();
        if filter.limit > 0 {
            matched.truncate(filter.limit);
        }
        Ok(matched)
    }
}
