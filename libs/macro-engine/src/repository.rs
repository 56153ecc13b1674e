//! SQLite persistence
//!
//! `SqliteExecutionStore` and `SqliteScheduleStore` back the two
//! persistence boundaries with one shared pool. Composite payloads
//! (event, results, scope, schedule) are stored as JSON text; status
//! columns keep their wire spelling so history is queryable by hand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{MacroError, Result};
use crate::scheduler::{ScheduleState, ScheduleStore};
use crate::store::{ExecutionStore, HistoryFilter};
use crate::types::{CancelReason, ExecutionStatus, MacroExecution};

/// Open (or create) the database and bootstrap the schema
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            macro_id TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            event_json TEXT NOT NULL,
            results_json TEXT NOT NULL,
            scope_json TEXT NOT NULL,
            error_message TEXT,
            cancel_reason TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_executions_macro ON executions (macro_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schedule_state (
            macro_id TEXT PRIMARY KEY,
            schedule_json TEXT NOT NULL,
            next_run_at TEXT NOT NULL,
            execution_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn record(&self, execution: &MacroExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, macro_id, status, started_at, finished_at,
                 event_json, results_json, scope_json, error_message, cancel_reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.macro_id.to_string())
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(serde_json::to_string(&execution.event)?)
        .bind(serde_json::to_string(&execution.action_results)?)
        .bind(serde_json::to_string(&execution.scope)?)
        .bind(&execution.error_message)
        .bind(execution.cancel_reason.map(CancelReason::as_str))
        .bind(execution.event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, execution: &MacroExecution) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE executions SET
                status = ?, started_at = ?, finished_at = ?,
                results_json = ?, scope_json = ?, error_message = ?, cancel_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(serde_json::to_string(&execution.action_results)?)
        .bind(serde_json::to_string(&execution.scope)?)
        .bind(&execution.error_message)
        .bind(execution.cancel_reason.map(CancelReason::as_str))
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MacroError::NotFound(format!("execution {}", execution.id)));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<MacroExecution> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MacroError::NotFound(format!("execution {id}")))?;
        hydrate_execution(&row)
    }

    async fn history(
        &self,
        macro_id: Uuid,
        filter: &HistoryFilter,
    ) -> Result<Vec<MacroExecution>> {
        let mut sql = String::from("SELECT * FROM executions WHERE macro_id = ?");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        sql.push_str(" ORDER BY created_at DESC");
        if filter.limit > 0 {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(macro_id.to_string());
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(since) = filter.since {
            query = query.bind(since);
        }
        if filter.limit > 0 {
            query = query.bind(filter.limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(hydrate_execution).collect()
    }
}

fn hydrate_execution(row: &sqlx::sqlite::SqliteRow) -> Result<MacroExecution> {
    let status = parse_status(&row.try_get::<String, _>("status")?)?;
    let cancel_reason = row
        .try_get::<Option<String>, _>("cancel_reason")?
        .map(|s| parse_cancel_reason(&s))
        .transpose()?;

    Ok(MacroExecution {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        macro_id: parse_uuid(&row.try_get::<String, _>("macro_id")?)?,
        event: serde_json::from_str(&row.try_get::<String, _>("event_json")?)?,
        status,
        started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
        action_results: serde_json::from_str(&row.try_get::<String, _>("results_json")?)?,
        scope: serde_json::from_str(&row.try_get::<String, _>("scope_json")?)?,
        error_message: row.try_get::<Option<String>, _>("error_message")?,
        cancel_reason,
    })
}

fn parse_status(s: &str) -> Result<ExecutionStatus> {
    match s {
        "PENDING" => Ok(ExecutionStatus::Pending),
        "RUNNING" => Ok(ExecutionStatus::Running),
        "COMPLETED" => Ok(ExecutionStatus::Completed),
        "FAILED" => Ok(ExecutionStatus::Failed),
        "CANCELLED" => Ok(ExecutionStatus::Cancelled),
        other => Err(MacroError::Database(format!("unknown execution status '{other}'"))),
    }
}

fn parse_cancel_reason(s: &str) -> Result<CancelReason> {
    match s {
        "RATE_LIMITED" => Ok(CancelReason::RateLimited),
        "PERMISSION_DENIED" => Ok(CancelReason::PermissionDenied),
        "CONCURRENCY_LIMIT" => Ok(CancelReason::ConcurrencyLimit),
        "TIMEOUT" => Ok(CancelReason::Timeout),
        "EXTERNAL" => Ok(CancelReason::External),
        other => Err(MacroError::Database(format!("unknown cancel reason '{other}'"))),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| MacroError::Database(format!("bad uuid '{s}': {e}")))
}

pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn upsert(&self, state: &ScheduleState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedule_state (macro_id, schedule_json, next_run_at, execution_count)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (macro_id) DO UPDATE SET
                schedule_json = excluded.schedule_json,
                next_run_at = excluded.next_run_at,
                execution_count = excluded.execution_count
            "#,
        )
        .bind(state.macro_id.to_string())
        .bind(serde_json::to_string(&state.schedule)?)
        .bind(state.next_run_at)
        .bind(i64::from(state.execution_count))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, macro_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM schedule_state WHERE macro_id = ?")
            .bind(macro_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, macro_id: Uuid) -> Result<Option<ScheduleState>> {
        let row = sqlx::query("SELECT * FROM schedule_state WHERE macro_id = ?")
            .bind(macro_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(hydrate_schedule).transpose()
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>> {
        let rows = sqlx::query("SELECT * FROM schedule_state WHERE next_run_at <= ?")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(hydrate_schedule).collect()
    }

    async fn all(&self) -> Result<Vec<ScheduleState>> {
        let rows = sqlx::query("SELECT * FROM schedule_state ORDER BY next_run_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(hydrate_schedule).collect()
    }
}

fn hydrate_schedule(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduleState> {
    Ok(ScheduleState {
        macro_id: parse_uuid(&row.try_get::<String, _>("macro_id")?)?,
        schedule: serde_json::from_str(&row.try_get::<String, _>("schedule_json")?)?,
        next_run_at: row.try_get("next_run_at")?,
        execution_count: row.try_get::<i64, _>("execution_count")? as u32,
    })
}
