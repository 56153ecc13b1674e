//! Macro scheduler
//!
//! Time-based triggering. Each scheduled macro has one persisted
//! `ScheduleState` carrying its next-run instant and execution count; a
//! tick loop fires due states as `scheduled` events through the router.
//! A next-run instant that is already in the past when a tick sees it
//! (e.g. after downtime) fires exactly once, then the next run is
//! computed from the current time, missed occurrences are not replayed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{MacroError, Result};
use crate::router::EventPublisher;
use crate::types::{
    EventEnvelope, EventKind, EventOrigin, MacroDefinition, MacroSchedule, Recurrence,
};

/// Persisted scheduling state for one macro
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleState {
    pub macro_id: Uuid,
    pub schedule: MacroSchedule,
    pub next_run_at: DateTime<Utc>,
    pub execution_count: u32,
}

/// Persistence boundary for schedule state
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn upsert(&self, state: &ScheduleState) -> Result<()>;

    /// Idempotent removal
    async fn remove(&self, macro_id: Uuid) -> Result<()>;

    async fn get(&self, macro_id: Uuid) -> Result<Option<ScheduleState>>;

    /// States whose next run is at or before `now`
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>>;

    async fn all(&self) -> Result<Vec<ScheduleState>>;
}

/// In-memory schedule store
#[derive(Default)]
pub struct MemoryScheduleStore {
    states: DashMap<Uuid, ScheduleState>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn upsert(&self, state: &ScheduleState) -> Result<()> {
        self.states.insert(state.macro_id, state.clone());
        Ok(())
    }

    async fn remove(&self, macro_id: Uuid) -> Result<()> {
        self.states.remove(&macro_id);
        Ok(())
    }

    async fn get(&self, macro_id: Uuid) -> Result<Option<ScheduleState>> {
        Ok(self.states.get(&macro_id).map(|s| s.clone()))
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>> {
        Ok(self
            .states
            .iter()
            .filter(|s| s.next_run_at <= now)
            .map(|s| s.clone())
            .collect())
    }

    async fn all(&self) -> Result<Vec<ScheduleState>> {
        Ok(self.states.iter().map(|s| s.clone()).collect())
    }
}

impl MacroSchedule {
    /// Earliest occurrence strictly after `after`, honoring the end
    /// instant. None means the schedule is exhausted or unsatisfiable.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)?;
        let local = after.with_timezone(&offset);

        let candidate = match &self.recurrence {
            Recurrence::OneShot { at } => (*at > after).then_some(*at)?,
            Recurrence::Interval { every_ms } => {
                after + chrono::Duration::milliseconds(i64::try_from(*every_ms).ok()?)
            },
            Recurrence::Daily { hour, minute } => {
                next_daily(local, *hour, *minute)?.with_timezone(&Utc)
            },
            Recurrence::Weekly { days, hour, minute } => {
                next_weekly(local, days, *hour, *minute)?.with_timezone(&Utc)
            },
            Recurrence::Monthly { days, hour, minute } => {
                next_monthly(local, days, *hour, *minute)?.with_timezone(&Utc)
            },
        };

        if let Some(end) = self.end_at {
            if candidate > end {
                return None;
            }
        }
        Some(candidate)
    }
}

fn next_daily(
    local: DateTime<FixedOffset>,
    hour: u32,
    minute: u32,
) -> Option<DateTime<FixedOffset>> {
    for ahead in 0..=1 {
        let date = local.date_naive() + chrono::Duration::days(ahead);
        let naive = date.and_hms_opt(hour, minute, 0)?;
        let candidate = local.timezone().from_local_datetime(&naive).single()?;
        if candidate > local {
            return Some(candidate);
        }
    }
    None
}

fn next_weekly(
    local: DateTime<FixedOffset>,
    days: &[u32],
    hour: u32,
    minute: u32,
) -> Option<DateTime<FixedOffset>> {
    // 1 = Monday .. 7 = Sunday
    for ahead in 0..=7 {
        let date = local.date_naive() + chrono::Duration::days(ahead);
        if !days.contains(&date.weekday().number_from_monday()) {
            continue;
        }
        let naive = date.and_hms_opt(hour, minute, 0)?;
        let candidate = local.timezone().from_local_datetime(&naive).single()?;
        if candidate > local {
            return Some(candidate);
        }
    }
    None
}

fn next_monthly(
    local: DateTime<FixedOffset>,
    days: &[u32],
    hour: u32,
    minute: u32,
) -> Option<DateTime<FixedOffset>> {
    let mut sorted: Vec<u32> = days.to_vec();
    sorted.sort_unstable();

    // A day-of-month list like [31] skips short months, so look a year out
    for months_ahead in 0..=12 {
        let total = local.month0() + months_ahead;
        let year = local.year() + i32::try_from(total / 12).ok()?;
        let month = total % 12 + 1;
        for &day in &sorted {
            let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                continue;
            };
            let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                continue;
            };
            let Some(candidate) = local.timezone().from_local_datetime(&naive).single() else {
                continue;
            };
            if candidate > local {
                return Some(candidate);
            }
        }
    }
    None
}

pub struct MacroScheduler {
    store: Arc<dyn ScheduleStore>,
    publisher: EventPublisher,
    tick_interval: Duration,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl MacroScheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, publisher: EventPublisher) -> Self {
        Self {
            store,
            publisher,
            tick_interval: Duration::from_secs(1),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Register or replace a macro's schedule. Returns the first run
    /// instant; a schedule with no future occurrence is rejected.
    pub async fn schedule(&self, macro_id: Uuid, schedule: MacroSchedule) -> Result<DateTime<Utc>> {
        let next_run_at = schedule.next_occurrence(Utc::now()).ok_or_else(|| {
            MacroError::Scheduler(format!("schedule for macro {macro_id} has no future occurrence"))
        })?;
        self.store
            .upsert(&ScheduleState { macro_id, schedule, next_run_at, execution_count: 0 })
            .await?;
        tracing::info!(macro_id = %macro_id, next_run_at = %next_run_at, "macro scheduled");
        Ok(next_run_at)
    }

    /// Register a definition's schedule unless persisted state already
    /// exists; the persisted next-run instant survives restarts so a
    /// missed run still fires once.
    pub async fn ensure(&self, def: &MacroDefinition) -> Result<Option<DateTime<Utc>>> {
        let Some(schedule) = &def.schedule else {
            return Ok(None);
        };
        if self.store.get(def.id).await?.is_some() {
            return Ok(None);
        }
        self.schedule(def.id, schedule.clone()).await.map(Some)
    }

    /// Idempotent cancellation
    pub async fn cancel(&self, macro_id: Uuid) -> Result<()> {
        self.store.remove(macro_id).await
    }

    pub async fn pending(&self) -> Result<Vec<ScheduleState>> {
        self.store.all().await
    }

    /// Fire everything due at `now` and advance or retire each state.
    /// Returns the number of events emitted.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due(now).await?;
        let mut fired = 0;
        for mut state in due {
            let mut payload = serde_json::Map::new();
            payload.insert("macro_id".to_string(), json!(state.macro_id.to_string()));
            payload.insert("scheduled_for".to_string(), json!(state.next_run_at));
            self.publisher.publish(EventEnvelope::new(
                EventKind::Scheduled,
                EventOrigin::Scheduler,
                payload,
            ));
            state.execution_count += 1;
            fired += 1;

            let exhausted = state
                .schedule
                .max_executions
                .is_some_and(|max| state.execution_count >= max);
            let next = if exhausted { None } else { state.schedule.next_occurrence(now) };
            match next {
                Some(next_run_at) => {
                    state.next_run_at = next_run_at;
                    self.store.upsert(&state).await?;
                },
                None => {
                    tracing::info!(macro_id = %state.macro_id, "schedule exhausted, removing");
                    self.store.remove(state.macro_id).await?;
                },
            }
        }
        Ok(fired)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Start the tick loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let scheduler = self.clone();
        tokio::spawn(async move {
            tracing::info!(tick_ms = scheduler.tick_interval.as_millis() as u64, "scheduler started");
            let mut ticker = tokio::time::interval(scheduler.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = scheduler.tick_at(Utc::now()).await {
                            tracing::error!(error = %err, "scheduler tick failed");
                        }
                    },
                    _ = scheduler.shutdown.notified() => break,
                }
            }
            scheduler.running.store(false, Ordering::SeqCst);
            tracing::info!("scheduler stopped");
        })
    }
}
