//! End-to-end flows through router, matcher, engine, scheduler and the
//! SQLite stores.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use macro_engine::{
    connect, ActionExecutor, ActionKind, AutomationEngine, AllowAllPermissions, CancelReason,
    DefinitionSource,
    EventEnvelope, EventKind, EventOrigin, EventRouter, ExecutionGuard, ExecutionStatus,
    ExecutionStore, HistoryFilter, MacroAction, MacroDefinition, MacroExecution, MacroSchedule,
    MacroScheduler, MacroTrigger, MemoryDefinitions, MemoryEffects, OwnerPermissions, RateLimit,
    Recurrence, RuleMatcher, SqliteExecutionStore, SqliteScheduleStore, TriggerKind,
};

struct Stack {
    router: Arc<EventRouter>,
    engine: Arc<AutomationEngine>,
    effects: Arc<MemoryEffects>,
    defs: Arc<MemoryDefinitions>,
    store: Arc<SqliteExecutionStore>,
    pool: sqlx::SqlitePool,
    _dir: tempfile::TempDir,
}

async fn stack() -> Stack {
    stack_with_permissions(false).await
}

async fn stack_with_permissions(owner_only: bool) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("engine.db").display());
    let pool = connect(&url).await.unwrap();

    let effects = Arc::new(MemoryEffects::new());
    let defs = Arc::new(MemoryDefinitions::new());
    let store = Arc::new(SqliteExecutionStore::new(pool.clone()));

    let permissions: Arc<dyn macro_engine::PermissionSource> = if owner_only {
        Arc::new(OwnerPermissions::new(defs.clone()))
    } else {
        Arc::new(AllowAllPermissions)
    };

    let engine = Arc::new(AutomationEngine::new(
        ActionExecutor::standard(effects.clone(), effects.clone()),
        store.clone(),
        defs.clone(),
        ExecutionGuard::new(permissions, RateLimit::default()),
    ));
    let router = Arc::new(EventRouter::new(RuleMatcher::new(defs.clone()), engine.clone()));

    Stack { router, engine, effects, defs, store, pool, _dir: dir }
}

async fn wait_for_terminal(
    store: &SqliteExecutionStore,
    macro_id: Uuid,
    count: usize,
) -> Vec<MacroExecution> {
    for _ in 0..400 {
        let history = store.history(macro_id, &HistoryFilter::default()).await.unwrap();
        if history.len() >= count && history.iter().all(|e| e.status.is_terminal()) {
            return history;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("macro {macro_id} never produced {count} terminal executions");
}

fn transition_closer() -> MacroDefinition {
    MacroDefinition::new(
        "close notifier",
        "alice",
        MacroTrigger::new(TriggerKind::ItemTransitioned {
            from_state: None,
            to_state: Some("DONE".to_string()),
        }),
        vec![MacroAction::new(ActionKind::AddComment {
            item: "{{item}}".to_string(),
            text: "Closed automatically, was {{from_state}}".to_string(),
        })],
    )
}

#[tokio::test]
async fn transition_event_drives_comment_macro() {
    let s = stack().await;
    let def = transition_closer();
    s.defs.insert(def.clone());
    let _handle = s.router.start().unwrap();

    s.router.publish(EventEnvelope::new(
        EventKind::ItemTransitioned,
        EventOrigin::User { name: "alice".to_string() },
        json!({"item": "WI-42", "from_state": "REVIEW", "to_state": "DONE"})
            .as_object()
            .cloned()
            .unwrap(),
    ));

    let history = wait_for_terminal(&s.store, def.id, 1).await;
    let exec = &history[0];
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.action_results.len(), 1);
    assert_eq!(exec.action_results[0].kind, "add_comment");
    assert!(exec.started_at.is_some() && exec.finished_at.is_some());

    assert_eq!(
        s.effects.recorded(),
        vec![macro_engine::effects::RecordedEffect::Comment {
            item: "WI-42".to_string(),
            text: "Closed automatically, was REVIEW".to_string(),
        }]
    );

    // The definition's recent ring saw the run too
    let stored = s.defs.get(def.id).await.unwrap();
    assert_eq!(stored.recent_executions.len(), 1);
    assert_eq!(stored.recent_executions[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn non_matching_transition_is_ignored() {
    let s = stack().await;
    let def = transition_closer();
    s.defs.insert(def.clone());
    let _handle = s.router.start().unwrap();

    s.router.publish(EventEnvelope::new(
        EventKind::ItemTransitioned,
        EventOrigin::System,
        json!({"item": "WI-1", "to_state": "OPEN"}).as_object().cloned().unwrap(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let history = s.store.history(def.id, &HistoryFilter::default()).await.unwrap();
    assert!(history.is_empty());
    assert!(s.effects.recorded().is_empty());
}

#[tokio::test]
async fn republished_envelope_runs_twice_without_deduplication() {
    let s = stack().await;
    let def = transition_closer();
    s.defs.insert(def.clone());
    let _handle = s.router.start().unwrap();

    let envelope = EventEnvelope::new(
        EventKind::ItemTransitioned,
        EventOrigin::User { name: "alice".to_string() },
        json!({"item": "WI-42", "from_state": "REVIEW", "to_state": "DONE"})
            .as_object()
            .cloned()
            .unwrap(),
    );
    s.router.publish(envelope.clone());
    s.router.publish(envelope.clone());

    let history = wait_for_terminal(&s.store, def.id, 2).await;
    assert_eq!(history.len(), 2);
    assert_ne!(history[0].id, history[1].id);
    for exec in &history {
        assert_eq!(exec.event.id, envelope.id);
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }
    assert_eq!(s.effects.recorded().len(), 2);
}

#[tokio::test]
async fn webhook_failure_retries_then_fails_execution() {
    let s = stack().await;
    s.effects.fail_next_webhooks(100);
    let mut def = MacroDefinition::new(
        "notify ci",
        "alice",
        MacroTrigger::new(TriggerKind::ItemCreated),
        vec![MacroAction::new(ActionKind::CallWebhook {
            url: "http://ci.example/hook".to_string(),
            payload: json!({"item": "{{item}}"}),
            auth_header: None,
        })],
    );
    def.timeout_ms = 30_000;
    s.defs.insert(def.clone());

    let event = EventEnvelope::new(
        EventKind::ItemCreated,
        EventOrigin::System,
        json!({"item": "WI-9"}).as_object().cloned().unwrap(),
    );
    let exec = s.engine.execute(&def, event).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.action_results[0].attempts, 3);
    assert!(exec.error_message.as_deref().unwrap_or_default().contains("503"));

    // The terminal record is persisted
    let loaded = s.store.get(exec.id).await.unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    assert_eq!(loaded.action_results[0].attempts, 3);
}

#[tokio::test]
async fn rate_limited_burst_records_cancelled_executions() {
    let s = stack().await;
    let mut def = transition_closer();
    def.rate_limit = Some(RateLimit { capacity: 2, refill_per_sec: 0.001 });
    s.defs.insert(def.clone());

    for _ in 0..4 {
        let event = EventEnvelope::new(
            EventKind::ItemTransitioned,
            EventOrigin::User { name: "alice".to_string() },
            json!({"item": "WI-1", "from_state": "A", "to_state": "DONE"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        s.engine.execute(&def, event).await.unwrap();
    }

    let history = s.store.history(def.id, &HistoryFilter::default()).await.unwrap();
    assert_eq!(history.len(), 4);
    let cancelled: Vec<_> = history
        .iter()
        .filter(|e| e.status == ExecutionStatus::Cancelled)
        .collect();
    assert_eq!(cancelled.len(), 2);
    for exec in cancelled {
        assert_eq!(exec.cancel_reason, Some(CancelReason::RateLimited));
        assert!(exec.action_results.is_empty());
    }
    assert_eq!(s.effects.recorded().len(), 2);
}

#[tokio::test]
async fn foreign_user_is_denied_and_recorded() {
    let s = stack_with_permissions(true).await;
    let def = transition_closer();
    s.defs.insert(def.clone());

    let event = EventEnvelope::new(
        EventKind::ItemTransitioned,
        EventOrigin::User { name: "mallory".to_string() },
        json!({"item": "WI-1", "to_state": "DONE"}).as_object().cloned().unwrap(),
    );
    let exec = s.engine.execute(&def, event).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.cancel_reason, Some(CancelReason::PermissionDenied));
    assert!(s.effects.recorded().is_empty());

    let loaded = s.store.get(exec.id).await.unwrap();
    assert_eq!(loaded.cancel_reason, Some(CancelReason::PermissionDenied));
}

#[tokio::test]
async fn persisted_schedule_fires_once_after_downtime() {
    let s = stack().await;
    let mut def = MacroDefinition::new(
        "hourly sweep",
        "alice",
        MacroTrigger::new(TriggerKind::Scheduled),
        vec![MacroAction::new(ActionKind::SendNotification {
            channel: "ops".to_string(),
            message: "sweep".to_string(),
        })],
    );
    def.schedule = Some(MacroSchedule {
        recurrence: Recurrence::Interval { every_ms: 3_600_000 },
        utc_offset_minutes: 0,
        end_at: None,
        max_executions: None,
    });
    s.defs.insert(def.clone());
    let _handle = s.router.start().unwrap();

    let schedule_store = Arc::new(SqliteScheduleStore::new(s.pool.clone()));
    let scheduler = MacroScheduler::new(schedule_store.clone(), s.router.publisher());

    // Simulate state persisted by a previous process, several runs missed
    use macro_engine::ScheduleStore;
    schedule_store
        .upsert(&macro_engine::ScheduleState {
            macro_id: def.id,
            schedule: def.schedule.clone().unwrap(),
            next_run_at: chrono::Utc::now() - chrono::Duration::hours(5),
            execution_count: 3,
        })
        .await
        .unwrap();
    assert!(scheduler.ensure(&def).await.unwrap().is_none());

    let fired = scheduler.tick_at(chrono::Utc::now()).await.unwrap();
    assert_eq!(fired, 1);

    let history = wait_for_terminal(&s.store, def.id, 1).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Completed);
    assert_eq!(history[0].event.origin, EventOrigin::Scheduler);

    // Next run is one interval from now, not a replay of missed slots
    let state = schedule_store.get(def.id).await.unwrap().unwrap();
    assert!(state.next_run_at > chrono::Utc::now());
    assert_eq!(state.execution_count, 4);
    assert_eq!(scheduler.tick_at(chrono::Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn manual_trigger_reaches_only_the_addressed_macro() {
    let s = stack().await;
    let target = MacroDefinition::new(
        "run me",
        "alice",
        MacroTrigger::new(TriggerKind::Manual),
        vec![MacroAction::new(ActionKind::SendNotification {
            channel: "ops".to_string(),
            message: "manual run".to_string(),
        })],
    );
    let bystander = MacroDefinition::new(
        "not me",
        "alice",
        MacroTrigger::new(TriggerKind::Manual),
        vec![],
    );
    s.defs.insert(target.clone());
    s.defs.insert(bystander.clone());
    let _handle = s.router.start().unwrap();

    s.router.publish(EventEnvelope::new(
        EventKind::Manual,
        EventOrigin::User { name: "alice".to_string() },
        json!({"macro_id": target.id.to_string()}).as_object().cloned().unwrap(),
    ));

    wait_for_terminal(&s.store, target.id, 1).await;
    let other = s.store.history(bystander.id, &HistoryFilter::default()).await.unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn suspended_execution_resumes_with_prompt_answer() {
    let s = stack().await;
    let def = MacroDefinition::new(
        "ask first",
        "alice",
        MacroTrigger::new(TriggerKind::ItemUpdated),
        vec![
            MacroAction::new(ActionKind::UserPrompt {
                prompt: "approve the cleanup?".to_string(),
                output: "approval".to_string(),
            }),
            MacroAction::new(ActionKind::AddComment {
                item: "WI-5".to_string(),
                text: "approved: {{approval}}".to_string(),
            }),
        ],
    );
    s.defs.insert(def.clone());

    let engine = s.engine.clone();
    let running = {
        let def = def.clone();
        tokio::spawn(async move {
            let event = EventEnvelope::new(
                EventKind::ItemUpdated,
                EventOrigin::System,
                Default::default(),
            );
            engine.execute(&def, event).await
        })
    };

    let resume_table = s.engine.resume_table();
    while resume_table.pending().is_empty() {
        tokio::task::yield_now().await;
    }
    let pending = resume_table.pending();
    assert_eq!(pending[0].prompt, "approve the cleanup?");

    s.engine.resume(pending[0].execution_id, json!("yes")).unwrap();
    let exec = running.await.unwrap().unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.scope.get("approval"), Some(&json!("yes")));
    assert_eq!(
        s.effects.recorded(),
        vec![macro_engine::effects::RecordedEffect::Comment {
            item: "WI-5".to_string(),
            text: "approved: yes".to_string(),
        }]
    );
}
