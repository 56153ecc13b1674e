//! Event router
//!
//! Single intake point for every event source. Publishing is fire and
//! forget over an unbounded channel; the dispatch loop matches each event
//! against the enabled definitions and spawns one engine task per match,
//! so one slow macro never blocks another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::engine::AutomationEngine;
use crate::matcher::RuleMatcher;
use crate::types::EventEnvelope;

pub struct EventRouter {
    matcher: RuleMatcher,
    engine: Arc<AutomationEngine>,
    tx: mpsc::UnboundedSender<EventEnvelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<EventEnvelope>>>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl EventRouter {
    pub fn new(matcher: RuleMatcher, engine: Arc<AutomationEngine>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            matcher,
            engine,
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle publishers can keep after the router is started
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher { tx: self.tx.clone() }
    }

    /// Enqueue an event. Never blocks and never fails; an event published
    /// after shutdown is logged and dropped.
    pub fn publish(&self, event: EventEnvelope) {
        if self.tx.send(event).is_err() {
            tracing::warn!("event dropped, router is not consuming");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the dispatch loop after the event it is currently matching
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Start the dispatch loop. Subsequent calls return None.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        self.running.store(true, Ordering::SeqCst);

        let router = self.clone();
        Some(tokio::spawn(async move {
            tracing::info!("event router started");
            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => router.dispatch(event).await,
                            None => break,
                        }
                    },
                    _ = router.shutdown.notified() => break,
                }
            }
            router.running.store(false, Ordering::SeqCst);
            tracing::info!("event router stopped");
        }))
    }

    async fn dispatch(&self, event: EventEnvelope) {
        let matched = match self.matcher.matches_for(&event).await {
            Ok(matched) => matched,
            Err(err) => {
                tracing::error!(event_id = %event.id, error = %err, "matching failed, event dropped");
                return;
            },
        };
        if matched.is_empty() {
            tracing::trace!(event_id = %event.id, kind = ?event.kind, "no macro matched");
            return;
        }
        tracing::debug!(event_id = %event.id, matches = matched.len(), "dispatching event");

        for def in matched {
            let engine = self.engine.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.execute(&def, event).await {
                    tracing::error!(macro_id = %def.id, error = %err, "execution could not be recorded");
                }
            });
        }
    }
}

/// Cloneable publishing handle for event sources
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl EventPublisher {
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        Self { tx }
    }

    pub fn publish(&self, event: EventEnvelope) {
        if self.tx.send(event).is_err() {
            tracing::warn!("event dropped, router is not consuming");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{AllowAllPermissions, MemoryDefinitions, MemoryEffects};
    use crate::executor::ActionExecutor;
    use crate::guard::ExecutionGuard;
    use crate::store::{ExecutionStore, HistoryFilter, MemoryExecutionStore};
    use crate::types::{
        ActionKind, EventKind, EventOrigin, MacroAction, MacroDefinition, MacroTrigger,
        RateLimit, TriggerKind,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        router: Arc<EventRouter>,
        defs: Arc<MemoryDefinitions>,
        store: Arc<MemoryExecutionStore>,
    }

    fn harness() -> Harness {
        let effects = Arc::new(MemoryEffects::new());
        let defs = Arc::new(MemoryDefinitions::new());
        let store = Arc::new(MemoryExecutionStore::new());
        let engine = Arc::new(AutomationEngine::new(
            ActionExecutor::standard(effects.clone(), effects),
            store.clone(),
            defs.clone(),
            ExecutionGuard::new(Arc::new(AllowAllPermissions), RateLimit::default()),
        ));
        let router = Arc::new(EventRouter::new(RuleMatcher::new(defs.clone()), engine));
        Harness { router, defs, store }
    }

    fn comment_macro(name: &str) -> MacroDefinition {
        MacroDefinition::new(
            name,
            "alice",
            MacroTrigger::new(TriggerKind::ItemCreated),
            vec![MacroAction::new(ActionKind::AddComment {
                item: "{{item}}".to_string(),
                text: "welcome".to_string(),
            })],
        )
    }

    async fn wait_for_history(
        store: &MemoryExecutionStore,
        macro_id: uuid::Uuid,
        count: usize,
    ) -> Vec<crate::types::MacroExecution> {
        for _ in 0..200 {
            let history = store.history(macro_id, &HistoryFilter::default()).await.unwrap();
            if history.len() >= count && history.iter().all(|e| e.status.is_terminal()) {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("executions never reached the store");
    }

    #[tokio::test]
    async fn test_published_event_reaches_matching_macro() {
        let h = harness();
        let def = comment_macro("greeter");
        h.defs.insert(def.clone());
        let handle = h.router.start().unwrap();

        h.router.publish(EventEnvelope::new(
            EventKind::ItemCreated,
            EventOrigin::System,
            json!({"item": "WI-1"}).as_object().cloned().unwrap(),
        ));

        let history = wait_for_history(&h.store, def.id, 1).await;
        assert_eq!(history[0].status, crate::types::ExecutionStatus::Completed);

        h.router.shutdown();
        handle.await.unwrap();
        assert!(!h.router.is_running());
    }

    #[tokio::test]
    async fn test_one_event_fans_out_to_all_matches() {
        let h = harness();
        let first = comment_macro("a");
        let second = comment_macro("b");
        h.defs.insert(first.clone());
        h.defs.insert(second.clone());
        let _handle = h.router.start().unwrap();

        h.router.publisher().publish(EventEnvelope::new(
            EventKind::ItemCreated,
            EventOrigin::System,
            json!({"item": "WI-2"}).as_object().cloned().unwrap(),
        ));

        wait_for_history(&h.store, first.id, 1).await;
        wait_for_history(&h.store, second.id, 1).await;
    }

    #[tokio::test]
    async fn test_unmatched_event_is_dropped_silently() {
        let h = harness();
        let def = comment_macro("greeter");
        h.defs.insert(def.clone());
        let _handle = h.router.start().unwrap();

        h.router.publish(EventEnvelope::new(
            EventKind::UserLogin,
            EventOrigin::System,
            Default::default(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_start_is_single_shot() {
        let h = harness();
        let _handle = h.router.start().unwrap();
        assert!(h.router.start().is_none());
    }
}
