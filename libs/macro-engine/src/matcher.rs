//! Rule matcher
//!
//! Finds the enabled macro definitions whose trigger matches an event and
//! orders them for instantiation: priority descending, then creation time
//! ascending as the tie-breaker. Matching never mutates anything.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::effects::DefinitionSource;
use crate::error::Result;
use crate::types::{EventEnvelope, EventKind, EventOrigin, MacroDefinition, TriggerKind};

pub struct RuleMatcher {
    defs: Arc<dyn DefinitionSource>,
}

impl RuleMatcher {
    pub fn new(defs: Arc<dyn DefinitionSource>) -> Self {
        Self { defs }
    }

    /// All enabled definitions matching the event, in instantiation order
    pub async fn matches_for(&self, event: &EventEnvelope) -> Result<Vec<MacroDefinition>> {
        let mut matched: Vec<MacroDefinition> = self
            .defs
            .list_enabled()
            .await?
            .into_iter()
            .filter(|def| Self::matches(def, event))
            .collect();
        matched.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(matched)
    }

    /// Whether one definition's trigger matches the event
    pub fn matches(def: &MacroDefinition, event: &EventEnvelope) -> bool {
        if !kind_matches(&def.trigger.kind, event, def.id) {
            return false;
        }
        match &def.trigger.condition {
            Some(condition) => condition.evaluate(&event.payload),
            None => true,
        }
    }
}

fn kind_matches(kind: &TriggerKind, event: &EventEnvelope, macro_id: Uuid) -> bool {
    match kind {
        // Manual and scheduled events address one specific macro
        TriggerKind::Manual => {
            event.kind == EventKind::Manual && payload_targets(event, macro_id)
        },
        TriggerKind::Scheduled => {
            event.kind == EventKind::Scheduled && payload_targets(event, macro_id)
        },
        TriggerKind::ItemCreated => event.kind == EventKind::ItemCreated,
        TriggerKind::ItemUpdated => event.kind == EventKind::ItemUpdated,
        TriggerKind::CommentAdded => event.kind == EventKind::CommentAdded,
        TriggerKind::SystemStartup => event.kind == EventKind::SystemStartup,
        TriggerKind::UserLogin => event.kind == EventKind::UserLogin,
        TriggerKind::ItemTransitioned { from_state, to_state } => {
            event.kind == EventKind::ItemTransitioned
                && payload_str_matches(event, "from_state", from_state.as_deref())
                && payload_str_matches(event, "to_state", to_state.as_deref())
        },
        TriggerKind::FieldChanged { field } => {
            event.kind == EventKind::FieldChanged
                && payload_str_matches(event, "field", field.as_deref())
        },
        TriggerKind::IntegrationEvent { source } => {
            event.kind == EventKind::IntegrationEvent
                && match source.as_deref() {
                    None => true,
                    Some(want) => {
                        matches!(&event.origin, EventOrigin::Webhook { source } if source == want)
                            || payload_str_matches(event, "source", Some(want))
                    },
                }
        },
        // Empty composites match nothing
        TriggerKind::AllOf { triggers } => {
            !triggers.is_empty() && triggers.iter().all(|t| kind_matches(t, event, macro_id))
        },
        TriggerKind::AnyOf { triggers } => {
            triggers.iter().any(|t| kind_matches(t, event, macro_id))
        },
    }
}

/// Whether the event payload addresses this macro by id
fn payload_targets(event: &EventEnvelope, macro_id: Uuid) -> bool {
    event
        .payload
        .get("macro_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .is_some_and(|id| id == macro_id)
}

/// True when the trigger leaves the field unconstrained or the payload
/// carries the expected string
fn payload_str_matches(event: &EventEnvelope, field: &str, expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(want) => event.payload.get(field).and_then(Value::as_str) == Some(want),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{CompareOp, ConditionExpr};
    use crate::effects::MemoryDefinitions;
    use crate::types::{MacroTrigger, Scope};
    use serde_json::json;

    fn payload(value: Value) -> Scope {
        value.as_object().unwrap().clone()
    }

    fn event(kind: EventKind, payload_value: Value) -> EventEnvelope {
        EventEnvelope::new(kind, EventOrigin::System, payload(payload_value))
    }

    fn def(trigger: MacroTrigger) -> MacroDefinition {
        MacroDefinition::new("m", "alice", trigger, vec![])
    }

    #[test]
    fn test_transition_trigger_filters_states() {
        let d = def(MacroTrigger::new(TriggerKind::ItemTransitioned {
            from_state: None,
            to_state: Some("DONE".to_string()),
        }));

        let done = event(
            EventKind::ItemTransitioned,
            json!({"item": "WI-1", "from_state": "REVIEW", "to_state": "DONE"}),
        );
        assert!(RuleMatcher::matches(&d, &done));

        let open = event(
            EventKind::ItemTransitioned,
            json!({"item": "WI-1", "from_state": "NEW", "to_state": "OPEN"}),
        );
        assert!(!RuleMatcher::matches(&d, &open));

        let created = event(EventKind::ItemCreated, json!({"item": "WI-1"}));
        assert!(!RuleMatcher::matches(&d, &created));
    }

    #[test]
    fn test_manual_trigger_requires_matching_macro_id() {
        let d = def(MacroTrigger::new(TriggerKind::Manual));

        let addressed = event(EventKind::Manual, json!({"macro_id": d.id.to_string()}));
        assert!(RuleMatcher::matches(&d, &addressed));

        let other = event(EventKind::Manual, json!({"macro_id": Uuid::new_v4().to_string()}));
        assert!(!RuleMatcher::matches(&d, &other));

        let unaddressed = event(EventKind::Manual, json!({}));
        assert!(!RuleMatcher::matches(&d, &unaddressed));
    }

    #[test]
    fn test_trigger_condition_gates_match() {
        let d = def(MacroTrigger::with_condition(
            TriggerKind::ItemUpdated,
            ConditionExpr::field("priority", CompareOp::Gte, json!(8)),
        ));

        assert!(RuleMatcher::matches(&d, &event(EventKind::ItemUpdated, json!({"priority": 9}))));
        assert!(!RuleMatcher::matches(&d, &event(EventKind::ItemUpdated, json!({"priority": 3}))));
        assert!(!RuleMatcher::matches(&d, &event(EventKind::ItemUpdated, json!({}))));
    }

    #[test]
    fn test_composite_triggers() {
        let any = def(MacroTrigger::new(TriggerKind::AnyOf {
            triggers: vec![TriggerKind::ItemCreated, TriggerKind::CommentAdded],
        }));
        assert!(RuleMatcher::matches(&any, &event(EventKind::CommentAdded, json!({}))));
        assert!(!RuleMatcher::matches(&any, &event(EventKind::UserLogin, json!({}))));

        let empty = def(MacroTrigger::new(TriggerKind::AllOf { triggers: vec![] }));
        assert!(!RuleMatcher::matches(&empty, &event(EventKind::ItemCreated, json!({}))));
    }

    #[test]
    fn test_integration_source_filter() {
        let d = def(MacroTrigger::new(TriggerKind::IntegrationEvent {
            source: Some("gitlab".to_string()),
        }));

        let from_gitlab = EventEnvelope::new(
            EventKind::IntegrationEvent,
            EventOrigin::Webhook { source: "gitlab".to_string() },
            Scope::new(),
        );
        assert!(RuleMatcher::matches(&d, &from_gitlab));

        let from_jira = EventEnvelope::new(
            EventKind::IntegrationEvent,
            EventOrigin::Webhook { source: "jira".to_string() },
            Scope::new(),
        );
        assert!(!RuleMatcher::matches(&d, &from_jira));
    }

    #[tokio::test]
    async fn test_ordering_priority_then_created_at() {
        let defs = Arc::new(MemoryDefinitions::new());

        let mut low = def(MacroTrigger::new(TriggerKind::ItemCreated));
        low.priority = 10;
        let mut high = def(MacroTrigger::new(TriggerKind::ItemCreated));
        high.priority = 200;
        let mut older_high = def(MacroTrigger::new(TriggerKind::ItemCreated));
        older_high.priority = 200;
        older_high.created_at = high.created_at - chrono::Duration::hours(1);

        let mut disabled = def(MacroTrigger::new(TriggerKind::ItemCreated));
        disabled.priority = 999;
        disabled.enabled = false;

        for d in [&low, &high, &older_high, &disabled] {
            defs.insert(d.clone());
        }

        let matcher = RuleMatcher::new(defs);
        let matched = matcher
            .matches_for(&event(EventKind::ItemCreated, json!({})))
            .await
            .unwrap();

        let ids: Vec<Uuid> = matched.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![older_high.id, high.id, low.id]);
    }
}
