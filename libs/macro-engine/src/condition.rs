//! Condition predicate trees
//!
//! Boolean predicates over a JSON scope (event payload or execution scope).
//! Groups combine with AND/OR/NOT and short-circuit; field conditions
//! compare a dotted-path value against a literal or another scope variable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Scope;

/// A predicate: either a single field condition or a logical group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionExpr {
    Field(FieldCondition),
    Group(ConditionGroup),
}

/// Logical group of sub-predicates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub logic: LogicOp,
    pub rules: Vec<ConditionExpr>,
}

/// Logical operators for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicOp {
    And,
    Or,
    /// Matches when none of the children match
    Not,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Scope value is a member of the given array
    In,
    /// String containment
    Contains,
}

/// Single condition over one scope field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldCondition {
    /// Dotted path into the scope, e.g. "item.state"
    pub field: String,

    pub operator: CompareOp,

    /// Literal to compare against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Name of another scope variable to compare against instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_ref: Option<String>,
}

impl ConditionExpr {
    /// Convenience constructor for a single field condition
    pub fn field(field: impl Into<String>, operator: CompareOp, value: Value) -> Self {
        ConditionExpr::Field(FieldCondition {
            field: field.into(),
            operator,
            value: Some(value),
            value_ref: None,
        })
    }

    /// Evaluate against a scope. Missing fields evaluate to false,
    /// they never error.
    pub fn evaluate(&self, scope: &Scope) -> bool {
        match self {
            ConditionExpr::Field(cond) => evaluate_field(cond, scope),
            ConditionExpr::Group(group) => evaluate_group(group, scope),
        }
    }
}

fn evaluate_group(group: &ConditionGroup, scope: &Scope) -> bool {
    match group.logic {
        LogicOp::And => group.rules.iter().all(|r| r.evaluate(scope)),
        LogicOp::Or => group.rules.iter().any(|r| r.evaluate(scope)),
        LogicOp::Not => !group.rules.iter().any(|r| r.evaluate(scope)),
    }
}

fn evaluate_field(cond: &FieldCondition, scope: &Scope) -> bool {
    let Some(left) = lookup_path(scope, &cond.field) else {
        tracing::trace!(field = %cond.field, "condition field not in scope");
        return false;
    };

    let right = match (&cond.value_ref, &cond.value) {
        (Some(name), _) => match lookup_path(scope, name) {
            Some(v) => v.clone(),
            None => return false,
        },
        (None, Some(v)) => v.clone(),
        (None, None) => Value::Null,
    };

    compare(left, &cond.operator, &right)
}

/// Resolve a dotted path into nested JSON objects
pub fn lookup_path<'a>(scope: &'a Scope, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = scope.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn compare(left: &Value, operator: &CompareOp, right: &Value) -> bool {
    match operator {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::In => right
            .as_array()
            .is_some_and(|arr| arr.iter().any(|v| values_equal(left, v))),
        CompareOp::Contains => {
            let left_str = value_as_string(left);
            let right_str = value_as_string(right);
            left_str.contains(&right_str)
        },
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let (Some(l), Some(r)) = (as_number(left), as_number(right)) else {
                return false;
            };
            match operator {
                CompareOp::Gt => l > r,
                CompareOp::Gte => l >= r,
                CompareOp::Lt => l < r,
                CompareOp::Lte => l <= r,
                _ => false,
            }
        },
    }
}

/// Equality with numeric coercion, so 5 == 5.0 and "5" == 5
fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(value: Value) -> Scope {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_field_operators() {
        let scope = scope(json!({"priority": 7, "state": "DONE", "title": "fix login bug"}));

        assert!(ConditionExpr::field("priority", CompareOp::Gt, json!(5)).evaluate(&scope));
        assert!(!ConditionExpr::field("priority", CompareOp::Lte, json!(5)).evaluate(&scope));
        assert!(ConditionExpr::field("state", CompareOp::Eq, json!("DONE")).evaluate(&scope));
        assert!(ConditionExpr::field("state", CompareOp::In, json!(["DONE", "CANCELLED"])).evaluate(&scope));
        assert!(ConditionExpr::field("title", CompareOp::Contains, json!("login")).evaluate(&scope));
        assert!(ConditionExpr::field("state", CompareOp::Ne, json!("OPEN")).evaluate(&scope));
    }

    #[test]
    fn test_missing_field_is_false() {
        let scope = scope(json!({"a": 1}));
        assert!(!ConditionExpr::field("missing", CompareOp::Eq, json!(1)).evaluate(&scope));
    }

    #[test]
    fn test_dotted_path() {
        let scope = scope(json!({"item": {"state": "OPEN", "assignee": {"name": "bob"}}}));
        assert!(ConditionExpr::field("item.state", CompareOp::Eq, json!("OPEN")).evaluate(&scope));
        assert!(ConditionExpr::field("item.assignee.name", CompareOp::Eq, json!("bob")).evaluate(&scope));
        assert!(!ConditionExpr::field("item.missing.deep", CompareOp::Eq, json!(1)).evaluate(&scope));
    }

    #[test]
    fn test_value_ref() {
        let scope = scope(json!({"a": 10, "b": 10, "c": 3}));
        let cond = ConditionExpr::Field(FieldCondition {
            field: "a".to_string(),
            operator: CompareOp::Eq,
            value: None,
            value_ref: Some("b".to_string()),
        });
        assert!(cond.evaluate(&scope));

        let cond2 = ConditionExpr::Field(FieldCondition {
            field: "a".to_string(),
            operator: CompareOp::Gt,
            value: None,
            value_ref: Some("c".to_string()),
        });
        assert!(cond2.evaluate(&scope));
    }

    #[test]
    fn test_numeric_coercion() {
        let scope = scope(json!({"count": "42"}));
        assert!(ConditionExpr::field("count", CompareOp::Eq, json!(42)).evaluate(&scope));
        assert!(ConditionExpr::field("count", CompareOp::Gte, json!(42.0)).evaluate(&scope));
    }

    #[test]
    fn test_group_logic() {
        let scope = scope(json!({"priority": 7, "state": "DONE"}));

        let and_group: ConditionExpr = serde_json::from_value(json!({
            "logic": "AND",
            "rules": [
                {"field": "priority", "operator": "gt", "value": 5},
                {"field": "state", "operator": "eq", "value": "DONE"}
            ]
        }))
        .unwrap();
        assert!(and_group.evaluate(&scope));

        let or_group: ConditionExpr = serde_json::from_value(json!({
            "logic": "OR",
            "rules": [
                {"field": "priority", "operator": "lt", "value": 5},
                {"field": "state", "operator": "eq", "value": "DONE"}
            ]
        }))
        .unwrap();
        assert!(or_group.evaluate(&scope));

        let not_group: ConditionExpr = serde_json::from_value(json!({
            "logic": "NOT",
            "rules": [
                {"field": "state", "operator": "eq", "value": "OPEN"}
            ]
        }))
        .unwrap();
        assert!(not_group.evaluate(&scope));
    }

    #[test]
    fn test_empty_groups() {
        let scope = Scope::new();
        let and = ConditionExpr::Group(ConditionGroup { logic: LogicOp::And, rules: vec![] });
        let or = ConditionExpr::Group(ConditionGroup { logic: LogicOp::Or, rules: vec![] });
        assert!(and.evaluate(&scope));
        assert!(!or.evaluate(&scope));
    }

    #[test]
    fn test_nested_groups() {
        let scope = scope(json!({"kind": "bug", "severity": 9, "assignee": "unassigned"}));
        let expr: ConditionExpr = serde_json::from_value(json!({
            "logic": "AND",
            "rules": [
                {"field": "kind", "operator": "eq", "value": "bug"},
                {
                    "logic": "OR",
                    "rules": [
                        {"field": "severity", "operator": "gte", "value": 8},
                        {"field": "assignee", "operator": "eq", "value": "oncall"}
                    ]
                }
            ]
        }))
        .unwrap();
        assert!(expr.evaluate(&scope));
    }
}
