//! Condition evaluator.
//!
//! Conditions are a closed AST: leaves compare one field path against a
//! literal, groups combine nodes with all/any semantics. Evaluation is a
//! total function — malformed values and unresolved paths degrade to a
//! documented default (false for comparison operators, true for `is_empty`,
//! false for `not_empty`) instead of erroring.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Leaf comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
    IsEmpty,
    NotEmpty,
}

/// A single condition: (field path, operator, literal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Field path, dot notation for nested fields.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// Group combinator. `All` = AND, `Any` = OR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionGroup {
    All(Vec<ConditionNode>),
    Any(Vec<ConditionNode>),
}

/// A node is either a leaf condition or a nested group; groups nest
/// arbitrarily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group(ConditionGroup),
    Leaf(Condition),
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn eq(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Eq, value)
    }

    pub fn ne(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Ne, value)
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, ConditionOperator::Contains, Value::String(value.to_string()))
    }

    pub fn gt(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::Gt, serde_json::json!(value))
    }

    pub fn lt(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::Lt, serde_json::json!(value))
    }

    pub fn is_empty(field: &str) -> Self {
        Self::new(field, ConditionOperator::IsEmpty, Value::Null)
    }

    pub fn not_empty(field: &str) -> Self {
        Self::new(field, ConditionOperator::NotEmpty, Value::Null)
    }
}

impl ConditionGroup {
    pub fn all(nodes: Vec<ConditionNode>) -> Self {
        Self::All(nodes)
    }

    pub fn any(nodes: Vec<ConditionNode>) -> Self {
        Self::Any(nodes)
    }

    /// Single-leaf AND group, the common case.
    pub fn single(condition: Condition) -> Self {
        Self::All(vec![ConditionNode::Leaf(condition)])
    }

    /// Every field path referenced by any leaf, for the field-changed
    /// trigger check.
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut fields = BTreeSet::new();
        collect_fields(self, &mut fields);
        fields.into_iter().collect()
    }
}

impl From<Condition> for ConditionNode {
    fn from(condition: Condition) -> Self {
        ConditionNode::Leaf(condition)
    }
}

impl From<ConditionGroup> for ConditionNode {
    fn from(group: ConditionGroup) -> Self {
        ConditionNode::Group(group)
    }
}

fn collect_fields(group: &ConditionGroup, fields: &mut BTreeSet<String>) {
    let nodes = match group {
        ConditionGroup::All(nodes) | ConditionGroup::Any(nodes) => nodes,
    };
    for node in nodes {
        match node {
            ConditionNode::Leaf(condition) => {
                fields.insert(condition.field.clone());
            }
            ConditionNode::Group(inner) => collect_fields(inner, fields),
        }
    }
}

/// Evaluates a condition group against a record snapshot.
///
/// Short-circuits: AND stops at the first false node, OR at the first true
/// one, so leaves past the deciding node are never resolved.
pub fn evaluate(group: &ConditionGroup, snapshot: &Value) -> bool {
    match group {
        ConditionGroup::All(nodes) => nodes.iter().all(|n| evaluate_node(n, snapshot)),
        ConditionGroup::Any(nodes) => nodes.iter().any(|n| evaluate_node(n, snapshot)),
    }
}

fn evaluate_node(node: &ConditionNode, snapshot: &Value) -> bool {
    match node {
        ConditionNode::Leaf(condition) => evaluate_condition(condition, snapshot),
        ConditionNode::Group(group) => evaluate(group, snapshot),
    }
}

fn evaluate_condition(condition: &Condition, snapshot: &Value) -> bool {
    let field_value = resolve_path(snapshot, &condition.field);

    match condition.operator {
        ConditionOperator::Eq => field_value.map(|v| v == &condition.value).unwrap_or(false),
        // An unresolved path is "no match" for equality operators, ne
        // included, rather than a vacuous inequality.
        ConditionOperator::Ne => field_value.map(|v| v != &condition.value).unwrap_or(false),
        ConditionOperator::Contains => match field_value {
            Some(Value::String(s)) => condition
                .value
                .as_str()
                .map(|pattern| s.to_lowercase().contains(&pattern.to_lowercase()))
                .unwrap_or(false),
            Some(Value::Array(items)) => items.contains(&condition.value),
            _ => false,
        },
        ConditionOperator::Gt => compare_numeric(field_value, &condition.value, |a, b| a > b),
        ConditionOperator::Gte => compare_numeric(field_value, &condition.value, |a, b| a >= b),
        ConditionOperator::Lt => compare_numeric(field_value, &condition.value, |a, b| a < b),
        ConditionOperator::Lte => compare_numeric(field_value, &condition.value, |a, b| a <= b),
        ConditionOperator::IsEmpty => value_is_empty(field_value),
        ConditionOperator::NotEmpty => !value_is_empty(field_value),
    }
}

fn compare_numeric(field_value: Option<&Value>, literal: &Value, op: fn(f64, f64) -> bool) -> bool {
    match (field_value.and_then(Value::as_f64), literal.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// Emptiness rule shared with blueprint field requirements: missing, null,
/// "" and empty collections are all empty.
pub fn value_is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        _ => false,
    }
}

/// Resolves a dot-path into nested JSON objects, falling back to `None`
/// rather than erroring.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> Value {
        json!({
            "status": "hot_lead",
            "score": 72,
            "tags": ["inbound", "webinar"],
            "owner_id": null,
            "client": { "tier": "gold", "is_vip": true }
        })
    }

    #[test]
    fn test_eq_and_ne() {
        let snap = snapshot();
        assert!(evaluate(&ConditionGroup::single(Condition::eq("status", json!("hot_lead"))), &snap));
        assert!(!evaluate(&ConditionGroup::single(Condition::eq("status", json!("cold"))), &snap));
        assert!(evaluate(&ConditionGroup::single(Condition::ne("status", json!("cold"))), &snap));
        // Unresolved path: no match for both equality operators.
        assert!(!evaluate(&ConditionGroup::single(Condition::eq("missing", json!("x"))), &snap));
        assert!(!evaluate(&ConditionGroup::single(Condition::ne("missing", json!("x"))), &snap));
    }

    #[test]
    fn test_numeric_comparisons() {
        let snap = snapshot();
        assert!(evaluate(&ConditionGroup::single(Condition::gt("score", 50.0)), &snap));
        assert!(!evaluate(&ConditionGroup::single(Condition::lt("score", 50.0)), &snap));
        // Non-numeric field degrades to false.
        assert!(!evaluate(&ConditionGroup::single(Condition::gt("status", 1.0)), &snap));
    }

    #[test]
    fn test_contains_string_and_array() {
        let snap = snapshot();
        assert!(evaluate(&ConditionGroup::single(Condition::contains("status", "HOT")), &snap));
        assert!(evaluate(
            &ConditionGroup::single(Condition::new(
                "tags",
                ConditionOperator::Contains,
                json!("webinar")
            )),
            &snap
        ));
    }

    #[test]
    fn test_emptiness() {
        let snap = snapshot();
        assert!(evaluate(&ConditionGroup::single(Condition::is_empty("owner_id")), &snap));
        assert!(evaluate(&ConditionGroup::single(Condition::is_empty("missing.path")), &snap));
        assert!(evaluate(&ConditionGroup::single(Condition::not_empty("client.tier")), &snap));
        assert!(!evaluate(&ConditionGroup::single(Condition::not_empty("missing")), &snap));
    }

    #[test]
    fn test_nested_groups_and_dot_paths() {
        let snap = snapshot();
        let group = ConditionGroup::all(vec![
            Condition::eq("client.is_vip", json!(true)).into(),
            ConditionGroup::any(vec![
                Condition::eq("status", json!("hot_lead")).into(),
                Condition::gt("score", 90.0).into(),
            ])
            .into(),
        ]);
        assert!(evaluate(&group, &snap));
    }

    #[test]
    fn test_total_on_malformed_leaves() {
        let snap = snapshot();
        // A failing AND leaf decides the group before later malformed
        // leaves are reached; either way evaluation never panics.
        let group = ConditionGroup::all(vec![
            Condition::eq("status", json!("cold")).into(),
            Condition::gt("tags", 3.0).into(),
            Condition::eq("deeply.missing.path", json!({"a": 1})).into(),
        ]);
        assert!(!evaluate(&group, &snap));

        let group = ConditionGroup::any(vec![
            Condition::eq("status", json!("hot_lead")).into(),
            Condition::gt("tags", 3.0).into(),
        ]);
        assert!(evaluate(&group, &snap));
    }

    #[test]
    fn test_referenced_fields() {
        let group = ConditionGroup::all(vec![
            Condition::eq("status", json!("hot_lead")).into(),
            ConditionGroup::any(vec![
                Condition::gt("score", 50.0).into(),
                Condition::eq("status", json!("warm")).into(),
            ])
            .into(),
        ]);
        assert_eq!(group.referenced_fields(), vec!["score", "status"]);
    }

    #[test]
    fn test_serde_shape() {
        let group = ConditionGroup::all(vec![Condition::eq("status", json!("hot_lead")).into()]);
        let value = serde_json::to_value(&group).unwrap();
        assert!(value.get("all").is_some());

        let parsed: ConditionGroup = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, group);
    }
}
