// Trigger-boundary filter evaluation
//
// Filters decide whether an inbound event is worth propagating. They share
// the clause grammar with action conditions but are deliberately more
// forgiving: authors inconsistently prefix paths with `trigger_data.`, so
// both forms are tried, and an unknown operator admits the event instead of
// silently dropping it.

use relay_shared::{Condition, ConditionClause, ConditionGroup};
use serde_json::Value;
use tracing::warn;

use super::conditions::{compare_values, resolve_expected};
use super::templates::{get_nested_value, BuiltinVars};

/// Resolve a filter path against the wrapped payload, trying the path both
/// with and without the `trigger_data.` prefix.
fn lookup_tolerant(payload: &Value, path: &str) -> Option<Value> {
    if let Some(v) = get_nested_value(payload, path) {
        return Some(v);
    }
    let alternate = match path.strip_prefix("trigger_data.") {
        Some(stripped) => stripped.to_string(),
        None => format!("trigger_data.{path}"),
    };
    get_nested_value(payload, &alternate)
}

fn clause_admits(clause: &ConditionClause, payload: &Value, builtins: &BuiltinVars) -> bool {
    let expected = resolve_expected(clause.value.as_ref(), payload, builtins);
    let actual = lookup_tolerant(payload, &clause.path);
    let case_insensitive = clause.case_insensitive.unwrap_or(true);

    match compare_values(actual.as_ref(), &clause.op, &expected, case_insensitive) {
        Some(result) => result,
        None => {
            warn!(op = %clause.op, "unknown filter operator, admitting event");
            true
        }
    }
}

fn group_admits(group: &ConditionGroup, payload: &Value, builtins: &BuiltinVars) -> bool {
    if group.clauses.is_empty() {
        return true;
    }

    let operator = group.operator.as_deref().unwrap_or("AND").to_uppercase();
    match operator.as_str() {
        "OR" => group
            .clauses
            .iter()
            .any(|c| condition_admits(c, payload, builtins)),
        other => {
            if other != "AND" {
                warn!(operator = other, "unknown filter group operator, treating as AND");
            }
            group
                .clauses
                .iter()
                .all(|c| condition_admits(c, payload, builtins))
        }
    }
}

fn condition_admits(condition: &Condition, payload: &Value, builtins: &BuiltinVars) -> bool {
    match condition {
        Condition::Clause(clause) => clause_admits(clause, payload, builtins),
        Condition::Group(group) => group_admits(group, payload, builtins),
    }
}

/// Evaluate a trigger filter against an event payload. The payload is
/// wrapped as `{trigger_data: ...}` before evaluation so both path styles
/// resolve. Absent filter admits everything.
pub fn evaluate_filter(
    filter: Option<&Condition>,
    event_data: &Value,
    builtins: &BuiltinVars,
) -> bool {
    let filter = match filter {
        Some(f) => f,
        None => return true,
    };
    let payload = serde_json::json!({ "trigger_data": event_data });
    condition_admits(filter, &payload, builtins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn builtins() -> BuiltinVars {
        BuiltinVars::compute(Utc::now(), None)
    }

    fn cond(v: serde_json::Value) -> Condition {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn absent_filter_admits() {
        assert!(evaluate_filter(None, &json!({"x": 1}), &builtins()));
    }

    #[test]
    fn path_prefix_tolerance() {
        let data = json!({"subject": "Urgent: please reply"});
        let bare = cond(json!({"path": "subject", "op": "contains", "value": "urgent"}));
        let prefixed = cond(json!({
            "path": "trigger_data.subject", "op": "contains", "value": "urgent"
        }));
        assert!(evaluate_filter(Some(&bare), &data, &builtins()));
        assert!(evaluate_filter(Some(&prefixed), &data, &builtins()));
    }

    #[test]
    fn unknown_operator_admits() {
        let data = json!({"subject": "hello"});
        let f = cond(json!({"path": "subject", "op": "fuzzy_match", "value": "x"}));
        assert!(evaluate_filter(Some(&f), &data, &builtins()));
    }

    #[test]
    fn or_group_over_subject_keywords() {
        let data = json!({"subject": "Urgent: please reply", "from": "boss@example.com"});
        let f = cond(json!({
            "operator": "OR",
            "clauses": [
                {"path": "subject", "op": "contains", "value": "urgent"},
                {"path": "subject", "op": "contains", "value": "ASAP"}
            ]
        }));
        assert!(evaluate_filter(Some(&f), &data, &builtins()));
    }

    #[test]
    fn failing_filter_rejects() {
        let data = json!({"score": 95});
        let f = cond(json!({"path": "score", "op": "<", "value": 70}));
        assert!(!evaluate_filter(Some(&f), &data, &builtins()));
    }
}
