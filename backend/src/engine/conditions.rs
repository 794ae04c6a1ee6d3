// Condition evaluation for automation actions

use relay_shared::{Condition, ConditionClause, ConditionGroup};
use serde_json::Value;
use tracing::warn;

use super::templates::{get_nested_value, resolve_template, BuiltinVars};

/// Numeric view of a JSON value, accepting numbers, numeric strings and
/// booleans.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_comparable_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn string_pair(actual: &Value, expected: &Value, case_insensitive: bool) -> (String, String) {
    let a = as_comparable_string(actual);
    let e = as_comparable_string(expected);
    if case_insensitive {
        (a.to_lowercase(), e.to_lowercase())
    } else {
        (a, e)
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return a == e;
    }
    as_comparable_string(actual) == as_comparable_string(expected)
}

/// Compare two values with the given operator. Returns `None` for an
/// unknown operator so callers can pick their own policy (conditions
/// reject, trigger filters admit).
///
/// Ordering operators coerce both sides through numeric parsing and fail
/// closed; string operators lowercase both sides unless `case_insensitive`
/// is false; `exists`/`not_exists` treat null and missing alike.
pub(crate) fn compare_values(
    actual: Option<&Value>,
    op: &str,
    expected: &Value,
    case_insensitive: bool,
) -> Option<bool> {
    match op {
        "exists" => return Some(actual.is_some()),
        "not_exists" => return Some(actual.is_none()),
        _ => {}
    }

    let actual = match actual {
        Some(v) => v,
        None => return Some(false),
    };

    match op {
        "<" | ">" | "<=" | ">=" => {
            let (a, e) = match (as_number(actual), as_number(expected)) {
                (Some(a), Some(e)) => (a, e),
                _ => {
                    warn!(op, "cannot compare non-numeric values");
                    return Some(false);
                }
            };
            Some(match op {
                "<" => a < e,
                ">" => a > e,
                "<=" => a <= e,
                _ => a >= e,
            })
        }
        "==" | "eq" => Some(values_equal(actual, expected)),
        "!=" | "neq" => Some(!values_equal(actual, expected)),
        "contains" => {
            let (a, e) = string_pair(actual, expected, case_insensitive);
            Some(a.contains(&e))
        }
        "not_contains" => {
            let (a, e) = string_pair(actual, expected, case_insensitive);
            Some(!a.contains(&e))
        }
        "contains_any" => {
            let candidates: Vec<&Value> = match expected {
                Value::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            Some(candidates.iter().any(|candidate| {
                let (a, e) = string_pair(actual, candidate, case_insensitive);
                a.contains(&e)
            }))
        }
        "starts_with" => {
            let (a, e) = string_pair(actual, expected, case_insensitive);
            Some(a.starts_with(&e))
        }
        "ends_with" => {
            let (a, e) = string_pair(actual, expected, case_insensitive);
            Some(a.ends_with(&e))
        }
        _ => None,
    }
}

/// Resolve a clause's expected value: strings may themselves be templates,
/// and numeric-looking results are compared as numbers.
pub(crate) fn resolve_expected(
    expected: Option<&Value>,
    context: &Value,
    builtins: &BuiltinVars,
) -> Value {
    match expected {
        Some(Value::String(s)) => {
            let resolved = resolve_template(s, context, builtins);
            if let Ok(n) = resolved.trim().parse::<i64>() {
                return Value::from(n);
            }
            if let Ok(f) = resolved.trim().parse::<f64>() {
                if let Some(n) = serde_json::Number::from_f64(f) {
                    return Value::Number(n);
                }
            }
            Value::String(resolved)
        }
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn evaluate_clause(clause: &ConditionClause, context: &Value, builtins: &BuiltinVars) -> bool {
    let expected = resolve_expected(clause.value.as_ref(), context, builtins);
    let actual = get_nested_value(context, &clause.path);
    let case_insensitive = clause.case_insensitive.unwrap_or(true);

    match compare_values(actual.as_ref(), &clause.op, &expected, case_insensitive) {
        Some(result) => result,
        None => {
            warn!(op = %clause.op, "unknown comparison operator in condition");
            false
        }
    }
}

fn evaluate_group(group: &ConditionGroup, context: &Value, builtins: &BuiltinVars) -> bool {
    if group.clauses.is_empty() {
        return true;
    }

    let operator = group.operator.as_deref().unwrap_or("AND").to_uppercase();
    match operator.as_str() {
        "AND" => group
            .clauses
            .iter()
            .all(|c| evaluate_condition(c, context, builtins)),
        "OR" => group
            .clauses
            .iter()
            .any(|c| evaluate_condition(c, context, builtins)),
        other => {
            warn!(operator = other, "unknown logical operator in condition");
            false
        }
    }
}

/// Evaluate an action condition against the execution context.
///
/// Never fails: unknown operators and unresolvable paths degrade to false.
pub fn evaluate_condition(condition: &Condition, context: &Value, builtins: &BuiltinVars) -> bool {
    match condition {
        Condition::Clause(clause) => evaluate_clause(clause, context, builtins),
        Condition::Group(group) => evaluate_group(group, context, builtins),
    }
}
