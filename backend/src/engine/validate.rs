// Authoring-time validation for action lists
//
// The executor is forgiving at runtime; this pass gives authors (and the
// agent that writes automation JSON) actionable errors up front.

use relay_shared::{Action, RESERVED_CONTEXT_KEYS};
use serde_json::Value;

/// Validate an automation's action list. Returns every problem found, not
/// just the first.
pub fn validate_actions(actions: &[Action]) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if actions.is_empty() {
        errors.push("automation has no actions".to_string());
    }

    let mut seen_ids = std::collections::HashSet::new();
    for action in actions {
        if action.id.is_empty() {
            errors.push("action is missing an id".to_string());
        } else if !seen_ids.insert(action.id.as_str()) {
            errors.push(format!("duplicate action id: {}", action.id));
        }

        if action.tool.is_empty() {
            errors.push(format!("action {} has no tool", action.id));
        }

        if let Some(name) = &action.output_as {
            if RESERVED_CONTEXT_KEYS.contains(&name.as_str()) {
                errors.push(format!(
                    "action {}: output_as \"{name}\" collides with a reserved context key",
                    action.id
                ));
            }
        }

        check_templates(&action.parameters, &action.id, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_templates(value: &Value, action_id: &str, errors: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if s.contains("{{#") {
                errors.push(format!(
                    "action {action_id}: control-flow templates ({{{{#if}}}}, {{{{#each}}}}) are \
                     not supported; express branches as separate conditional actions"
                ));
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                check_templates(v, action_id, errors);
            }
        }
        Value::Array(items) => {
            for v in items {
                check_templates(v, action_id, errors);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn actions(v: Value) -> Vec<Action> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn valid_actions_pass() {
        let list = actions(json!([
            {"id": "a1", "tool": "t1", "parameters": {"x": "{{today}}"}},
            {"id": "a2", "tool": "t2", "output_as": "result"}
        ]));
        assert!(validate_actions(&list).is_ok());
    }

    #[test]
    fn control_flow_templates_rejected() {
        let list = actions(json!([
            {"id": "a1", "tool": "t1", "parameters": {"body": "{{#if score}}hi{{/if}}"}}
        ]));
        let errors = validate_actions(&list).unwrap_err();
        assert!(errors[0].contains("control-flow"));
    }

    #[test]
    fn reserved_output_as_rejected() {
        let list = actions(json!([
            {"id": "a1", "tool": "t1", "output_as": "trigger_data"}
        ]));
        let errors = validate_actions(&list).unwrap_err();
        assert!(errors[0].contains("reserved"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let list = actions(json!([
            {"id": "a1", "tool": "t1"},
            {"id": "a1", "tool": "t2"}
        ]));
        assert!(validate_actions(&list).is_err());
    }
}
