// Template resolution - {{variable}} substitution over the execution context

use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").expect("template regex"))
}

fn bracket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("bracket regex"))
}

/// Get a nested value from JSON using dot notation.
///
/// Supports `data[0].score` and `data.0.score` array indexing, negative
/// indices (`-1` = last element), and string-keyed numeric entries for
/// arrays that were spread into objects. A leading `0` segment over a plain
/// object is skipped: per-item aggregation hands the executor a single item
/// while authors keep writing array-shaped paths like `0.subject`.
///
/// JSON `null` collapses to `None` so existence checks treat null and
/// missing alike.
pub fn get_nested_value(data: &Value, path: &str) -> Option<Value> {
    if data.is_null() {
        return None;
    }

    let normalized = bracket_re().replace_all(path, ".$1");
    let parts: Vec<&str> = normalized.split('.').collect();

    let mut current = data;
    let mut i = 0;
    while i < parts.len() {
        let part = parts[i];
        if current.is_null() {
            return None;
        }

        if let Ok(idx) = part.parse::<i64>() {
            match current {
                Value::Array(arr) => {
                    let len = arr.len() as i64;
                    let resolved = if idx < 0 { len + idx } else { idx };
                    if resolved < 0 || resolved >= len {
                        return None;
                    }
                    current = &arr[resolved as usize];
                }
                Value::Object(map) if map.contains_key(part) => {
                    current = &map[part];
                }
                Value::Object(_) if idx == 0 => {
                    // Single-object payload, array-shaped path: skip the index.
                    i += 1;
                    continue;
                }
                _ => return None,
            }
        } else {
            match current {
                Value::Object(map) => match map.get(part) {
                    Some(v) => current = v,
                    None => return None,
                },
                _ => return None,
            }
        }

        i += 1;
    }

    if current.is_null() {
        None
    } else {
        Some(current.clone())
    }
}

/// Date/time built-in variables, computed once per execution so every
/// template in a run sees the same instant.
///
/// Date values use the user's timezone with a UTC fallback; `now` and its
/// offsets are always UTC.
#[derive(Debug, Clone)]
pub struct BuiltinVars {
    vars: HashMap<&'static str, String>,
}

impl BuiltinVars {
    pub fn compute(now_utc: DateTime<Utc>, timezone: Option<&str>) -> Self {
        let user_today = match timezone {
            Some(tz_str) if !tz_str.is_empty() => match tz_str.parse::<Tz>() {
                Ok(tz) => now_utc.with_timezone(&tz).date_naive(),
                Err(_) => {
                    warn!(timezone = tz_str, "invalid timezone, falling back to UTC");
                    now_utc.date_naive()
                }
            },
            _ => now_utc.date_naive(),
        };
        let utc_today = now_utc.date_naive();

        let iso = |d: chrono::NaiveDate| d.format("%Y-%m-%d").to_string();
        let ts = |dt: DateTime<Utc>| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let monday = user_today - Duration::days(user_today.weekday().num_days_from_monday() as i64);
        let sunday = monday + Duration::days(6);

        let mut vars = HashMap::new();
        vars.insert("today", iso(user_today));
        vars.insert("tomorrow", iso(user_today + Duration::days(1)));
        vars.insert("yesterday", iso(user_today - Duration::days(1)));
        vars.insert("two_days_ago", iso(user_today - Duration::days(2)));
        vars.insert("this_week_start", iso(monday));
        vars.insert("this_week_end", iso(sunday));
        vars.insert("now", ts(now_utc));
        // Offsets for health sources with sync delays.
        vars.insert("now_minus_1h", ts(now_utc - Duration::hours(1)));
        vars.insert("now_minus_6h", ts(now_utc - Duration::hours(6)));
        vars.insert("now_minus_12h", ts(now_utc - Duration::hours(12)));
        vars.insert("now_minus_24h", ts(now_utc - Duration::hours(24)));
        vars.insert("today_utc", iso(utc_today));
        vars.insert("yesterday_utc", iso(utc_today - Duration::days(1)));
        vars.insert("tomorrow_utc", iso(utc_today + Duration::days(1)));
        // Legacy _local variants, now identical to the defaults.
        vars.insert("today_local", iso(user_today));
        vars.insert("yesterday_local", iso(user_today - Duration::days(1)));
        vars.insert("tomorrow_local", iso(user_today + Duration::days(1)));

        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Resolve `{{variable}}` placeholders in a template string.
///
/// Unresolved paths render as the empty string; non-scalar values are
/// serialized as JSON.
pub fn resolve_template(template: &str, context: &Value, builtins: &BuiltinVars) -> String {
    template_re()
        .replace_all(template, |caps: &regex::Captures| {
            let var_path = caps[1].trim();

            if let Some(v) = builtins.get(var_path) {
                return v.to_string();
            }

            match get_nested_value(context, var_path) {
                Some(value) => render_value(&value),
                None => {
                    debug!(path = var_path, "template variable not found");
                    String::new()
                }
            }
        })
        .to_string()
}

/// True when the string is exactly one `{{path}}` template.
fn whole_template(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let caps = template_re().captures(trimmed)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == trimmed.len() {
        Some(caps.get(1).map(|m| m.as_str().trim()).unwrap_or(""))
    } else {
        None
    }
}

/// Resolve a single parameter string. A string that is exactly one template
/// passes the raw context value through; when that value does not exist the
/// result is `None` so the parameter is dropped rather than sent as "".
fn resolve_param_string(s: &str, context: &Value, builtins: &BuiltinVars) -> Option<Value> {
    if let Some(path) = whole_template(s) {
        if let Some(v) = builtins.get(path) {
            return Some(Value::String(v.to_string()));
        }
        return match get_nested_value(context, path) {
            Some(value) => Some(value),
            None => {
                debug!(path, "whole-template parameter unresolved, dropping");
                None
            }
        };
    }
    Some(Value::String(resolve_template(s, context, builtins)))
}

/// Recursively resolve template variables in an action's parameters.
///
/// Map entries whose value is a single unresolvable template are omitted so
/// downstream tools see an absent parameter; inside arrays the slot is kept
/// as `null` to preserve positions.
pub fn resolve_parameters(params: &Value, context: &Value, builtins: &BuiltinVars) -> Value {
    match params {
        Value::Object(map) => {
            let mut resolved = serde_json::Map::new();
            for (key, value) in map {
                match value {
                    Value::String(s) => {
                        if let Some(v) = resolve_param_string(s, context, builtins) {
                            resolved.insert(key.clone(), v);
                        }
                    }
                    nested @ (Value::Object(_) | Value::Array(_)) => {
                        resolved.insert(key.clone(), resolve_parameters(nested, context, builtins));
                    }
                    other => {
                        resolved.insert(key.clone(), other.clone());
                    }
                }
            }
            Value::Object(resolved)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => {
                        resolve_param_string(s, context, builtins).unwrap_or(Value::Null)
                    }
                    nested @ (Value::Object(_) | Value::Array(_)) => {
                        resolve_parameters(nested, context, builtins)
                    }
                    other => other.clone(),
                })
                .collect(),
        ),
        Value::String(s) => resolve_param_string(s, context, builtins).unwrap_or(Value::Null),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builtins() -> BuiltinVars {
        BuiltinVars::compute(Utc::now(), Some("UTC"))
    }

    #[test]
    fn nested_access_dot_and_bracket() {
        let data = json!({"items": [{"id": 1}, {"id": 2}]});
        assert_eq!(get_nested_value(&data, "items[0].id"), Some(json!(1)));
        assert_eq!(get_nested_value(&data, "items.1.id"), Some(json!(2)));
    }

    #[test]
    fn negative_indexing() {
        let data = json!({"items": [1, 2, 3, 4]});
        assert_eq!(get_nested_value(&data, "items.-1"), Some(json!(4)));
        assert_eq!(get_nested_value(&data, "items.-2"), Some(json!(3)));
        assert_eq!(get_nested_value(&data, "items.-5"), None);
    }

    #[test]
    fn missing_paths_and_null_collapse() {
        let data = json!({"a": {"b": 1, "c": null}});
        assert_eq!(get_nested_value(&data, "a.x"), None);
        assert_eq!(get_nested_value(&data, "x.y.z"), None);
        assert_eq!(get_nested_value(&data, "a.c"), None);
    }

    #[test]
    fn per_item_index_fallback() {
        // Single-object payload with an array-shaped author path.
        let data = json!({"subject": "Test", "score": 85});
        assert_eq!(get_nested_value(&data, "0.subject"), Some(json!("Test")));
        assert_eq!(get_nested_value(&data, "0.score"), Some(json!(85)));
    }

    #[test]
    fn spread_array_string_keys() {
        let data = json!({"0": {"score": 70}});
        assert_eq!(get_nested_value(&data, "0.score"), Some(json!(70)));
    }

    #[test]
    fn simple_substitution() {
        let ctx = json!({"name": "Alice", "score": 85});
        let out = resolve_template("Hello {{name}}, your score is {{score}}", &ctx, &builtins());
        assert_eq!(out, "Hello Alice, your score is 85");
    }

    #[test]
    fn template_idempotent_without_placeholders() {
        let ctx = json!({});
        let s = "no placeholders here {not one}";
        assert_eq!(resolve_template(s, &ctx, &builtins()), s);
    }

    #[test]
    fn unresolved_renders_empty_within_string() {
        let ctx = json!({"name": "Alice"});
        let out = resolve_template("Hello {{name}}, score: {{missing}}", &ctx, &builtins());
        assert_eq!(out, "Hello Alice, score: ");
    }

    #[test]
    fn complex_values_render_as_json() {
        let ctx = json!({"data": {"items": [1, 2, 3]}});
        let out = resolve_template("Data: {{data}}", &ctx, &builtins());
        assert!(out.contains("\"items\""));
        assert!(out.contains("[1,2,3]"));
    }

    #[test]
    fn builtin_dates_have_iso_shape() {
        let now = "2025-02-27T10:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let vars = BuiltinVars::compute(now, None);
        assert_eq!(vars.get("today"), Some("2025-02-27"));
        assert_eq!(vars.get("yesterday"), Some("2025-02-26"));
        assert_eq!(vars.get("tomorrow"), Some("2025-02-28"));
        assert_eq!(vars.get("two_days_ago"), Some("2025-02-25"));
        // 2025-02-27 is a Thursday.
        assert_eq!(vars.get("this_week_start"), Some("2025-02-24"));
        assert_eq!(vars.get("this_week_end"), Some("2025-03-02"));
        assert_eq!(vars.get("now"), Some("2025-02-27T10:30:00Z"));
        assert_eq!(vars.get("now_minus_6h"), Some("2025-02-27T04:30:00Z"));
    }

    #[test]
    fn builtin_dates_respect_timezone() {
        // 03:00 UTC is still the previous day in Los Angeles.
        let now = "2025-02-27T03:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let vars = BuiltinVars::compute(now, Some("America/Los_Angeles"));
        assert_eq!(vars.get("today"), Some("2025-02-26"));
        assert_eq!(vars.get("today_utc"), Some("2025-02-27"));
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc() {
        let now = "2025-02-27T03:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let vars = BuiltinVars::compute(now, Some("Mars/Olympus_Mons"));
        assert_eq!(vars.get("today"), Some("2025-02-27"));
    }

    #[test]
    fn whole_template_param_passes_raw_value() {
        let ctx = json!({"payload": {"ids": [1, 2]}});
        let params = json!({"target": "{{payload.ids}}", "label": "ids: {{payload.ids}}"});
        let out = resolve_parameters(&params, &ctx, &builtins());
        assert_eq!(out["target"], json!([1, 2]));
        assert_eq!(out["label"], json!("ids: [1,2]"));
    }

    #[test]
    fn whole_template_param_unresolved_is_dropped() {
        let ctx = json!({"present": 1});
        let params = json!({"keep": "{{present}}", "drop": "{{absent}}"});
        let out = resolve_parameters(&params, &ctx, &builtins());
        assert_eq!(out["keep"], json!(1));
        assert!(out.as_object().unwrap().get("drop").is_none());
    }

    #[test]
    fn nested_parameters_resolve_recursively() {
        let ctx = json!({"user": {"email": "a@b.c"}, "n": 7});
        let params = json!({
            "to": "{{user.email}}",
            "options": {"count": "{{n}}", "flags": ["{{n}}", "literal"]}
        });
        let out = resolve_parameters(&params, &ctx, &builtins());
        assert_eq!(out["to"], json!("a@b.c"));
        assert_eq!(out["options"]["count"], json!(7));
        assert_eq!(out["options"]["flags"], json!([7, "literal"]));
    }
}
