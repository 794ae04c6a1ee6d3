// Aggregation modes
//
// How a poll's new-item set becomes queue events. `per_item` fans out,
// `batch` folds the survivors into one event, `summary` computes numeric
// stats, and `latest` (the health default) forwards the raw tool output so
// filter paths keep matching the tool's documented return shape.

use chrono::{DateTime, Utc};
use relay_shared::{AggregationMode, Condition};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::engine::{evaluate_filter, BuiltinVars};
use crate::poller::cursor::item_cursor;

/// An event the poll wants enqueued, before it has a queue row.
#[derive(Debug, Clone)]
pub struct PollEventDraft {
    pub event_type: String,
    pub event_id: String,
    pub payload: Value,
}

pub struct AggregationInput<'a> {
    pub mode: AggregationMode,
    pub service: &'a str,
    pub automation_id: Uuid,
    pub event_type: &'a str,
    pub filter: Option<&'a Condition>,
    pub new_items: &'a [Value],
    /// The tool's unmodified output, used by `latest`.
    pub raw_output: &'a Value,
    pub now: DateTime<Utc>,
}

pub struct AggregationOutcome {
    pub events: Vec<PollEventDraft>,
    /// Items that were new but suppressed by the trigger filter.
    pub filtered_out: usize,
}

fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A stable per-item event id: the item's own identifier when it has one,
/// otherwise a synthesized `{service}_{automation}_{cursor}` key.
fn item_event_id(service: &str, automation_id: Uuid, item: &Value, index: usize) -> String {
    for key in ["id", "event_id", "uuid", "ts"] {
        if let Some(v) = item.get(key) {
            if !v.is_null() {
                return format!("{service}_{}", scalar_string(v));
            }
        }
    }
    let suffix = item_cursor(item).unwrap_or_else(|| index.to_string());
    format!("{service}_{automation_id}_{suffix}")
}

fn tag_object(payload: &mut Map<String, Value>, event_type: &str, automation_id: Uuid) {
    payload.insert("type".into(), Value::String(event_type.to_string()));
    payload.insert(
        "automation_id".into(),
        Value::String(automation_id.to_string()),
    );
}

pub fn build_events(input: &AggregationInput<'_>, builtins: &BuiltinVars) -> AggregationOutcome {
    match input.mode {
        AggregationMode::PerItem => per_item(input, builtins),
        AggregationMode::Batch => batch(input, builtins),
        AggregationMode::Summary => summary(input, builtins),
        AggregationMode::Latest => latest(input, builtins),
    }
}

/// One event per new item passing the filter, item as payload.
fn per_item(input: &AggregationInput<'_>, builtins: &BuiltinVars) -> AggregationOutcome {
    let mut events = Vec::new();
    let mut filtered_out = 0;

    for (index, item) in input.new_items.iter().enumerate() {
        if !evaluate_filter(input.filter, item, builtins) {
            filtered_out += 1;
            continue;
        }

        let mut payload = match item {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other.clone());
                map
            }
        };
        tag_object(&mut payload, input.event_type, input.automation_id);

        events.push(PollEventDraft {
            event_type: input.event_type.to_string(),
            event_id: item_event_id(input.service, input.automation_id, item, index),
            payload: Value::Object(payload),
        });
    }

    AggregationOutcome {
        events,
        filtered_out,
    }
}

/// One event carrying every surviving item.
fn batch(input: &AggregationInput<'_>, builtins: &BuiltinVars) -> AggregationOutcome {
    let surviving: Vec<Value> = input
        .new_items
        .iter()
        .filter(|item| evaluate_filter(input.filter, item, builtins))
        .cloned()
        .collect();
    let filtered_out = input.new_items.len() - surviving.len();

    if surviving.is_empty() {
        return AggregationOutcome {
            events: vec![],
            filtered_out,
        };
    }

    let mut payload = Map::new();
    payload.insert("items".into(), Value::Array(surviving.clone()));
    payload.insert("count".into(), json!(surviving.len()));
    payload.insert("_aggregation".into(), json!("batch"));
    tag_object(&mut payload, input.event_type, input.automation_id);

    AggregationOutcome {
        events: vec![PollEventDraft {
            event_type: input.event_type.to_string(),
            event_id: format!(
                "{}_{}_{}",
                input.service,
                input.automation_id,
                input.now.timestamp()
            ),
            payload: Value::Object(payload),
        }],
        filtered_out,
    }
}

/// One event with min/max/avg of every numeric field of the first item,
/// computed across the surviving set.
fn summary(input: &AggregationInput<'_>, builtins: &BuiltinVars) -> AggregationOutcome {
    let surviving: Vec<&Value> = input
        .new_items
        .iter()
        .filter(|item| evaluate_filter(input.filter, item, builtins))
        .collect();
    let filtered_out = input.new_items.len() - surviving.len();

    let Some(first) = surviving.first() else {
        return AggregationOutcome {
            events: vec![],
            filtered_out,
        };
    };

    let mut payload = Map::new();
    if let Some(fields) = first.as_object() {
        for (field, value) in fields {
            if !value.is_number() {
                continue;
            }
            let samples: Vec<f64> = surviving
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_f64))
                .collect();
            if samples.is_empty() {
                continue;
            }
            let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let avg = samples.iter().sum::<f64>() / samples.len() as f64;
            payload.insert(
                format!("{field}_stats"),
                json!({"min": min, "max": max, "avg": avg, "count": samples.len()}),
            );
        }
    }
    payload.insert("latest".into(), (*surviving.last().unwrap()).clone());
    payload.insert("_aggregation".into(), json!("summary"));
    tag_object(&mut payload, input.event_type, input.automation_id);

    AggregationOutcome {
        events: vec![PollEventDraft {
            event_type: input.event_type.to_string(),
            event_id: format!(
                "{}_{}_{}",
                input.service,
                input.automation_id,
                input.now.timestamp()
            ),
            payload: Value::Object(payload),
        }],
        filtered_out,
    }
}

/// Health default: the filter runs against the raw tool output so authored
/// paths keep matching the tool's documented schema, and the payload
/// preserves the output's top-level shape. Arrays stay arrays; primitives
/// become `{type, message}`.
fn latest(input: &AggregationInput<'_>, builtins: &BuiltinVars) -> AggregationOutcome {
    if input.new_items.is_empty() {
        return AggregationOutcome {
            events: vec![],
            filtered_out: 0,
        };
    }

    if !evaluate_filter(input.filter, input.raw_output, builtins) {
        return AggregationOutcome {
            events: vec![],
            filtered_out: 1,
        };
    }

    let payload = match input.raw_output {
        Value::Object(map) => {
            let mut payload = map.clone();
            tag_object(&mut payload, input.event_type, input.automation_id);
            Value::Object(payload)
        }
        Value::Array(items) => Value::Array(items.clone()),
        primitive => json!({
            "type": input.event_type,
            "message": primitive,
        }),
    };

    let suffix = input
        .new_items
        .iter()
        .filter_map(item_cursor)
        .next_back()
        .unwrap_or_else(|| input.now.timestamp().to_string());

    AggregationOutcome {
        events: vec![PollEventDraft {
            event_type: input.event_type.to_string(),
            event_id: format!("{}_{}_{}", input.service, input.automation_id, suffix),
            payload,
        }],
        filtered_out: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtins() -> BuiltinVars {
        BuiltinVars::compute(Utc::now(), None)
    }

    fn cond(v: Value) -> Condition {
        serde_json::from_value(v).unwrap()
    }

    fn input<'a>(
        mode: AggregationMode,
        filter: Option<&'a Condition>,
        new_items: &'a [Value],
        raw_output: &'a Value,
        automation_id: Uuid,
    ) -> AggregationInput<'a> {
        AggregationInput {
            mode,
            service: "todoist",
            automation_id,
            event_type: "task_update",
            filter,
            new_items,
            raw_output,
            now: "2025-02-27T10:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn per_item_fans_out_with_filter() {
        let filter = cond(json!({"path": "priority", "op": ">=", "value": 3}));
        let items = vec![
            json!({"id": 1, "priority": 4, "date": "2025-02-27"}),
            json!({"id": 2, "priority": 1, "date": "2025-02-27"}),
            json!({"id": 3, "priority": 3, "date": "2025-02-27"}),
        ];
        let raw = json!({"items": items.clone()});
        let id = Uuid::new_v4();
        let out = build_events(
            &input(AggregationMode::PerItem, Some(&filter), &items, &raw, id),
            &builtins(),
        );

        assert_eq!(out.events.len(), 2);
        assert_eq!(out.filtered_out, 1);
        assert_eq!(out.events[0].event_id, "todoist_1");
        assert_eq!(out.events[0].payload["type"], "task_update");
        assert_eq!(out.events[0].payload["automation_id"], id.to_string());
    }

    #[test]
    fn batch_folds_survivors_into_one_event() {
        let items = vec![json!({"id": 1}), json!({"id": 2})];
        let raw = json!({"items": items.clone()});
        let out = build_events(
            &input(AggregationMode::Batch, None, &items, &raw, Uuid::new_v4()),
            &builtins(),
        );

        assert_eq!(out.events.len(), 1);
        let payload = &out.events[0].payload;
        assert_eq!(payload["count"], 2);
        assert_eq!(payload["_aggregation"], "batch");
        assert_eq!(payload["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn batch_with_no_survivors_emits_nothing() {
        let filter = cond(json!({"path": "priority", "op": ">", "value": 10}));
        let items = vec![json!({"id": 1, "priority": 1})];
        let raw = json!({});
        let out = build_events(
            &input(AggregationMode::Batch, Some(&filter), &items, &raw, Uuid::new_v4()),
            &builtins(),
        );
        assert!(out.events.is_empty());
        assert_eq!(out.filtered_out, 1);
    }

    #[test]
    fn summary_computes_numeric_stats() {
        let items = vec![
            json!({"score": 60.0, "label": "a"}),
            json!({"score": 70.0, "label": "b"}),
            json!({"score": 80.0, "label": "c"}),
        ];
        let raw = json!({});
        let out = build_events(
            &input(AggregationMode::Summary, None, &items, &raw, Uuid::new_v4()),
            &builtins(),
        );

        let payload = &out.events[0].payload;
        assert_eq!(payload["score_stats"]["min"], 60.0);
        assert_eq!(payload["score_stats"]["max"], 80.0);
        assert_eq!(payload["score_stats"]["avg"], 70.0);
        assert_eq!(payload["latest"]["label"], "c");
        assert_eq!(payload["_aggregation"], "summary");
        assert!(payload.get("label_stats").is_none());
    }

    #[test]
    fn latest_filters_against_raw_output() {
        // The filter path targets the tool's documented return shape, not
        // the extracted item.
        let filter = cond(json!({"path": "data.0.score", "op": "<", "value": 70}));
        let items = vec![json!({"day": "2025-02-27", "score": 65})];
        let raw = json!({"data": [{"day": "2025-02-27", "score": 65}]});
        let id = Uuid::new_v4();
        let out = build_events(
            &input(AggregationMode::Latest, Some(&filter), &items, &raw, id),
            &builtins(),
        );

        assert_eq!(out.events.len(), 1);
        let event = &out.events[0];
        // Payload preserves the raw top-level shape.
        assert!(event.payload.get("data").is_some());
        assert_eq!(event.event_id, format!("todoist_{id}_2025-02-27"));
    }

    #[test]
    fn latest_failing_filter_emits_nothing() {
        let filter = cond(json!({"path": "data.0.score", "op": "<", "value": 50}));
        let items = vec![json!({"day": "2025-02-27", "score": 65})];
        let raw = json!({"data": [{"day": "2025-02-27", "score": 65}]});
        let out = build_events(
            &input(AggregationMode::Latest, Some(&filter), &items, &raw, Uuid::new_v4()),
            &builtins(),
        );
        assert!(out.events.is_empty());
        assert_eq!(out.filtered_out, 1);
    }

    #[test]
    fn latest_array_output_stays_an_array() {
        let items = vec![json!({"ts": "1.1"}), json!({"ts": "2.2"})];
        let raw = json!([{"ts": "1.1"}, {"ts": "2.2"}]);
        let out = build_events(
            &input(AggregationMode::Latest, None, &items, &raw, Uuid::new_v4()),
            &builtins(),
        );
        assert!(out.events[0].payload.is_array());
    }

    #[test]
    fn latest_primitive_output_becomes_message() {
        let items = vec![json!({"state": "ok"})];
        let raw = json!("all good");
        let out = build_events(
            &input(AggregationMode::Latest, None, &items, &raw, Uuid::new_v4()),
            &builtins(),
        );
        assert_eq!(out.events[0].payload["message"], "all good");
        assert_eq!(out.events[0].payload["type"], "task_update");
    }
}
