// Deterministic sample data for engine tests

use chrono::{DateTime, Utc};
use relay_shared::{Action, UserInfo};
use serde_json::{json, Value};
use uuid::Uuid;

pub fn fixed_now() -> DateTime<Utc> {
    "2025-02-27T09:00:00Z".parse().unwrap()
}

pub fn user() -> UserInfo {
    UserInfo {
        id: Uuid::new_v4(),
        email: "owner@example.com".into(),
        timezone: Some("UTC".into()),
        name: Some("Owner".into()),
        phone: Some("+15555550100".into()),
    }
}

pub fn actions(v: Value) -> Vec<Action> {
    serde_json::from_value(v).unwrap()
}

/// The Oura daily-sleep shape used throughout the health-polling tests.
pub fn oura_sleep_output(day: &str, score: i64) -> Value {
    json!({"data": [{"day": day, "score": score}]})
}

/// A Slack message event as ingress normalizes it.
pub fn slack_message_event(from: &str, subject: &str) -> Value {
    json!({
        "type": "message",
        "from": from,
        "subject": subject,
        "channel": "C042",
        "ts": "1700000000.000100"
    })
}

/// Three Todoist tasks with ascending timestamps; two are high priority.
pub fn todoist_tasks_output() -> Value {
    json!({
        "items": [
            {"id": 101, "content": "File expenses", "priority": 4, "created_at": "2025-02-27T08:00:00Z"},
            {"id": 102, "content": "Water plants", "priority": 1, "created_at": "2025-02-27T08:30:00Z"},
            {"id": 103, "content": "Prep demo", "priority": 4, "created_at": "2025-02-27T08:45:00Z"}
        ]
    })
}
