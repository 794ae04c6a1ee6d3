use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Error identifier returned by service tools when a usage limit is hit.
pub const USAGE_LIMIT_ERROR: &str = "USAGE_LIMIT_EXCEEDED";

/// Context keys the executor reserves; `output_as` names must not collide.
pub const RESERVED_CONTEXT_KEYS: &[&str] = &["user", "trigger_data"];

/// What causes an automation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Polling,
    ScheduleOnce,
    ScheduleRecurring,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Polling => "polling",
            Self::ScheduleOnce => "schedule_once",
            Self::ScheduleRecurring => "schedule_recurring",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook" => Some(Self::Webhook),
            "polling" => Some(Self::Polling),
            "schedule_once" => Some(Self::ScheduleOnce),
            // Legacy records used a bare "schedule" before the once/recurring split.
            "schedule_recurring" | "schedule" => Some(Self::ScheduleRecurring),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn is_schedule(&self) -> bool {
        matches!(self, Self::ScheduleOnce | Self::ScheduleRecurring)
    }
}

/// Lifecycle state of an automation record. The agent creates records in
/// `pending_review`; the user confirms them to `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    PendingReview,
    Active,
    Paused,
    Disabled,
}

impl AutomationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
        }
    }
}

/// A single condition clause: dotted path, operator, expected value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionClause {
    pub path: String,
    #[serde(default = "default_op")]
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// String operators are case-insensitive unless this is set to false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_insensitive: Option<bool>,
}

fn default_op() -> String {
    "==".to_string()
}

/// AND/OR group over nested conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Condition>,
}

/// A condition is either a single clause or a recursive AND/OR group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Clause(ConditionClause),
    Group(ConditionGroup),
}

/// One step of an automation: a tool invocation with parameters, optionally
/// guarded by a condition and optionally binding its return into context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(alias = "action_id")]
    pub id: String,
    pub tool: String,
    #[serde(default = "empty_object", alias = "params")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// The authored automation record: the single source of truth for all
/// runtime decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub status: AutomationStatus,
    pub active: bool,
    pub trigger_type: TriggerType,
    pub trigger_config: Value,
    pub actions: Vec<Action>,
    pub variables: Value,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub last_poll_cursor: Option<String>,
    pub polling_interval_minutes: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Trigger config for `trigger_type = webhook`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookTriggerConfig {
    #[serde(default)]
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Condition>,
    /// Alternate key some authors use; accepts a single condition or a bare
    /// array of clauses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

impl WebhookTriggerConfig {
    /// The filter to apply at the trigger boundary, whichever key the
    /// author used. A bare array under `filters` reads as an OR group:
    /// any clause matching admits the event.
    pub fn effective_filter(&self) -> Option<Condition> {
        if let Some(filter) = &self.filter {
            return Some(filter.clone());
        }
        match &self.filters {
            Some(Value::Array(items)) => {
                let clauses: Vec<Condition> = items
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect();
                if clauses.is_empty() {
                    None
                } else {
                    Some(Condition::Group(ConditionGroup {
                        operator: Some("OR".to_string()),
                        clauses,
                    }))
                }
            }
            Some(other) => serde_json::from_value(other.clone()).ok(),
            None => None,
        }
    }

    /// True when this config accepts the given event type (absent config
    /// matches everything).
    pub fn matches_event_type(&self, event_type: &str) -> bool {
        if self.event_types.is_empty() && self.event_type.is_none() {
            return true;
        }
        if let Some(t) = &self.event_type {
            if t.eq_ignore_ascii_case(event_type) {
                return true;
            }
        }
        self.event_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(event_type))
    }
}

/// Trigger config for `trigger_type = polling`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollingTriggerConfig {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub source_tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default = "empty_object")]
    pub tool_params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_mode: Option<AggregationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval_minutes: Option<i32>,
}

/// Trigger config for `schedule_once` / `schedule_recurring`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleTriggerConfig {
    #[serde(default)]
    pub interval: String,
    /// "HH:MM" in UTC, gates daily/weekly schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_of_day: Option<String>,
    /// 0..6 (Sunday = 0) or a day name, weekly schedules only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// One-time schedules: fire when `run_at <= now`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
}

/// Cadence buckets the scheduler iterates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleInterval {
    FiveMin,
    FifteenMin,
    ThirtyMin,
    OneHour,
    SixHours,
    Daily,
    Weekly,
    Once,
}

impl ScheduleInterval {
    pub const ALL: &'static [ScheduleInterval] = &[
        Self::FiveMin,
        Self::FifteenMin,
        Self::ThirtyMin,
        Self::OneHour,
        Self::SixHours,
        Self::Daily,
        Self::Weekly,
        Self::Once,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FiveMin => "5min",
            Self::FifteenMin => "15min",
            Self::ThirtyMin => "30min",
            Self::OneHour => "1hr",
            Self::SixHours => "6hr",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "5min" => Some(Self::FiveMin),
            "15min" => Some(Self::FifteenMin),
            "30min" => Some(Self::ThirtyMin),
            "1hr" | "1h" | "hourly" => Some(Self::OneHour),
            "6hr" | "6h" => Some(Self::SixHours),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "once" => Some(Self::Once),
            _ => None,
        }
    }

    /// Recurrence period in minutes; one-time schedules have none.
    pub fn minutes(&self) -> Option<i64> {
        match self {
            Self::FiveMin => Some(5),
            Self::FifteenMin => Some(15),
            Self::ThirtyMin => Some(30),
            Self::OneHour => Some(60),
            Self::SixHours => Some(360),
            Self::Daily => Some(1440),
            Self::Weekly => Some(10080),
            Self::Once => None,
        }
    }
}

/// How a poll's new-item set becomes events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    PerItem,
    Batch,
    Summary,
    Latest,
}

impl AggregationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerItem => "per_item",
            Self::Batch => "batch",
            Self::Summary => "summary",
            Self::Latest => "latest",
        }
    }
}

/// A queued unit of work produced by webhook ingress or polling.
/// `(service, event_id, owner_id)` is the deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Event {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub service: String,
    pub event_type: String,
    pub event_id: String,
    pub event_data: Value,
    pub processed: bool,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// An event as produced by ingress, before it has a queue row.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub owner_id: Uuid,
    pub service: String,
    pub event_type: String,
    pub event_id: String,
    pub event_data: Value,
}

/// Status of a single automation execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    PartialFailure,
    Failed,
    UsageLimitExceeded,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
            Self::UsageLimitExceeded => "usage_limit_exceeded",
        }
    }
}

/// Result of a single action execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub tool: String,
    pub success: bool,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the action's condition evaluated to false.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_result: Option<bool>,
}

/// Result of a full automation execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub status: ExecutionStatus,
    pub actions_executed: i32,
    pub actions_failed: i32,
    pub action_results: Vec<ActionResult>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

/// Per-run log row, as read back for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ExecutionLog {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub owner_id: Uuid,
    pub trigger_type: String,
    pub trigger_data: Value,
    pub status: String,
    pub actions_executed: i32,
    pub actions_failed: i32,
    pub action_results: Value,
    pub error_summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// User profile data exposed to templates as `{{user.*}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UserInfo {
    pub id: Uuid,
    pub email: String,
    pub timezone: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl UserInfo {
    /// The `user` entry of the execution context. Only populated fields are
    /// included so `exists` checks behave.
    pub fn context_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("id".into(), Value::String(self.id.to_string()));
        map.insert("email".into(), Value::String(self.email.clone()));
        map.insert(
            "timezone".into(),
            Value::String(self.timezone.clone().unwrap_or_else(|| "UTC".to_string())),
        );
        if let Some(name) = &self.name {
            map.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(phone) = &self.phone {
            map.insert("phone".into(), Value::String(phone.clone()));
        }
        Value::Object(map)
    }
}

/// A connected service account: the tenant-resolution and credential row.
/// Token columns are stored encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Integration {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub service: String,
    pub external_account_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Service-specific sync position (e.g. the Gmail history id).
    pub sync_cursor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_type_round_trip() {
        for t in [
            TriggerType::Webhook,
            TriggerType::Polling,
            TriggerType::ScheduleOnce,
            TriggerType::ScheduleRecurring,
            TriggerType::Manual,
        ] {
            assert_eq!(TriggerType::parse(t.as_str()), Some(t));
        }
        assert_eq!(
            TriggerType::parse("schedule"),
            Some(TriggerType::ScheduleRecurring)
        );
        assert_eq!(TriggerType::parse("cron"), None);
    }

    #[test]
    fn condition_deserializes_clause_and_group() {
        let clause: Condition =
            serde_json::from_value(serde_json::json!({"path": "score", "op": "<", "value": 70}))
                .unwrap();
        assert!(matches!(clause, Condition::Clause(_)));

        let group: Condition = serde_json::from_value(serde_json::json!({
            "operator": "OR",
            "clauses": [
                {"path": "subject", "op": "contains", "value": "urgent"},
                {"path": "subject", "op": "contains", "value": "ASAP"}
            ]
        }))
        .unwrap();
        match group {
            Condition::Group(g) => assert_eq!(g.clauses.len(), 2),
            _ => panic!("expected group"),
        }
    }

    #[test]
    fn action_accepts_legacy_field_names() {
        let action: Action = serde_json::from_value(serde_json::json!({
            "action_id": "a1",
            "tool": "slack_post_message",
            "params": {"text": "hi"}
        }))
        .unwrap();
        assert_eq!(action.id, "a1");
        assert_eq!(action.parameters["text"], "hi");
    }

    #[test]
    fn webhook_config_event_type_matching() {
        let cfg = WebhookTriggerConfig {
            service: "slack".into(),
            event_type: Some("message".into()),
            ..Default::default()
        };
        assert!(cfg.matches_event_type("Message"));
        assert!(!cfg.matches_event_type("reaction_added"));

        let open = WebhookTriggerConfig::default();
        assert!(open.matches_event_type("anything"));
    }

    #[test]
    fn filters_key_accepts_bare_clause_arrays() {
        let cfg: WebhookTriggerConfig = serde_json::from_value(serde_json::json!({
            "service": "gmail",
            "filters": [
                {"path": "subject", "op": "contains", "value": "urgent"},
                {"path": "subject", "op": "contains", "value": "ASAP"}
            ]
        }))
        .unwrap();

        match cfg.effective_filter() {
            Some(Condition::Group(group)) => {
                assert_eq!(group.operator.as_deref(), Some("OR"));
                assert_eq!(group.clauses.len(), 2);
            }
            other => panic!("expected an OR group, got {other:?}"),
        }
    }

    #[test]
    fn schedule_interval_minutes() {
        assert_eq!(
            ScheduleInterval::parse("1hr"),
            Some(ScheduleInterval::OneHour)
        );
        assert_eq!(ScheduleInterval::Daily.minutes(), Some(1440));
        assert_eq!(ScheduleInterval::Once.minutes(), None);
    }
}
