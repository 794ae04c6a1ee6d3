// Polling engine
//
// On a cadence (or a force-poll request) this engine invokes source tools
// for due polling automations, diffs the output against each automation's
// cursor, filters, aggregates, and enqueues events. Batches are small and
// spaced out so upstream services see a trickle, not a stampede.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use relay_shared::{AggregationMode, AutomationRecord, NewEvent, PollingTriggerConfig};
use serde_json::{Map, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::automations;
use crate::config::PollerConfig;
use crate::engine::{resolve_parameters, BuiltinVars};
use crate::events::{enqueue, Dispatcher, EnqueueOutcome};
use crate::tools::{ToolRegistry, HEALTH_CATEGORY};
use crate::users::get_user_info;

pub mod aggregation;
pub mod cursor;

use aggregation::{build_events, AggregationInput};

/// Fallback polling cadence per service, minutes.
pub fn default_interval_minutes(service: &str) -> i64 {
    match service.to_lowercase().as_str() {
        "oura" => 60,
        "fitbit" => 15,
        "todoist" => 5,
        "google-calendar" | "google_calendar" => 10,
        "outlook-calendar" | "outlook_calendar" => 10,
        "excel" => 10,
        "word" => 15,
        "notion" => 10,
        _ => 15,
    }
}

const HEALTH_TOOL_HINTS: &[&str] = &[
    "sleep",
    "readiness",
    "activity",
    "heart",
    "hrv",
    "steps",
    "oura",
    "fitbit",
    "whoop",
    "health",
];

/// Tools whose names suggest a health/fitness source get date-range
/// defaults so authors can omit start/end dates.
fn health_named_tool(tool: &str) -> bool {
    let lower = tool.to_lowercase();
    HEALTH_TOOL_HINTS.iter().any(|hint| lower.contains(hint))
}

const ITEM_SHELLS: &[&str] = &["data", "items", "files", "events", "tasks", "sleep"];

/// Extract the item list from a tool's raw output by probing well-known
/// array shells. A `summary` object becomes a singleton list; a bare array
/// is taken as-is; a primitive is wrapped as `[{message: value}]`.
pub fn extract_items(raw: &Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            for shell in ITEM_SHELLS {
                if let Some(Value::Array(items)) = map.get(*shell) {
                    return items.clone();
                }
            }
            if let Some(summary @ Value::Object(_)) = map.get("summary") {
                return vec![summary.clone()];
            }
            vec![raw.clone()]
        }
        Value::Null => vec![],
        primitive => {
            let mut wrapped = Map::new();
            wrapped.insert("message".into(), primitive.clone());
            vec![Value::Object(wrapped)]
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PollOptions {
    /// Restrict to automations whose service carries this registry category.
    pub category: Option<String>,
    /// Force-poll one automation regardless of `next_poll_at`.
    pub automation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PollSummary {
    pub automations_polled: usize,
    pub events_created: usize,
    pub failures: usize,
}

#[derive(Debug)]
struct PollOutcome {
    items_found: usize,
    new_items: usize,
    filtered_out: usize,
    events_created: usize,
    error: Option<String>,
}

pub struct PollingEngine {
    db_pool: PgPool,
    tools: Arc<dyn ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    config: PollerConfig,
    /// Registry tagging lookups, memoized per process lifetime.
    category_cache: RwLock<HashMap<String, Option<String>>>,
}

impl PollingEngine {
    pub fn new(
        db_pool: PgPool,
        tools: Arc<dyn ToolRegistry>,
        dispatcher: Arc<Dispatcher>,
        config: PollerConfig,
    ) -> Self {
        Self {
            db_pool,
            tools,
            dispatcher,
            config,
            category_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drop memoized registry tags (admin signal after re-tagging).
    pub async fn invalidate_category_cache(&self) {
        self.category_cache.write().await.clear();
    }

    async fn service_category(&self, service: &str) -> Option<String> {
        let key = service.to_lowercase();
        if let Some(cached) = self.category_cache.read().await.get(&key) {
            return cached.clone();
        }
        let category = self.tools.service_category(&key).await;
        self.category_cache
            .write()
            .await
            .insert(key, category.clone());
        category
    }

    async fn is_health_service(&self, service: &str) -> bool {
        self.service_category(service)
            .await
            .is_some_and(|c| c == HEALTH_CATEGORY)
    }

    /// Run due polls (or one forced automation), batched with an
    /// inter-batch delay.
    pub async fn run(&self, opts: &PollOptions) -> Result<PollSummary, sqlx::Error> {
        let now = Utc::now();

        let selected: Vec<AutomationRecord> = if let Some(id) = opts.automation_id {
            match automations::get(&self.db_pool, id).await? {
                Some(a)
                    if a.active && a.trigger_type == relay_shared::TriggerType::Polling =>
                {
                    vec![a]
                }
                _ => {
                    warn!(automation_id = %id, "force poll target is not an active polling automation");
                    vec![]
                }
            }
        } else {
            let mut due = automations::due_polls(&self.db_pool, now).await?;
            if let Some(category) = &opts.category {
                let mut kept = Vec::with_capacity(due.len());
                for automation in due.drain(..) {
                    let config: PollingTriggerConfig =
                        serde_json::from_value(automation.trigger_config.clone())
                            .unwrap_or_default();
                    let matches = self
                        .service_category(&config.service)
                        .await
                        .is_some_and(|c| c.eq_ignore_ascii_case(category));
                    if matches {
                        kept.push(automation);
                    }
                }
                kept
            } else {
                due
            }
        };

        let mut summary = PollSummary {
            automations_polled: selected.len(),
            ..Default::default()
        };

        for batch in selected.chunks(self.config.batch_size.max(1)) {
            let outcomes = join_all(batch.iter().map(|a| self.poll_one(a))).await;
            for outcome in outcomes {
                summary.events_created += outcome.events_created;
                if outcome.error.is_some() {
                    summary.failures += 1;
                }
            }
            if batch.len() == self.config.batch_size {
                tokio::time::sleep(Duration::from_millis(self.config.inter_batch_delay_ms)).await;
            }
        }

        if summary.events_created > 0 {
            self.dispatcher.kick();
        }

        info!(
            polled = summary.automations_polled,
            events = summary.events_created,
            failures = summary.failures,
            "poll cycle complete"
        );
        Ok(summary)
    }

    async fn poll_one(&self, automation: &AutomationRecord) -> PollOutcome {
        let started = Instant::now();
        let now = Utc::now();
        let outcome = self.poll_inner(automation, now).await;

        info!(
            automation = %automation.id,
            items = outcome.items_found,
            new = outcome.new_items,
            filtered = outcome.filtered_out,
            events = outcome.events_created,
            duration_ms = started.elapsed().as_millis() as i64,
            error = outcome.error.as_deref().unwrap_or(""),
            "poll finished"
        );
        outcome
    }

    async fn poll_inner(&self, automation: &AutomationRecord, now: DateTime<Utc>) -> PollOutcome {
        let mut outcome = PollOutcome {
            items_found: 0,
            new_items: 0,
            filtered_out: 0,
            events_created: 0,
            error: None,
        };

        let config: PollingTriggerConfig =
            match serde_json::from_value(automation.trigger_config.clone()) {
                Ok(c) => c,
                Err(e) => {
                    outcome.error = Some(format!("malformed trigger config: {e}"));
                    self.advance_failed(automation, &config_default(), now).await;
                    return outcome;
                }
            };
        if config.source_tool.is_empty() {
            outcome.error = Some("trigger config has no source_tool".to_string());
            self.advance_failed(automation, &config, now).await;
            return outcome;
        }

        let timezone = get_user_info(&self.db_pool, automation.owner_id)
            .await
            .ok()
            .flatten()
            .and_then(|u| u.timezone);
        let builtins = BuiltinVars::compute(now, timezone.as_deref());

        let params = self.materialize_params(automation, &config, &builtins);

        let raw_output = match tokio::time::timeout(
            Duration::from_secs(self.config.action_timeout_secs),
            self.tools
                .execute(&config.source_tool, params, automation.owner_id),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                // Source failure still advances next_poll_at so the
                // automation is retried on schedule rather than hot-looped.
                outcome.error = Some(e.to_string());
                self.advance_failed(automation, &config, now).await;
                return outcome;
            }
            Err(_) => {
                outcome.error = Some(format!(
                    "source tool timed out after {}s",
                    self.config.action_timeout_secs
                ));
                self.advance_failed(automation, &config, now).await;
                return outcome;
            }
        };

        let items = extract_items(&raw_output);
        outcome.items_found = items.len();

        let last_cursor = automation.last_poll_cursor.as_deref();
        let new_items: Vec<Value> = items
            .into_iter()
            .filter(|item| cursor::is_new_item(item, last_cursor))
            .collect();
        outcome.new_items = new_items.len();

        let mode = match config.aggregation_mode {
            Some(mode) => mode,
            None if self.is_health_service(&config.service).await => AggregationMode::Latest,
            None => AggregationMode::PerItem,
        };

        let event_type = config
            .event_type
            .clone()
            .unwrap_or_else(|| format!("{}_update", config.service));

        let aggregated = build_events(
            &AggregationInput {
                mode,
                service: &config.service,
                automation_id: automation.id,
                event_type: &event_type,
                filter: config.filter.as_ref(),
                new_items: &new_items,
                raw_output: &raw_output,
                now,
            },
            &builtins,
        );
        outcome.filtered_out = aggregated.filtered_out;

        for draft in &aggregated.events {
            match enqueue(
                &self.db_pool,
                &NewEvent {
                    owner_id: automation.owner_id,
                    service: config.service.clone(),
                    event_type: draft.event_type.clone(),
                    event_id: draft.event_id.clone(),
                    event_data: draft.payload.clone(),
                },
            )
            .await
            {
                Ok(EnqueueOutcome::Inserted(_)) => outcome.events_created += 1,
                Ok(EnqueueOutcome::Duplicate) => {}
                Err(e) => {
                    warn!(automation = %automation.id, "event enqueue failed: {e}");
                    outcome.error = Some(e.to_string());
                }
            }
        }

        // Advance the cursor to the most recent new item (comparator picks
        // the winner per cursor shape), and schedule the next poll.
        let new_cursor = new_items
            .iter()
            .filter_map(cursor::item_cursor)
            .reduce(|a, b| cursor::max_cursor(&a, &b).to_string());

        let next_poll_at = now + ChronoDuration::minutes(self.interval_minutes(automation, &config));
        if let Err(e) = automations::update_poll_state(
            &self.db_pool,
            automation.id,
            new_cursor.as_deref(),
            next_poll_at,
        )
        .await
        {
            warn!(automation = %automation.id, "failed to persist poll state: {e}");
            outcome.error = Some(e.to_string());
        }

        outcome
    }

    /// Materialize tool parameters: `{{last_cursor}}` gets the stored
    /// cursor (defaulting to yesterday), date built-ins resolve in the
    /// user's timezone, and health-named tools get start/end date defaults.
    fn materialize_params(
        &self,
        automation: &AutomationRecord,
        config: &PollingTriggerConfig,
        builtins: &BuiltinVars,
    ) -> Value {
        let yesterday = builtins.get("yesterday").unwrap_or_default().to_string();
        let cursor = automation
            .last_poll_cursor
            .clone()
            .unwrap_or_else(|| yesterday.clone());

        let context = serde_json::json!({ "last_cursor": cursor });
        let mut params = resolve_parameters(&config.tool_params, &context, builtins);

        if health_named_tool(&config.source_tool) {
            if let Value::Object(map) = &mut params {
                let start_default = match cursor::classify(&cursor) {
                    cursor::CursorKind::IsoDate => cursor.clone(),
                    _ => yesterday.clone(),
                };
                map.entry("start_date".to_string())
                    .or_insert_with(|| Value::String(start_default));
                map.entry("end_date".to_string()).or_insert_with(|| {
                    Value::String(builtins.get("today").unwrap_or_default().to_string())
                });
            }
        }

        params
    }

    fn interval_minutes(
        &self,
        automation: &AutomationRecord,
        config: &PollingTriggerConfig,
    ) -> i64 {
        config
            .polling_interval_minutes
            .or(automation.polling_interval_minutes)
            .map(i64::from)
            .unwrap_or_else(|| default_interval_minutes(&config.service))
    }

    async fn advance_failed(
        &self,
        automation: &AutomationRecord,
        config: &PollingTriggerConfig,
        now: DateTime<Utc>,
    ) {
        let next = now + ChronoDuration::minutes(self.interval_minutes(automation, config));
        if let Err(e) =
            automations::update_poll_state(&self.db_pool, automation.id, None, next).await
        {
            warn!(automation = %automation.id, "failed to advance next_poll_at: {e}");
        }
    }
}

fn config_default() -> PollingTriggerConfig {
    PollingTriggerConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_extraction_shells() {
        assert_eq!(
            extract_items(&json!({"data": [{"a": 1}, {"a": 2}]})).len(),
            2
        );
        assert_eq!(extract_items(&json!({"tasks": [{"id": 1}]})).len(), 1);
        assert_eq!(extract_items(&json!([{"a": 1}])).len(), 1);
        // summary object wraps into a singleton list
        let summary = extract_items(&json!({"summary": {"steps": 9000}}));
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0]["steps"], 9000);
        // primitive wraps as a message
        let primitive = extract_items(&json!("all quiet"));
        assert_eq!(primitive[0]["message"], "all quiet");
        // object without a shell is itself the item
        assert_eq!(extract_items(&json!({"score": 70}))[0]["score"], 70);
        assert!(extract_items(&json!(null)).is_empty());
    }

    #[test]
    fn default_intervals_match_service_table() {
        assert_eq!(default_interval_minutes("Oura"), 60);
        assert_eq!(default_interval_minutes("fitbit"), 15);
        assert_eq!(default_interval_minutes("todoist"), 5);
        assert_eq!(default_interval_minutes("google-calendar"), 10);
        assert_eq!(default_interval_minutes("notion"), 10);
        assert_eq!(default_interval_minutes("word"), 15);
        assert_eq!(default_interval_minutes("somewhere-else"), 15);
    }

    #[test]
    fn health_tool_name_hints() {
        assert!(health_named_tool("oura_get_daily_sleep"));
        assert!(health_named_tool("fitbit_get_activity_summary"));
        assert!(!health_named_tool("slack_post_message"));
    }
}
