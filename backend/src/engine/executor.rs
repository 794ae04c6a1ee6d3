// Action executor
//
// Walks an automation's action list in declared order: evaluate the guard
// condition, resolve parameter templates, dispatch the tool under a
// deadline, record the result. Tool failures are non-fatal; the usage-limit
// sentinel aborts the run. The executor performs no I/O of its own beyond
// tool dispatch, so a run is deterministic given fixed inputs and a fixed
// clock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use relay_shared::{
    Action, ActionResult, ExecutionResult, ExecutionStatus, UserInfo, RESERVED_CONTEXT_KEYS,
    USAGE_LIMIT_ERROR,
};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use super::conditions::evaluate_condition;
use super::templates::{resolve_parameters, BuiltinVars};
use crate::notifications::Notifier;
use crate::tools::ToolRegistry;

pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a single execution needs. `now` is part of the input so runs
/// are reproducible under test.
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    pub automation_id: Uuid,
    pub automation_name: String,
    pub owner_id: Uuid,
    pub actions: Vec<Action>,
    pub variables: Value,
    pub trigger_data: Value,
    pub user: UserInfo,
    pub now: DateTime<Utc>,
}

pub struct Executor {
    tools: Arc<dyn ToolRegistry>,
    notifier: Arc<dyn Notifier>,
    action_timeout: Duration,
}

impl Executor {
    pub fn new(tools: Arc<dyn ToolRegistry>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            tools,
            notifier,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Execute an automation's actions against the given trigger data.
    pub async fn execute(&self, input: &ExecutionInput) -> ExecutionResult {
        let run_start = Instant::now();
        let builtins = BuiltinVars::compute(input.now, input.user.timezone.as_deref());
        let mut context = build_context(&input.trigger_data, &input.user, &input.variables);

        let mut action_results: Vec<ActionResult> = Vec::with_capacity(input.actions.len());
        let mut actions_executed = 0;
        let mut actions_failed = 0;
        let mut errors: Vec<String> = Vec::new();

        for action in &input.actions {
            let action_start = Instant::now();
            let had_condition = action.condition.is_some();

            if let Some(condition) = &action.condition {
                if !evaluate_condition(condition, &context, &builtins) {
                    info!(action = %action.id, "action skipped, condition not met");
                    action_results.push(ActionResult {
                        action_id: action.id.clone(),
                        tool: action.tool.clone(),
                        success: true,
                        duration_ms: action_start.elapsed().as_millis() as i64,
                        output: None,
                        error: None,
                        skipped: true,
                        condition_result: Some(false),
                    });
                    continue;
                }
            }

            let mut params = resolve_parameters(&action.parameters, &context, &builtins);
            if let Value::Object(map) = &mut params {
                // Standard tool-call context, same keys on every dispatch.
                map.insert("user_id".into(), Value::String(input.owner_id.to_string()));
                map.insert("is_automation".into(), Value::Bool(true));
            }

            info!(action = %action.id, tool = %action.tool, "executing action");

            let (success, output, error) = self.dispatch(&action.tool, params, input.owner_id).await;
            let duration_ms = action_start.elapsed().as_millis() as i64;
            actions_executed += 1;

            if success {
                if let Some(limit) = usage_limit(&output) {
                    warn!(
                        action = %action.id,
                        service = %limit.service,
                        "usage limit exceeded, aborting automation"
                    );

                    self.notifier
                        .usage_limit_exceeded(
                            input.owner_id,
                            input.automation_id,
                            &input.automation_name,
                        )
                        .await;

                    // Recorded with the sentinel but not counted as a tool
                    // failure; the run status carries the outcome.
                    action_results.push(ActionResult {
                        action_id: action.id.clone(),
                        tool: action.tool.clone(),
                        success: false,
                        duration_ms,
                        output: None,
                        error: Some(format!("Usage limit exceeded: {}", limit.message)),
                        skipped: false,
                        condition_result: had_condition.then_some(true),
                    });

                    return ExecutionResult {
                        success: false,
                        status: ExecutionStatus::UsageLimitExceeded,
                        actions_executed,
                        actions_failed,
                        action_results,
                        duration_ms: run_start.elapsed().as_millis() as i64,
                        error_summary: Some(format!("Usage limit exceeded for {}", limit.service)),
                    };
                }

                if let Some(name) = &action.output_as {
                    if RESERVED_CONTEXT_KEYS.contains(&name.as_str()) {
                        warn!(
                            action = %action.id,
                            output_as = %name,
                            "output_as collides with a reserved context key, not binding"
                        );
                    } else if let Value::Object(map) = &mut context {
                        map.insert(name.clone(), output.clone().unwrap_or(Value::Null));
                    }
                }

                action_results.push(ActionResult {
                    action_id: action.id.clone(),
                    tool: action.tool.clone(),
                    success: true,
                    duration_ms,
                    output,
                    error: None,
                    skipped: false,
                    condition_result: had_condition.then_some(true),
                });
            } else {
                let message = error.unwrap_or_else(|| "unknown error".to_string());
                warn!(action = %action.id, error = %message, "action failed, continuing");
                actions_failed += 1;
                errors.push(format!("{}: {}", action.id, message));

                action_results.push(ActionResult {
                    action_id: action.id.clone(),
                    tool: action.tool.clone(),
                    success: false,
                    duration_ms,
                    output: None,
                    error: Some(message),
                    skipped: false,
                    condition_result: had_condition.then_some(true),
                });
            }
        }

        let (status, success) = if actions_failed == 0 {
            (ExecutionStatus::Completed, true)
        } else if actions_failed < actions_executed {
            (ExecutionStatus::PartialFailure, true)
        } else {
            (ExecutionStatus::Failed, false)
        };

        ExecutionResult {
            success,
            status,
            actions_executed,
            actions_failed,
            action_results,
            duration_ms: run_start.elapsed().as_millis() as i64,
            error_summary: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }

    /// Dispatch one tool under the configured deadline. String outputs that
    /// carry JSON are parsed so template paths and the usage-limit check see
    /// structure, not text.
    async fn dispatch(
        &self,
        tool: &str,
        params: Value,
        owner_id: Uuid,
    ) -> (bool, Option<Value>, Option<String>) {
        match tokio::time::timeout(self.action_timeout, self.tools.execute(tool, params, owner_id))
            .await
        {
            Ok(Ok(output)) => {
                let output = match output {
                    Value::String(s) => extract_json_from_string(&s),
                    other => other,
                };
                if let Some(err) = tool_error_string(&output) {
                    return (false, None, Some(err));
                }
                (true, Some(output), None)
            }
            Ok(Err(e)) => (false, None, Some(e.to_string())),
            Err(_) => (
                false,
                None,
                Some(format!(
                    "tool execution timed out after {}s",
                    self.action_timeout.as_secs()
                )),
            ),
        }
    }
}

/// Build the template/condition context: trigger fields spread at the root,
/// reserved `user` and `trigger_data` keys set afterwards so payload fields
/// cannot clobber them, user-defined variables last.
fn build_context(trigger_data: &Value, user: &UserInfo, variables: &Value) -> Value {
    let mut map = serde_json::Map::new();
    if let Value::Object(fields) = trigger_data {
        for (k, v) in fields {
            map.insert(k.clone(), v.clone());
        }
    }
    map.insert("user".into(), user.context_value());
    map.insert("trigger_data".into(), trigger_data.clone());
    if let Value::Object(vars) = variables {
        for (k, v) in vars {
            map.insert(k.clone(), v.clone());
        }
    }
    Value::Object(map)
}

struct UsageLimit {
    service: String,
    message: String,
}

/// The usage-limit sentinel: a structured "success" payload carrying
/// `{"error": "USAGE_LIMIT_EXCEEDED"}`.
fn usage_limit(output: &Option<Value>) -> Option<UsageLimit> {
    let output = output.as_ref()?;
    if output.get("error")?.as_str()? != USAGE_LIMIT_ERROR {
        return None;
    }
    Some(UsageLimit {
        service: output
            .get("service")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        message: output
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Usage limit reached")
            .to_string(),
    })
}

/// Tools from older catalogs signal failure with an "Error:" string instead
/// of an Err return.
fn tool_error_string(output: &Value) -> Option<String> {
    let s = output.as_str()?;
    s.starts_with("Error:").then(|| s.to_string())
}

fn code_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("code fence regex"))
}

/// Extract JSON from a string that may wrap it in prose or markdown code
/// fences. Returns the original string as a JSON value when nothing parses.
pub fn extract_json_from_string(text: &str) -> Value {
    let trimmed = text.trim();

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return v;
    }

    for caps in code_fence_re().captures_iter(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(caps[1].trim()) {
            return v;
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                    return v;
                }
            }
        }
    }

    Value::String(text.to_string())
}

/// Persist one execution-log row for a finished run.
pub async fn record_execution(
    pool: &PgPool,
    automation_id: Uuid,
    owner_id: Uuid,
    trigger_type: &str,
    trigger_data: &Value,
    started_at: DateTime<Utc>,
    result: &ExecutionResult,
) -> Result<Uuid, sqlx::Error> {
    let log_id = Uuid::new_v4();
    let completed_at = started_at + ChronoDuration::milliseconds(result.duration_ms);

    sqlx::query(
        r#"
        INSERT INTO execution_logs
        (id, automation_id, owner_id, trigger_type, trigger_data, status,
         actions_executed, actions_failed, action_results, error_summary,
         started_at, completed_at, duration_ms)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(log_id)
    .bind(automation_id)
    .bind(owner_id)
    .bind(trigger_type)
    .bind(trigger_data)
    .bind(result.status.as_str())
    .bind(result.actions_executed)
    .bind(result.actions_failed)
    .bind(serde_json::to_value(&result.action_results).unwrap_or(Value::Array(vec![])))
    .bind(&result.error_summary)
    .bind(started_at)
    .bind(completed_at)
    .bind(result.duration_ms)
    .execute(pool)
    .await?;

    Ok(log_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{StaticToolRegistry, ToolError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        usage_limits: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn usage_limit_exceeded(&self, _owner: Uuid, automation_id: Uuid, _name: &str) {
            self.usage_limits.lock().unwrap().push(automation_id);
        }

        async fn automation_failed(
            &self,
            _owner: Uuid,
            _automation_id: Uuid,
            _name: &str,
            _error: Option<&str>,
        ) {
        }

        async fn custom(&self, _owner: Uuid, _title: &str, _body: &str) {}
    }

    fn user() -> UserInfo {
        UserInfo {
            id: Uuid::new_v4(),
            email: "test@example.com".into(),
            timezone: Some("UTC".into()),
            name: Some("Test".into()),
            phone: None,
        }
    }

    fn input(actions: Vec<Action>, trigger_data: Value) -> ExecutionInput {
        ExecutionInput {
            automation_id: Uuid::new_v4(),
            automation_name: "test automation".into(),
            owner_id: Uuid::new_v4(),
            actions,
            variables: json!({}),
            trigger_data,
            user: user(),
            now: Utc::now(),
        }
    }

    fn action(v: Value) -> Action {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn output_binding_feeds_later_actions() {
        let mut registry = StaticToolRegistry::new();
        registry.register_fn("get_score", None, |_p, _o| async {
            Ok(json!({"score": 85}))
        });
        let sent = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sent2 = sent.clone();
        registry.register_fn("send_message", None, move |p, _o| {
            let sent = sent2.clone();
            async move {
                sent.lock().unwrap().push(p);
                Ok(json!({"ok": true}))
            }
        });

        let executor = Executor::new(Arc::new(registry), Arc::new(RecordingNotifier::default()));
        let result = executor
            .execute(&input(
                vec![
                    action(json!({"id": "a1", "tool": "get_score", "output_as": "score_data"})),
                    action(json!({
                        "id": "a2", "tool": "send_message",
                        "parameters": {"text": "score is {{score_data.score}}"}
                    })),
                ],
                json!({}),
            ))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.success);
        assert_eq!(result.actions_executed, 2);
        assert_eq!(result.actions_failed, 0);

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0]["text"], "score is 85");
        assert_eq!(sent[0]["is_automation"], true);
    }

    #[tokio::test]
    async fn false_condition_skips_action() {
        let mut registry = StaticToolRegistry::new();
        registry.register_fn("notify", None, |_p, _o| async { Ok(json!({"ok": true})) });

        let executor = Executor::new(Arc::new(registry), Arc::new(RecordingNotifier::default()));
        let result = executor
            .execute(&input(
                vec![action(json!({
                    "id": "a1", "tool": "notify",
                    "condition": {"path": "score", "op": "<", "value": 70}
                }))],
                json!({"score": 95}),
            ))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.actions_executed, 0);
        assert_eq!(result.actions_failed, 0);
        assert!(result.action_results[0].skipped);
        assert_eq!(result.action_results[0].condition_result, Some(false));
    }

    #[tokio::test]
    async fn tool_failure_is_non_fatal() {
        let mut registry = StaticToolRegistry::new();
        registry.register_fn("broken", None, |_p, _o| async {
            Err(ToolError::Execution("boom".into()))
        });
        registry.register_fn("works", None, |_p, _o| async { Ok(json!("done")) });

        let executor = Executor::new(Arc::new(registry), Arc::new(RecordingNotifier::default()));
        let result = executor
            .execute(&input(
                vec![
                    action(json!({"id": "a1", "tool": "broken"})),
                    action(json!({"id": "a2", "tool": "works"})),
                ],
                json!({}),
            ))
            .await;

        assert_eq!(result.status, ExecutionStatus::PartialFailure);
        assert!(result.success);
        assert_eq!(result.actions_executed, 2);
        assert_eq!(result.actions_failed, 1);
        assert!(result.error_summary.as_deref().unwrap().contains("a1"));
    }

    #[tokio::test]
    async fn all_failures_mean_failed() {
        let mut registry = StaticToolRegistry::new();
        registry.register_fn("broken", None, |_p, _o| async {
            Err(ToolError::Execution("boom".into()))
        });

        let executor = Executor::new(Arc::new(registry), Arc::new(RecordingNotifier::default()));
        let result = executor
            .execute(&input(
                vec![
                    action(json!({"id": "a1", "tool": "broken"})),
                    action(json!({"id": "a2", "tool": "broken"})),
                ],
                json!({}),
            ))
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn usage_limit_aborts_remaining_actions() {
        let calls = Arc::new(Mutex::new(0u32));
        let mut registry = StaticToolRegistry::new();
        registry.register_fn("first", None, |_p, _o| async { Ok(json!({"ok": true})) });
        registry.register_fn("limited", None, |_p, _o| async {
            Ok(json!({
                "error": "USAGE_LIMIT_EXCEEDED",
                "service": "textbelt",
                "message": "Daily quota reached"
            }))
        });
        let calls2 = calls.clone();
        registry.register_fn("never", None, move |_p, _o| {
            let calls = calls2.clone();
            async move {
                *calls.lock().unwrap() += 1;
                Ok(json!({"ok": true}))
            }
        });

        let notifier = Arc::new(RecordingNotifier::default());
        let executor = Executor::new(Arc::new(registry), notifier.clone());
        let result = executor
            .execute(&input(
                vec![
                    action(json!({"id": "a1", "tool": "first"})),
                    action(json!({"id": "a2", "tool": "limited"})),
                    action(json!({"id": "a3", "tool": "never"})),
                ],
                json!({}),
            ))
            .await;

        assert_eq!(result.status, ExecutionStatus::UsageLimitExceeded);
        assert!(!result.success);
        assert_eq!(result.action_results.len(), 2);
        assert!(result.action_results[0].success);
        assert!(result.action_results[1]
            .error
            .as_deref()
            .unwrap()
            .contains("Daily quota"));
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(notifier.usage_limits.lock().unwrap().len(), 1);
        assert_eq!(
            result.error_summary.as_deref(),
            Some("Usage limit exceeded for textbelt")
        );
    }

    #[tokio::test]
    async fn timeout_fails_action_and_continues() {
        let mut registry = StaticToolRegistry::new();
        registry.register_fn("slow", None, |_p, _o| async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(json!({"ok": true}))
        });
        registry.register_fn("fast", None, |_p, _o| async { Ok(json!({"ok": true})) });

        let executor = Executor::new(Arc::new(registry), Arc::new(RecordingNotifier::default()))
            .with_timeout(Duration::from_millis(50));
        let result = executor
            .execute(&input(
                vec![
                    action(json!({"id": "a1", "tool": "slow"})),
                    action(json!({"id": "a2", "tool": "fast"})),
                ],
                json!({}),
            ))
            .await;

        assert_eq!(result.status, ExecutionStatus::PartialFailure);
        assert!(result.action_results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
        assert!(result.action_results[1].success);
    }

    #[tokio::test]
    async fn deterministic_given_fixed_inputs() {
        fn registry() -> StaticToolRegistry {
            let mut r = StaticToolRegistry::new();
            r.register_fn("stub", None, |_p, _o| async { Ok(json!({"n": 1})) });
            r
        }

        let now = "2025-02-27T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let owner = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let base = ExecutionInput {
            automation_id: Uuid::new_v4(),
            automation_name: "det".into(),
            owner_id: owner,
            actions: vec![action(
                json!({"id": "a1", "tool": "stub", "output_as": "out"}),
            )],
            variables: json!({}),
            trigger_data: json!({"x": 1}),
            user: UserInfo {
                id: user_id,
                email: "a@b.c".into(),
                timezone: Some("UTC".into()),
                name: None,
                phone: None,
            },
            now,
        };

        let notifier = Arc::new(RecordingNotifier::default());
        let r1 = Executor::new(Arc::new(registry()), notifier.clone())
            .execute(&base)
            .await;
        let r2 = Executor::new(Arc::new(registry()), notifier)
            .execute(&base)
            .await;

        let strip = |r: &ExecutionResult| {
            r.action_results
                .iter()
                .map(|a| {
                    (
                        a.action_id.clone(),
                        a.success,
                        a.output.clone(),
                        a.error.clone(),
                        a.skipped,
                    )
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&r1), strip(&r2));
        assert_eq!(r1.status, r2.status);
    }

    #[test]
    fn extract_json_variants() {
        assert_eq!(
            extract_json_from_string("{\"a\": 1}"),
            json!({"a": 1})
        );
        assert_eq!(
            extract_json_from_string("Here it is: ```json\n{\"a\": 1}\n```"),
            json!({"a": 1})
        );
        assert_eq!(
            extract_json_from_string("The result is: {\"a\": 1} done"),
            json!({"a": 1})
        );
        assert_eq!(
            extract_json_from_string("plain text"),
            json!("plain text")
        );
    }

    #[test]
    fn variables_spread_last() {
        let ctx = build_context(
            &json!({"subject": "hi", "user": "slack-user"}),
            &UserInfo {
                id: Uuid::nil(),
                email: "a@b.c".into(),
                timezone: None,
                name: None,
                phone: None,
            },
            &json!({"greeting": "hello"}),
        );
        // Payload "user" field must not clobber the profile.
        assert_eq!(ctx["user"]["email"], "a@b.c");
        assert_eq!(ctx["trigger_data"]["user"], "slack-user");
        assert_eq!(ctx["greeting"], "hello");
        assert_eq!(ctx["subject"], "hi");
    }
}
