// HTTP control surface
//
// Everything besides webhook ingress: manual bucket/poll runs for
// operators, scheduled-runs introspection, manual dispatch and direct
// execution. Webhooks live in their own module; they have their own
// response discipline.

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use relay_shared::ScheduleInterval;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::automations;
use crate::database;
use crate::engine::{record_execution, validate_actions, ExecutionInput};
use crate::error::{ApiResult, AppError};
use crate::poller::PollOptions;
use crate::scheduler::runs::scheduled_runs;
use crate::users::get_user_info;
use crate::AppState;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/scheduler/run", post(run_schedule_bucket))
        .route("/scheduler/polling", post(run_polling))
        .route("/scheduler/scheduled-runs", post(list_scheduled_runs))
        .route("/scheduler/trigger", post(trigger_automation))
        .route("/execute", post(execute_automation))
        .route("/admin/refresh-service-tags", post(refresh_service_tags))
}

/// Admin signal: drop the poller's memoized registry tags after the
/// tagging table changes.
async fn refresh_service_tags(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.poller.invalidate_category_cache().await;
    Json(json!({ "status": "ok" }))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let database = database::health_check(&state.db_pool).await;
    let status = if database { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "database": database,
    }))
}

#[derive(Debug, Deserialize)]
struct RunBucketRequest {
    interval: String,
}

async fn run_schedule_bucket(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunBucketRequest>,
) -> ApiResult<Json<Value>> {
    let interval = ScheduleInterval::parse(&request.interval)
        .ok_or_else(|| AppError::BadRequest(format!("unknown interval: {}", request.interval)))?;

    let summary = state
        .scheduler
        .run_bucket(interval)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(Json(json!({
        "interval": interval.as_str(),
        "checked": summary.checked,
        "dispatched": summary.dispatched,
        "failures": summary.failures,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct RunPollingRequest {
    category: Option<String>,
    automation_id: Option<Uuid>,
}

async fn run_polling(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunPollingRequest>,
) -> ApiResult<Json<Value>> {
    let summary = state
        .poller
        .run(&PollOptions {
            category: request.category,
            automation_id: request.automation_id,
        })
        .await?;

    Ok(Json(serde_json::to_value(summary).unwrap_or_default()))
}

#[derive(Debug, Default, Deserialize)]
struct ScheduledRunsRequest {
    interval: Option<String>,
    user_id: Option<Uuid>,
    limit: Option<usize>,
}

async fn list_scheduled_runs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScheduledRunsRequest>,
) -> ApiResult<Json<Value>> {
    let runs = scheduled_runs(
        &state.db_pool,
        request.interval.as_deref(),
        request.user_id,
        request.limit.unwrap_or(50),
    )
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(Json(json!({ "runs": runs })))
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    automation_id: Uuid,
    user_id: Option<Uuid>,
}

/// Manual dispatch. Logged with trigger type "manual" so it never counts
/// against schedule recency.
async fn trigger_automation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<Json<Value>> {
    let automation = match request.user_id {
        Some(owner) => automations::get_owned(&state.db_pool, request.automation_id, owner).await?,
        None => automations::get(&state.db_pool, request.automation_id).await?,
    }
    .ok_or_else(|| AppError::NotFound("Automation".to_string()))?;

    if !automation.active {
        return Err(AppError::Conflict("automation is not active".to_string()));
    }

    let user = get_user_info(&state.db_pool, automation.owner_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Automation owner".to_string()))?;

    let started_at = Utc::now();
    let trigger_data = json!({
        "type": "manual",
        "triggered_at": started_at.to_rfc3339(),
    });

    let input = ExecutionInput {
        automation_id: automation.id,
        automation_name: automation.name.clone(),
        owner_id: automation.owner_id,
        actions: automation.actions.clone(),
        variables: automation.variables.clone(),
        trigger_data: trigger_data.clone(),
        user,
        now: started_at,
    };

    let result = state.executor.execute(&input).await;
    record_execution(
        &state.db_pool,
        automation.id,
        automation.owner_id,
        "manual",
        &trigger_data,
        started_at,
        &result,
    )
    .await?;

    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    automation_id: Uuid,
    #[serde(default)]
    trigger_data: Value,
    #[serde(default)]
    test_mode: bool,
}

/// Execute one automation now with caller-supplied trigger data. Test mode
/// runs inactive (e.g. pending-review) automations and skips the execution
/// log so trial runs leave no trace in history.
async fn execute_automation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<Value>> {
    let automation = automations::get(&state.db_pool, request.automation_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Automation".to_string()))?;

    if !automation.active && !request.test_mode {
        return Err(AppError::Conflict("automation is not active".to_string()));
    }

    if let Err(problems) = validate_actions(&automation.actions) {
        return Err(AppError::BadRequest(problems.join("; ")));
    }

    let user = get_user_info(&state.db_pool, automation.owner_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Automation owner".to_string()))?;

    let started_at = Utc::now();
    let trigger_data = if request.trigger_data.is_null() {
        json!({})
    } else {
        request.trigger_data.clone()
    };

    let input = ExecutionInput {
        automation_id: automation.id,
        automation_name: automation.name.clone(),
        owner_id: automation.owner_id,
        actions: automation.actions.clone(),
        variables: automation.variables.clone(),
        trigger_data: trigger_data.clone(),
        user,
        now: started_at,
    };

    let result = state.executor.execute(&input).await;

    if !request.test_mode {
        record_execution(
            &state.db_pool,
            automation.id,
            automation.owner_id,
            automation.trigger_type.as_str(),
            &trigger_data,
            started_at,
            &result,
        )
        .await?;
    }

    Ok(Json(json!({
        "test_mode": request.test_mode,
        "result": result,
    })))
}
