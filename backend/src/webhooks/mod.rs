// Webhook ingress
//
// One multi-tenant endpoint per service. The handler order is fixed:
// protocol handshakes, signature verification, parsing, tenant resolution,
// service-specific filtering, automation-side filtering, enqueue. The HTTP
// response never waits on dispatch; the queue decouples ingress from
// execution.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use relay_shared::{NewEvent, WebhookTriggerConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::automations;
use crate::engine::{evaluate_filter, BuiltinVars};
use crate::error::{ApiResult, AppError};
use crate::events::{enqueue, EnqueueOutcome};
use crate::AppState;

pub mod gmail;
pub mod parsers;
pub mod signature;

pub use gmail::GmailClient;

use parsers::ParsedEvent;

pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/:service",
        post(receive_webhook).get(subscription_handshake),
    )
}

/// GET handshakes. Fitbit verifies subscriber endpoints with
/// `?verify=<code>`: matching code gets 204, anything else 404.
async fn subscription_handshake(
    Path(service): Path<String>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> StatusCode {
    if service.to_lowercase() == "fitbit" {
        if let (Some(code), Some(expected)) = (
            query.get("verify"),
            state.config.webhooks.fitbit_verify_code.as_ref(),
        ) {
            if code == expected {
                return StatusCode::NO_CONTENT;
            }
        }
        return StatusCode::NOT_FOUND;
    }
    StatusCode::NOT_FOUND
}

async fn receive_webhook(
    Path(service): Path<String>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let service = service.to_lowercase();

    // Microsoft Graph validates new subscriptions with a token echo that
    // precedes everything else, including signature checks.
    if let Some(token) = query.get("validationToken") {
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token.clone(),
        )
            .into_response());
    }

    let payload: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("payload is not valid JSON: {e}")))?
    };

    // Slack URL verification: echo the challenge as plain text.
    if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = payload
            .get("challenge")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            challenge,
        )
            .into_response());
    }

    // Notion endpoint verification: surface the token for operator copy.
    if let Some(token) = payload.get("verification_token").and_then(Value::as_str) {
        info!(service, "notion verification token received: {token}");
        return Ok(Json(json!({ "verification_token": token })).into_response());
    }

    signature::verify(&service, &state.config.webhooks, &headers, &query, &body)
        .map_err(|e| AppError::Unauthorized(e.to_string()))?;

    if service == "gmail" {
        return handle_gmail(&state, &payload).await;
    }

    let events = parsers::parse(&service, &payload, &headers)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    if events.is_empty() {
        return Ok(accepted_response(0, 0, 0));
    }

    let mut resolved: Vec<(Uuid, ParsedEvent)> = Vec::with_capacity(events.len());
    for event in events {
        match resolve_owner(&state, &service, &event).await? {
            Some(owner_id) => resolved.push((owner_id, event)),
            None => warn!(
                service,
                tenant = event.external_tenant.as_deref().unwrap_or("-"),
                "webhook for unknown tenant"
            ),
        }
    }
    if resolved.is_empty() {
        return Err(AppError::ServiceNotConnected(service));
    }

    let received = resolved.len();
    let mut enqueued = 0;
    let mut duplicates = 0;

    for (owner_id, event) in resolved {
        if !admitted_by_automations(&state, owner_id, &service, &event).await? {
            info!(
                service,
                event_id = %event.event_id,
                "event filtered before enqueue"
            );
            continue;
        }

        let outcome = enqueue(
            &state.db_pool,
            &NewEvent {
                owner_id,
                service: service.clone(),
                event_type: event.event_type.clone(),
                event_id: event.event_id.clone(),
                event_data: event.data.clone(),
            },
        )
        .await?;

        match outcome {
            EnqueueOutcome::Inserted(_) => enqueued += 1,
            EnqueueOutcome::Duplicate => duplicates += 1,
        }
    }

    if enqueued > 0 {
        state.dispatcher.kick();
    }

    Ok(accepted_response(received, enqueued, duplicates))
}

fn accepted_response(received: usize, enqueued: usize, duplicates: usize) -> Response {
    Json(json!({
        "status": "ok",
        "received": received,
        "enqueued": enqueued,
        "duplicates": duplicates,
        "filtered": received > enqueued + duplicates,
    }))
    .into_response()
}

/// Map a parsed event to its internal owner. Microsoft deliveries carry the
/// owner id directly in clientState; everything else resolves through the
/// credential store (oldest integration wins for shared workspaces).
async fn resolve_owner(
    state: &AppState,
    service: &str,
    event: &ParsedEvent,
) -> ApiResult<Option<Uuid>> {
    let Some(tenant) = event.external_tenant.as_deref() else {
        return Ok(None);
    };

    if service == "microsoft" || service == "outlook" {
        return Ok(Uuid::parse_str(tenant).ok());
    }

    Ok(state.credentials.resolve_tenant(service, tenant).await?)
}

/// The automation-side filter: enqueue when at least one matching
/// automation passes its trigger filter, or when nothing matches at all.
/// The loss-free default means an event is only suppressed by a filter that
/// examined it, never by the absence of one.
async fn admitted_by_automations(
    state: &AppState,
    owner_id: Uuid,
    service: &str,
    event: &ParsedEvent,
) -> Result<bool, sqlx::Error> {
    let candidates = automations::webhook_automations(&state.db_pool, owner_id, service).await?;

    let matching: Vec<_> = candidates
        .iter()
        .filter_map(|automation| {
            let config: WebhookTriggerConfig =
                serde_json::from_value(automation.trigger_config.clone()).ok()?;
            config
                .matches_event_type(&event.event_type)
                .then_some(config)
        })
        .collect();

    if matching.is_empty() {
        return Ok(true);
    }

    let builtins = BuiltinVars::compute(Utc::now(), None);
    Ok(matching.iter().any(|config| {
        let filter = config.effective_filter();
        evaluate_filter(filter.as_ref(), &event.data, &builtins)
    }))
}

/// Gmail two-phase filtering. The notification only carries a history id;
/// the history delta decides whether new messages actually exist. Zero new
/// messages advances the cursor and enqueues nothing. A failed delta call
/// degrades to enqueue-through: losing an event is worse than an occasional
/// no-op wake-up.
async fn handle_gmail(state: &AppState, payload: &Value) -> ApiResult<Response> {
    let notification = gmail::decode_pubsub_envelope(payload)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let owner_id = state
        .credentials
        .resolve_tenant("gmail", &notification.email_address)
        .await?
        .ok_or_else(|| AppError::ServiceNotConnected("gmail".to_string()))?;

    let start_history_id = state
        .credentials
        .get_sync_cursor(owner_id, "gmail")
        .await?
        .unwrap_or_else(|| notification.history_id.clone());

    let token = state
        .credentials
        .access_token(owner_id, "gmail")
        .await
        .ok()
        .flatten();

    let delta = match token {
        Some(token) => {
            state
                .gmail
                .history_delta(&token, &start_history_id, &notification.history_id)
                .await
        }
        None => Err(gmail::GmailError::Api("no access token".into())),
    };

    match delta {
        Ok(delta) if delta.new_message_ids.is_empty() => {
            state
                .credentials
                .set_sync_cursor(owner_id, "gmail", &delta.latest_history_id)
                .await?;
            info!(%owner_id, "gmail notification carried no new messages");
            Ok(Json(json!({
                "status": "ok",
                "received": 1,
                "enqueued": 0,
                "filtered": true,
            }))
            .into_response())
        }
        Ok(delta) => {
            let mut enqueued = 0;
            for message_id in &delta.new_message_ids {
                let outcome = enqueue(
                    &state.db_pool,
                    &NewEvent {
                        owner_id,
                        service: "gmail".to_string(),
                        event_type: "new_email".to_string(),
                        event_id: message_id.clone(),
                        event_data: json!({
                            "message_id": message_id,
                            "email_address": notification.email_address,
                            "history_id": delta.latest_history_id,
                        }),
                    },
                )
                .await?;
                if let EnqueueOutcome::Inserted(_) = outcome {
                    enqueued += 1;
                }
            }

            state
                .credentials
                .set_sync_cursor(owner_id, "gmail", &delta.latest_history_id)
                .await?;

            if enqueued > 0 {
                state.dispatcher.kick();
            }

            Ok(accepted_response(delta.new_message_ids.len(), enqueued, 0))
        }
        Err(e) => {
            warn!(%owner_id, "gmail history delta failed, enqueueing through: {e}");
            let outcome = enqueue(
                &state.db_pool,
                &NewEvent {
                    owner_id,
                    service: "gmail".to_string(),
                    event_type: "new_email".to_string(),
                    event_id: format!(
                        "gmail_{}_{}",
                        notification.email_address, notification.history_id
                    ),
                    event_data: json!({
                        "email_address": notification.email_address,
                        "history_id": notification.history_id,
                    }),
                },
            )
            .await?;

            if let EnqueueOutcome::Inserted(_) = outcome {
                state.dispatcher.kick();
            }
            Ok(accepted_response(1, 1, 0))
        }
    }
}
