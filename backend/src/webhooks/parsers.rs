// Per-service webhook payload parsers
//
// Each parser normalizes a delivery into zero or more events carrying the
// external tenant id the credential store resolves to an owner. Parsers are
// pure over the payload; handshakes and signature checks happen before
// parsing.

use axum::http::HeaderMap;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unsupported webhook service: {0}")]
    UnsupportedService(String),
    #[error("malformed {service} payload: {reason}")]
    Malformed { service: &'static str, reason: String },
}

/// One normalized event from a delivery, before tenant resolution.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    /// External workspace/team/account identifier. `None` means the tenant
    /// is carried another way (Microsoft's clientState is the owner id).
    pub external_tenant: Option<String>,
    pub event_type: String,
    pub event_id: String,
    pub data: Value,
}

fn malformed(service: &'static str, reason: impl Into<String>) -> ParseError {
    ParseError::Malformed {
        service,
        reason: reason.into(),
    }
}

/// Slack Events API: a `team_id` plus one inner event.
fn parse_slack(body: &Value) -> Result<Vec<ParsedEvent>, ParseError> {
    let team_id = body
        .get("team_id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("slack", "missing team_id"))?;
    let event = body
        .get("event")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("slack", "missing event object"))?;

    let event_type = event
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("message")
        .to_string();
    // client_msg_id is unique per message; fall back to the event timestamp.
    let event_id = event
        .get("client_msg_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            event
                .get("event_ts")
                .or_else(|| event.get("ts"))
                .and_then(Value::as_str)
                .map(|ts| format!("{team_id}_{ts}"))
        })
        .ok_or_else(|| malformed("slack", "event has no id or timestamp"))?;

    Ok(vec![ParsedEvent {
        external_tenant: Some(team_id.to_string()),
        event_type,
        event_id,
        data: Value::Object(event.clone()),
    }])
}

/// Todoist: one event per delivery, tenant is the numeric user id.
fn parse_todoist(body: &Value) -> Result<Vec<ParsedEvent>, ParseError> {
    let event_name = body
        .get("event_name")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("todoist", "missing event_name"))?;
    let user_id = body
        .get("user_id")
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .ok_or_else(|| malformed("todoist", "missing user_id"))?;
    let event_data = body.get("event_data").cloned().unwrap_or(Value::Null);
    let item_id = event_data
        .get("id")
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .ok_or_else(|| malformed("todoist", "event_data has no id"))?;

    Ok(vec![ParsedEvent {
        external_tenant: Some(user_id),
        event_type: event_name.to_string(),
        event_id: format!("todoist_{event_name}_{item_id}"),
        data: event_data,
    }])
}

/// Fitbit: an array of collection notifications, one event each.
fn parse_fitbit(body: &Value) -> Result<Vec<ParsedEvent>, ParseError> {
    let notifications = body
        .as_array()
        .ok_or_else(|| malformed("fitbit", "payload is not an array"))?;

    notifications
        .iter()
        .map(|n| {
            let owner = n
                .get("ownerId")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("fitbit", "notification missing ownerId"))?;
            let collection = n
                .get("collectionType")
                .and_then(Value::as_str)
                .unwrap_or("activities");
            let date = n.get("date").and_then(Value::as_str).unwrap_or("unknown");

            Ok(ParsedEvent {
                external_tenant: Some(owner.to_string()),
                event_type: collection.to_string(),
                event_id: format!("fitbit_{owner}_{collection}_{date}"),
                data: n.clone(),
            })
        })
        .collect()
}

/// Microsoft Graph change notifications: `value` array; clientState carries
/// the owner id directly. Read-state updates (`changeType=updated`) are
/// dropped here so only genuinely new items propagate.
fn parse_microsoft(body: &Value) -> Result<Vec<ParsedEvent>, ParseError> {
    let notifications = body
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("microsoft", "missing value array"))?;

    Ok(notifications
        .iter()
        .filter_map(|n| {
            let change_type = n.get("changeType").and_then(Value::as_str).unwrap_or("created");
            if change_type.eq_ignore_ascii_case("updated") {
                return None;
            }
            let client_state = n.get("clientState").and_then(Value::as_str)?;
            let resource_id = n
                .get("resourceData")
                .and_then(|d| d.get("id"))
                .and_then(Value::as_str)?;

            Some(ParsedEvent {
                external_tenant: Some(client_state.to_string()),
                event_type: change_type.to_string(),
                event_id: resource_id.to_string(),
                data: n.clone(),
            })
        })
        .collect())
}

/// Notion: a single delivery with a workspace id and a typed entity.
fn parse_notion(body: &Value) -> Result<Vec<ParsedEvent>, ParseError> {
    let workspace = body
        .get("workspace_id")
        .and_then(Value::as_str)
        .or_else(|| {
            body.get("workspace")
                .and_then(|w| w.get("id"))
                .and_then(Value::as_str)
        })
        .ok_or_else(|| malformed("notion", "missing workspace id"))?;
    let event_type = body
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("page.updated")
        .to_string();
    let event_id = body
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed("notion", "missing delivery id"))?;

    Ok(vec![ParsedEvent {
        external_tenant: Some(workspace.to_string()),
        event_type,
        event_id,
        data: body.clone(),
    }])
}

/// Google Calendar push: state lives in headers, the body is empty. Sync
/// handshake deliveries (`resource-state: sync`) produce no events.
fn parse_google_calendar(headers: &HeaderMap) -> Result<Vec<ParsedEvent>, ParseError> {
    let state = headers
        .get("x-goog-resource-state")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| malformed("google-calendar", "missing x-goog-resource-state"))?;
    if state.eq_ignore_ascii_case("sync") {
        return Ok(vec![]);
    }

    let channel_id = headers
        .get("x-goog-channel-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| malformed("google-calendar", "missing x-goog-channel-id"))?;
    let resource_id = headers
        .get("x-goog-resource-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let message_number = headers
        .get("x-goog-message-number")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("0");

    Ok(vec![ParsedEvent {
        external_tenant: Some(channel_id.to_string()),
        event_type: state.to_string(),
        event_id: format!("gcal_{resource_id}_{message_number}"),
        data: serde_json::json!({
            "resource_state": state,
            "resource_id": resource_id,
            "channel_id": channel_id,
            "message_number": message_number,
        }),
    }])
}

/// Parse a delivery for `service` into normalized events. Gmail is handled
/// separately: its notifications need the history delta before they mean
/// anything.
pub fn parse(
    service: &str,
    body: &Value,
    headers: &HeaderMap,
) -> Result<Vec<ParsedEvent>, ParseError> {
    match service {
        "slack" => parse_slack(body),
        "todoist" => parse_todoist(body),
        "fitbit" => parse_fitbit(body),
        "microsoft" | "outlook" => parse_microsoft(body),
        "notion" => parse_notion(body),
        "google-calendar" => parse_google_calendar(headers),
        other => Err(ParseError::UnsupportedService(other.to_string())),
    }
}
