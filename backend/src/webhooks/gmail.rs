// Gmail push notifications
//
// A Gmail Pub/Sub notification only says "the mailbox changed at history X";
// it does not mean a new inbox message exists. The handler must walk the
// history delta to learn whether anything actually arrived: flag flips and
// label changes produce notifications too, and enqueueing them would wake
// automations for nothing.

use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum GmailError {
    #[error("malformed pub/sub envelope: {0}")]
    Envelope(String),
    #[error("gmail api request failed: {0}")]
    Api(String),
}

/// The decoded Pub/Sub notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmailNotification {
    pub email_address: String,
    pub history_id: String,
}

/// Decode the base64 `message.data` of a Pub/Sub push envelope.
pub fn decode_pubsub_envelope(body: &Value) -> Result<GmailNotification, GmailError> {
    let data = body
        .get("message")
        .and_then(|m| m.get("data"))
        .and_then(Value::as_str)
        .ok_or_else(|| GmailError::Envelope("missing message.data".into()))?;

    // Pub/Sub uses URL-safe base64, but some forwarders re-encode standard.
    let decoded = general_purpose::URL_SAFE
        .decode(data)
        .or_else(|_| general_purpose::STANDARD.decode(data))
        .map_err(|e| GmailError::Envelope(format!("base64 decode failed: {e}")))?;

    let payload: Value = serde_json::from_slice(&decoded)
        .map_err(|e| GmailError::Envelope(format!("inner payload is not JSON: {e}")))?;

    let email_address = payload
        .get("emailAddress")
        .and_then(Value::as_str)
        .ok_or_else(|| GmailError::Envelope("missing emailAddress".into()))?
        .to_string();
    let history_id = match payload.get("historyId") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(GmailError::Envelope("missing historyId".into())),
    };

    Ok(GmailNotification {
        email_address,
        history_id,
    })
}

/// What the history delta said about a notification.
#[derive(Debug, Clone)]
pub struct HistoryDelta {
    /// Ids of genuinely new messages since the stored cursor.
    pub new_message_ids: Vec<String>,
    /// Gmail's latest history id, the next cursor value.
    pub latest_history_id: String,
}

/// Minimal Gmail history client. The base URL is injectable for tests.
pub struct GmailClient {
    http: reqwest::Client,
    base_url: String,
}

impl GmailClient {
    pub fn new() -> Self {
        Self::with_base_url("https://gmail.googleapis.com".to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Fetch the message-added delta since `start_history_id`.
    pub async fn history_delta(
        &self,
        access_token: &str,
        start_history_id: &str,
        fallback_history_id: &str,
    ) -> Result<HistoryDelta, GmailError> {
        let url = format!("{}/gmail/v1/users/me/history", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[
                ("startHistoryId", start_history_id),
                ("historyTypes", "messageAdded"),
            ])
            .send()
            .await
            .map_err(|e| GmailError::Api(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GmailError::Api(format!(
                "history request returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GmailError::Api(e.to_string()))?;

        Ok(parse_history_response(&body, fallback_history_id))
    }
}

impl Default for GmailClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract new message ids and the latest history id from a history
/// response. Deltas that carry history entries without messagesAdded are
/// flag churn and contribute nothing.
pub(crate) fn parse_history_response(body: &Value, fallback_history_id: &str) -> HistoryDelta {
    let latest_history_id = match body.get("historyId") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => fallback_history_id.to_string(),
    };

    let mut new_message_ids = Vec::new();
    if let Some(entries) = body.get("history").and_then(Value::as_array) {
        for entry in entries {
            let Some(added) = entry.get("messagesAdded").and_then(Value::as_array) else {
                continue;
            };
            for added_entry in added {
                let Some(id) = added_entry
                    .get("message")
                    .and_then(|m| m.get("id"))
                    .and_then(Value::as_str)
                else {
                    warn!("messagesAdded entry without a message id");
                    continue;
                };
                if !new_message_ids.iter().any(|existing| existing == id) {
                    new_message_ids.push(id.to_string());
                }
            }
        }
    }

    HistoryDelta {
        new_message_ids,
        latest_history_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn envelope(email: &str, history_id: u64) -> Value {
        let inner = json!({"emailAddress": email, "historyId": history_id});
        let encoded = general_purpose::URL_SAFE.encode(inner.to_string());
        json!({"message": {"data": encoded, "messageId": "pub-1"}, "subscription": "sub"})
    }

    #[test]
    fn envelope_decodes() {
        let notification = decode_pubsub_envelope(&envelope("a@gmail.com", 12345)).unwrap();
        assert_eq!(notification.email_address, "a@gmail.com");
        assert_eq!(notification.history_id, "12345");
    }

    #[test]
    fn envelope_rejects_garbage() {
        assert!(decode_pubsub_envelope(&json!({"message": {}})).is_err());
        assert!(decode_pubsub_envelope(&json!({"message": {"data": "!!!"}})).is_err());
    }

    #[test]
    fn history_parse_collects_unique_message_ids() {
        let body = json!({
            "historyId": "999",
            "history": [
                {"id": "1", "messagesAdded": [{"message": {"id": "m1"}}]},
                {"id": "2", "labelsRemoved": [{"message": {"id": "m1"}}]},
                {"id": "3", "messagesAdded": [
                    {"message": {"id": "m1"}},
                    {"message": {"id": "m2"}}
                ]}
            ]
        });
        let delta = parse_history_response(&body, "0");
        assert_eq!(delta.new_message_ids, vec!["m1", "m2"]);
        assert_eq!(delta.latest_history_id, "999");
    }

    #[test]
    fn history_parse_empty_delta() {
        let body = json!({"historyId": 1000});
        let delta = parse_history_response(&body, "0");
        assert!(delta.new_message_ids.is_empty());
        assert_eq!(delta.latest_history_id, "1000");
    }

    #[tokio::test]
    async fn history_delta_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .and(query_param("startHistoryId", "500"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "historyId": "510",
                "history": [{"id": "501", "messagesAdded": [{"message": {"id": "msg-1"}}]}]
            })))
            .mount(&server)
            .await;

        let client = GmailClient::with_base_url(server.uri());
        let delta = client.history_delta("token", "500", "505").await.unwrap();
        assert_eq!(delta.new_message_ids, vec!["msg-1"]);
        assert_eq!(delta.latest_history_id, "510");
    }

    #[tokio::test]
    async fn history_delta_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = GmailClient::with_base_url(server.uri());
        assert!(client.history_delta("token", "500", "505").await.is_err());
    }
}
