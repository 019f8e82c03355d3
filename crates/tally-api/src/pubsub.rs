// Gmail Pub/Sub push ingress
//
// The push transport is at-least-once and retries aggressively on anything
// but a prompt acknowledgement, so this handler authenticates, decodes, and
// returns 204 immediately; the actual work happens in a spawned background
// task. Deduplication belongs to the event cursor downstream, not here.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::secrets_match;
use crate::services::NotificationProcessor;

/// App state for the push route
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<NotificationProcessor>,
    pub auth_token: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/pubsub/push", post(pubsub_push))
        .with_state(state)
}

/// POST /pubsub/push - receive one push delivery
pub async fn pubsub_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<PubSubEnvelope>,
) -> StatusCode {
    if let Some(expected) = &state.auth_token {
        let presented = headers
            .get("x-pubsub-auth-token")
            .and_then(|v| v.to_str().ok());
        if !presented.is_some_and(|p| secrets_match(p, expected)) {
            warn!("Push delivery with missing or invalid auth token");
            return StatusCode::FORBIDDEN;
        }
    }

    match decode_notification(&envelope) {
        Ok(notification) => {
            info!(
                mailbox = %notification.email_address,
                marker = %notification.history_id,
                "Push notification accepted"
            );
            let processor = state.processor.clone();
            tokio::spawn(async move {
                processor
                    .process(&notification.email_address, &notification.history_id)
                    .await;
            });
        }
        Err(e) => {
            // Acknowledge anyway: redelivering an undecodable payload forever
            // helps nobody.
            warn!(error = %e, "Could not decode push payload");
        }
    }

    StatusCode::NO_CONTENT
}

/// Pub/Sub push envelope
#[derive(Debug, Clone, Deserialize)]
pub struct PubSubEnvelope {
    pub message: PubSubMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PubSubMessage {
    /// Base64-encoded JSON: {"emailAddress": ..., "historyId": ...}
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
    #[serde(default, rename = "publishTime")]
    pub publish_time: Option<String>,
}

/// The decoded payload: which mailbox changed and the latest marker hint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxNotification {
    pub email_address: String,
    pub history_id: HistoryId,
}

/// historyId arrives as a number or a string depending on payload age
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum HistoryId {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for HistoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryId::Number(n) => write!(f, "{n}"),
            HistoryId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl MailboxNotification {
    fn history_id_string(&self) -> String {
        self.history_id.to_string()
    }
}

struct DecodedNotification {
    email_address: String,
    history_id: String,
}

fn decode_notification(envelope: &PubSubEnvelope) -> anyhow::Result<DecodedNotification> {
    let data = envelope
        .message
        .data
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("push message has no data"))?;
    let decoded = STANDARD.decode(data)?;
    let notification: MailboxNotification = serde_json::from_slice(&decoded)?;
    Ok(DecodedNotification {
        history_id: notification.history_id_string(),
        email_address: notification.email_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope_with(data: serde_json::Value) -> PubSubEnvelope {
        let encoded = STANDARD.encode(data.to_string());
        PubSubEnvelope {
            message: PubSubMessage {
                data: Some(encoded),
                message_id: Some("m1".into()),
                publish_time: None,
            },
            subscription: Some("projects/p/subscriptions/s".into()),
        }
    }

    #[test]
    fn numeric_and_string_history_ids_both_decode() {
        let decoded = decode_notification(&envelope_with(json!({
            "emailAddress": "me@example.com",
            "historyId": 4711
        })))
        .unwrap();
        assert_eq!(decoded.email_address, "me@example.com");
        assert_eq!(decoded.history_id, "4711");

        let decoded = decode_notification(&envelope_with(json!({
            "emailAddress": "me@example.com",
            "historyId": "4712"
        })))
        .unwrap();
        assert_eq!(decoded.history_id, "4712");
    }

    #[test]
    fn missing_data_is_an_error() {
        let envelope = PubSubEnvelope {
            message: PubSubMessage {
                data: None,
                message_id: None,
                publish_time: None,
            },
            subscription: None,
        };
        assert!(decode_notification(&envelope).is_err());
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let envelope = PubSubEnvelope {
            message: PubSubMessage {
                data: Some("!!!not-base64!!!".into()),
                message_id: None,
                publish_time: None,
            },
            subscription: None,
        };
        assert!(decode_notification(&envelope).is_err());
    }
}
