// Telegram webhook ingress
//
// Verifies the webhook secret, checks the sender against the allow-list, and
// runs the message through the turn pipeline. Unauthorized senders get one
// fixed rejection text and never touch a session. /start and /help answer
// with canned text without involving the coordinator.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use tally_core::{Turn, TurnPipeline};

use crate::auth::secrets_match;
use crate::services::TelegramClient;

const REJECTION_TEXT: &str =
    "Sorry, you don't have access to this bot. It's a private expense tracker.";

const START_TEXT: &str = "Hi! I'm your expense tracker.\n\n\
You can:\n\
- Add a transaction: 'add lunch 50000'\n\
- Update one: 'change yesterday's soap price to 20000'\n\
- Delete one: 'delete this morning's porridge'\n\
- Check spending: 'total expenses this month'\n\n\
Just chat!";

const HELP_TEXT: &str = "I can help you:\n\
- Record daily expenses\n\
- Update or delete transactions\n\
- Summarize your spending\n\
- Look things up on the web\n\n\
Just type what you need!";

/// App state for the webhook route
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TurnPipeline>,
    pub telegram: TelegramClient,
    pub webhook_secret: Option<String>,
    pub allowed_user_ids: HashSet<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/telegram/webhook", post(telegram_webhook))
        .with_state(state)
}

/// POST /telegram/webhook - receive one update from Telegram
pub async fn telegram_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<TelegramUpdate>,
) -> Result<Json<Value>, StatusCode> {
    if let Some(expected) = &state.webhook_secret {
        let presented = headers
            .get("x-telegram-bot-api-secret-token")
            .and_then(|v| v.to_str().ok());
        match presented {
            None => {
                warn!("Webhook request missing secret token header");
                return Err(StatusCode::UNAUTHORIZED);
            }
            Some(p) if !secrets_match(p, expected) => {
                warn!("Webhook request with invalid secret token");
                return Err(StatusCode::FORBIDDEN);
            }
            Some(_) => {}
        }
    }

    let Some(incoming) = extract_text_message(&update) else {
        // Edits, stickers, joins: acknowledged and ignored.
        return Ok(Json(json!({ "status": "ok" })));
    };

    if !state.allowed_user_ids.contains(&incoming.user_id) {
        warn!(
            user_id = %incoming.user_id,
            username = %incoming.username.as_deref().unwrap_or("unknown"),
            "Unauthorized access attempt blocked"
        );
        send_best_effort(&state.telegram, &incoming.chat_id, REJECTION_TEXT).await;
        return Ok(Json(json!({ "status": "ok" })));
    }

    let reply = match incoming.text.trim() {
        "/start" => START_TEXT.to_string(),
        "/help" => HELP_TEXT.to_string(),
        text => match state
            .pipeline
            .handle_turn(&incoming.user_id, Turn::chat(text))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(user_id = %incoming.user_id, error = %e, "Turn processing failed");
                "Something went wrong on my side. Please try again!".to_string()
            }
        },
    };

    send_best_effort(&state.telegram, &incoming.chat_id, &reply).await;
    Ok(Json(json!({ "status": "ok" })))
}

async fn send_best_effort(telegram: &TelegramClient, chat_id: &str, text: &str) {
    if let Err(e) = telegram.send_message(chat_id, text).await {
        error!(chat_id, error = %e, "Failed to send Telegram reply");
    }
}

struct IncomingMessage {
    user_id: String,
    chat_id: String,
    username: Option<String>,
    text: String,
}

fn extract_text_message(update: &TelegramUpdate) -> Option<IncomingMessage> {
    let message = update.message.as_ref()?;
    let from = message.from.as_ref()?;
    let text = message.text.as_ref()?;

    Some(IncomingMessage {
        user_id: from.id.to_string(),
        chat_id: message.chat.id.to_string(),
        username: from.username.clone(),
        text: text.clone(),
    })
}

// ============================================================================
// Wire types (the subset of Update the bot consumes)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    #[serde(default)]
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_extracts() {
        let raw = r#"{
            "update_id": 1,
            "message": {
                "from": { "id": 42, "username": "alex" },
                "chat": { "id": 42 },
                "text": "add lunch 50000"
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(raw).unwrap();
        let incoming = extract_text_message(&update).unwrap();
        assert_eq!(incoming.user_id, "42");
        assert_eq!(incoming.chat_id, "42");
        assert_eq!(incoming.text, "add lunch 50000");
    }

    #[test]
    fn non_text_updates_are_skipped() {
        let raw = r#"{
            "update_id": 2,
            "message": {
                "from": { "id": 42 },
                "chat": { "id": 42 }
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(raw).unwrap();
        assert!(extract_text_message(&update).is_none());

        let raw = r#"{ "update_id": 3 }"#;
        let update: TelegramUpdate = serde_json::from_str(raw).unwrap();
        assert!(extract_text_message(&update).is_none());
    }
}
