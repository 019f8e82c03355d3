// Service configuration
//
// One AppConfig resolved from the environment at process start and passed
// explicitly to the components that need it - no ad hoc env lookups at call
// time.

use std::collections::HashSet;

use tally_core::{Result, TallyError};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bind address, e.g. "0.0.0.0:8080"
    pub bind_addr: String,

    pub database_url: String,

    /// Shared secret expected in X-PubSub-Auth-Token. When unset, push
    /// deliveries are accepted unauthenticated (local development only).
    pub pubsub_auth_token: Option<String>,

    pub telegram_bot_token: String,

    /// Shared secret expected in X-Telegram-Bot-Api-Secret-Token
    pub telegram_webhook_secret: Option<String>,

    /// Telegram user ids allowed to talk to the bot
    pub allowed_user_ids: HashSet<String>,

    /// Chat that receives notification-originated replies
    pub notification_chat_id: String,

    /// Mailbox the cursor watches ("me" for the authorized account)
    pub mailbox_id: String,

    /// Gmail label marking payment mails
    pub payment_label: String,

    pub google_api_key: String,
    pub llm_model: String,

    /// Bearer token env-sourced for Gmail reads
    pub gmail_token: String,
    /// Bearer token env-sourced for Sheets reads/writes
    pub sheets_token: String,

    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub sheet_gid: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let notification_chat_id = require("TELEGRAM_USER_ID")?;

        // Allow-list defaults to the notification target, as the bot is
        // single-tenant unless told otherwise.
        let allowed_user_ids = parse_allow_list(
            &std::env::var("ALLOWED_TELEGRAM_USER_IDS")
                .unwrap_or_else(|_| notification_chat_id.clone()),
        );

        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: require("DATABASE_URL")?,
            pubsub_auth_token: optional("PUBSUB_AUTH_TOKEN"),
            telegram_bot_token: require("TELEGRAM_BOT_TOKEN")?,
            telegram_webhook_secret: optional("TELEGRAM_WEBHOOK_SECRET"),
            allowed_user_ids,
            notification_chat_id,
            mailbox_id: std::env::var("GMAIL_MAILBOX").unwrap_or_else(|_| "me".to_string()),
            payment_label: std::env::var("PAYMENT_LABEL")
                .unwrap_or_else(|_| "PaymentNotifications".to_string()),
            google_api_key: require("GOOGLE_API_KEY")?,
            llm_model: std::env::var("LLM_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            gmail_token: require("GMAIL_ACCESS_TOKEN")?,
            sheets_token: require("SHEETS_ACCESS_TOKEN")?,
            spreadsheet_id: require("SHEET_ID")?,
            sheet_name: std::env::var("SHEET_NAME").unwrap_or_else(|_| "Expenses".to_string()),
            sheet_gid: std::env::var("SHEET_GID")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }
}

fn require(var: &str) -> Result<String> {
    std::env::var(var)
        .map_err(|_| TallyError::config(format!("{var} environment variable required")))
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|s| !s.is_empty())
}

fn parse_allow_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_parsing() {
        let parsed = parse_allow_list("123, 456,,789 ");
        assert_eq!(parsed.len(), 3);
        assert!(parsed.contains("456"));
        assert!(parsed.contains("789"));

        assert!(parse_allow_list("").is_empty());
    }
}
