// Telegram sendMessage client
//
// Used for chat replies and for notification-originated agent output. Sends
// plain text - no parse_mode, so model output can never break entity parsing.

use std::time::Duration;

use serde_json::json;
use tally_core::{Result, TallyError};

const DEFAULT_API_URL: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    bot_token: String,
    api_url: String,
}

impl TelegramClient {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.into(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    /// Point at a different endpoint (for tests)
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| TallyError::transient_write(format!("telegram request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TallyError::transient_write(format!(
                "telegram API {status}: {body}"
            )));
        }
        Ok(())
    }
}
