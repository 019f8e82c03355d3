// Gmail MailProvider implementation
//
// "List changes since marker" maps to users.history.list restricted to
// messageAdded events on the payment label; "fetch item by id" maps to
// users.messages.get with a multipart body walk. Failures are transient by
// contract (the event cursor retries them), except auth failures which are
// configuration problems.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use tracing::warn;

use tally_core::{MailMessage, MailProvider, Result, TallyError};

use crate::auth::TokenProvider;

const DEFAULT_API_URL: &str = "https://gmail.googleapis.com/gmail/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Gmail REST client
#[derive(Clone)]
pub struct GmailClient {
    client: reqwest::Client,
    token: Arc<dyn TokenProvider>,
    api_url: String,
}

impl GmailClient {
    pub fn new(token: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    /// Point at a different endpoint (for tests and proxies)
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Resolve a label name ("PaymentNotifications") to its label id.
    /// Returns None when the label does not exist.
    pub async fn resolve_label(&self, mailbox_id: &str, name: &str) -> Result<Option<String>> {
        let url = format!("{}/users/{}/labels", self.api_url, mailbox_id);
        let body: LabelsResponse = self.get_json(&url, &[]).await?;

        Ok(body
            .labels
            .into_iter()
            .find(|l| l.name == name)
            .map(|l| l.id))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let token = self.token.bearer_token().await?;
        let response = self
            .client
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| TallyError::transient_fetch(format!("gmail request: {e}")))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TallyError::config(format!("gmail auth failed: {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TallyError::transient_fetch(format!(
                "gmail API {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TallyError::transient_fetch(format!("gmail response: {e}")))
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn list_added_since(
        &self,
        mailbox_id: &str,
        start_marker: &str,
        end_marker: &str,
        label_id: &str,
    ) -> Result<Vec<String>> {
        // The history API only bounds below; the upper bound is enforced here
        // against each record's own history id.
        let end: u64 = end_marker
            .trim()
            .parse()
            .map_err(|_| TallyError::invalid(format!("Marker is not numeric: '{end_marker}'")))?;

        let url = format!("{}/users/{}/history", self.api_url, mailbox_id);
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("startHistoryId", start_marker),
                ("historyTypes", "messageAdded"),
                ("labelId", label_id),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let body: HistoryResponse = self.get_json(&url, &query).await?;
            collect_added_ids(&body, label_id, end, &mut ids);

            match body.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(ids)
    }

    async fn latest_message_id(
        &self,
        mailbox_id: &str,
        label_id: &str,
    ) -> Result<Option<String>> {
        let url = format!("{}/users/{}/messages", self.api_url, mailbox_id);
        let body: MessageListResponse = self
            .get_json(&url, &[("labelIds", label_id), ("maxResults", "1")])
            .await?;
        Ok(body.messages.into_iter().next().map(|m| m.id))
    }

    async fn fetch_message(&self, mailbox_id: &str, message_id: &str) -> Result<MailMessage> {
        let url = format!(
            "{}/users/{}/messages/{}",
            self.api_url, mailbox_id, message_id
        );
        let body: FullMessage = self.get_json(&url, &[("format", "full")]).await?;

        Ok(flatten_message(message_id, &body))
    }
}

fn collect_added_ids(body: &HistoryResponse, label_id: &str, end_marker: u64, out: &mut Vec<String>) {
    for record in &body.history {
        // Changes recorded past the notified marker belong to the next push.
        let past_end = record
            .id
            .as_deref()
            .and_then(|id| id.trim().parse::<u64>().ok())
            .is_some_and(|id| id > end_marker);
        if past_end {
            continue;
        }
        for added in &record.messages_added {
            let message = &added.message;
            // The history list can include adds for other labels; keep only
            // messages actually carrying the watched label.
            if !message.label_ids.iter().any(|l| l == label_id) {
                continue;
            }
            if !out.contains(&message.id) {
                out.push(message.id.clone());
            }
        }
    }
}

fn flatten_message(message_id: &str, message: &FullMessage) -> MailMessage {
    let subject = header_value(&message.payload, "Subject").unwrap_or_else(|| "No Subject".into());
    let sender = header_value(&message.payload, "From").unwrap_or_else(|| "Unknown".into());
    let body = extract_body(&message.payload).unwrap_or_default();

    MailMessage {
        id: message_id.to_string(),
        subject,
        sender,
        body,
    }
}

fn header_value(payload: &MessagePayload, name: &str) -> Option<String> {
    payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Depth-first walk over the multipart tree for the first decodable
/// text/plain or text/html part.
fn extract_body(payload: &MessagePayload) -> Option<String> {
    if matches!(payload.mime_type.as_str(), "text/plain" | "text/html") {
        if let Some(data) = &payload.body.data {
            if let Some(text) = decode_body(data) {
                return Some(text);
            }
        }
    }
    for part in &payload.parts {
        if let Some(text) = extract_body(part) {
            return Some(text);
        }
    }
    None
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .ok()?;
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "Mail body is not valid UTF-8, skipping part");
            None
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct LabelsResponse {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    /// History id at which this change was recorded
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
    #[serde(default)]
    label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
struct MessageId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FullMessage {
    payload: MessagePayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: PartBody,
    #[serde(default)]
    parts: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct PartBody {
    data: Option<String>,
}
