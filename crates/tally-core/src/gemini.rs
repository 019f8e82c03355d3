// Gemini classifier/extractor
//
// Implementation of IntentModel against the Gemini generateContent API.
// Calls are non-streaming and forced into function calls: classification
// through a single route_to declaration, extraction through the handler's
// operation schemas plus an ask_clarification escape hatch. The API is
// non-deterministic by contract; retryable HTTP failures (408/429/5xx) map to
// transient errors and are retried under the driver's own policy.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TallyError};
use crate::handlers::HandlerKind;
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::{
    Extraction, HandlerDescription, IntentModel, OperationCall, OperationSchema,
};
use crate::turn::{Turn, TurnRole};

const DEFAULT_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ROUTE_FN: &str = "route_to";
const CLARIFY_FN: &str = "ask_clarification";

/// Gemini-backed intent model
#[derive(Clone)]
pub struct GeminiIntentModel {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
    retry: RetryPolicy,
}

impl GeminiIntentModel {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            retry: RetryPolicy::exponential(),
        }
    }

    /// Create from the GOOGLE_API_KEY environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| TallyError::config("GOOGLE_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at a different endpoint (for Gemini-compatible proxies)
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn generate(
        &self,
        system: &str,
        contents: Vec<GeminiContent>,
        declarations: Vec<GeminiFunctionDeclaration>,
        allowed: Vec<String>,
    ) -> Result<GeminiCandidateContent> {
        let request = GeminiRequest {
            system_instruction: GeminiSystemInstruction {
                parts: vec![GeminiPart::text(system)],
            },
            contents,
            tools: vec![GeminiTools {
                function_declarations: declarations,
            }],
            tool_config: GeminiToolConfig {
                function_calling_config: GeminiFunctionCallingConfig {
                    mode: "ANY".to_string(),
                    allowed_function_names: allowed,
                },
            },
            generation_config: GeminiGenerationConfig { temperature: 0.0 },
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.api_url, self.model
        );

        retry_transient(&self.retry, "gemini.generate", || async {
            let response = self
                .client
                .post(&url)
                .timeout(REQUEST_TIMEOUT)
                .header("x-goog-api-key", &self.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| TallyError::transient_fetch(format!("Gemini request: {e}")))?;

            let status = response.status();
            if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                return Err(TallyError::transient_fetch(format!(
                    "Gemini API {status}: {body}"
                )));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TallyError::classifier(format!("Gemini API {status}: {body}")));
            }

            let body: GeminiResponse = response
                .json()
                .await
                .map_err(|e| TallyError::classifier(format!("Gemini response: {e}")))?;

            body.candidates
                .into_iter()
                .next()
                .map(|c| c.content)
                .ok_or_else(|| TallyError::classifier("Gemini returned no candidates"))
        })
        .await
    }
}

#[async_trait]
impl IntentModel for GeminiIntentModel {
    async fn classify(
        &self,
        turn: &Turn,
        handlers: &[HandlerDescription],
    ) -> Result<Option<HandlerKind>> {
        let mut capability_lines = String::new();
        let mut names: Vec<String> = Vec::new();
        for handler in handlers {
            capability_lines.push_str(&format!(
                "- {}: {}\n",
                handler.kind, handler.description
            ));
            names.push(handler.kind.to_string());
        }

        let system = format!(
            "You route one user message to exactly one capability, or to none.\n\
             Capabilities:\n{capability_lines}\
             Call {ROUTE_FN} with the capability name, or \"none\" when no \
             capability plausibly matches."
        );

        let declaration = GeminiFunctionDeclaration {
            name: ROUTE_FN.to_string(),
            description: "Choose the capability for this message".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "handler": {
                        "type": "string",
                        "enum": names.iter().cloned().chain(["none".to_string()]).collect::<Vec<_>>()
                    }
                },
                "required": ["handler"]
            }),
        };

        let contents = vec![GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart::text(&turn.content)],
        }];

        let content = self
            .generate(&system, contents, vec![declaration], vec![ROUTE_FN.to_string()])
            .await?;

        let Some(call) = content.first_function_call() else {
            return Ok(None);
        };
        let chosen = call
            .args
            .get("handler")
            .and_then(Value::as_str)
            .unwrap_or("none");

        if chosen == "none" {
            return Ok(None);
        }
        Ok(HandlerKind::from_str(chosen).ok())
    }

    async fn extract(
        &self,
        turn: &Turn,
        history: &[Turn],
        operations: &[OperationSchema],
    ) -> Result<Extraction> {
        let mut declarations: Vec<GeminiFunctionDeclaration> = operations
            .iter()
            .map(|op| GeminiFunctionDeclaration {
                name: op.name.clone(),
                description: op.description.clone(),
                parameters: op.parameters.clone(),
            })
            .collect();
        declarations.push(GeminiFunctionDeclaration {
            name: CLARIFY_FN.to_string(),
            description: "Ask the user one clarifying question when the request is ambiguous \
                          or is missing required details"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "question": { "type": "string" } },
                "required": ["question"]
            }),
        });

        let allowed: Vec<String> = declarations.iter().map(|d| d.name.clone()).collect();

        let system = "You extract one structured operation from the user's message, using \
                      the conversation so far for context. If the request is ambiguous or \
                      missing required fields, call ask_clarification instead of guessing.";

        // Replay the recent history so follow-ups resolve against it; the
        // current turn is already its last element when it came through a
        // session append.
        let mut contents: Vec<GeminiContent> = history
            .iter()
            .map(|t| GeminiContent {
                role: match t.role {
                    TurnRole::User => "user".to_string(),
                    _ => "model".to_string(),
                },
                parts: vec![GeminiPart::text(&t.content)],
            })
            .collect();
        if !history.iter().any(|t| t.id == turn.id) {
            contents.push(GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart::text(&turn.content)],
            });
        }

        let content = self.generate(system, contents, declarations, allowed).await?;

        let Some(call) = content.first_function_call() else {
            // A plain-text reply is treated as the model asking for more.
            let text = content.first_text().unwrap_or_default();
            if text.trim().is_empty() {
                return Err(TallyError::classifier("Gemini returned neither call nor text"));
            }
            return Ok(Extraction::Ambiguous(text));
        };

        if call.name == CLARIFY_FN {
            let question = call
                .args
                .get("question")
                .and_then(Value::as_str)
                .unwrap_or("Could you give me more detail?")
                .to_string();
            return Ok(Extraction::Ambiguous(question));
        }

        Ok(Extraction::Operation(OperationCall {
            operation: call.name.clone(),
            arguments: call.args.clone(),
        }))
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    system_instruction: GeminiSystemInstruction,
    contents: Vec<GeminiContent>,
    tools: Vec<GeminiTools>,
    tool_config: GeminiToolConfig,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            function_call: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTools {
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiToolConfig {
    function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFunctionCallingConfig {
    mode: String,
    allowed_function_names: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

impl GeminiCandidateContent {
    fn first_function_call(&self) -> Option<&GeminiFunctionCall> {
        self.parts.iter().find_map(|p| p.function_call.as_ref())
    }

    fn first_text(&self) -> Option<String> {
        self.parts.iter().find_map(|p| p.text.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_with_function_call_parses() {
        let raw = r#"{
            "candidates": [{
                "content": {
                    "parts": [{
                        "functionCall": {
                            "name": "add_transaction",
                            "args": { "memo": "Yogurt", "amount": 15000, "category": "Food" }
                        }
                    }]
                }
            }]
        }"#;
        let response: GeminiResponse = serde_json::from_str(raw).unwrap();
        let content = &response.candidates[0].content;
        let call = content.first_function_call().unwrap();
        assert_eq!(call.name, "add_transaction");
        assert_eq!(call.args["memo"], "Yogurt");
    }

    #[test]
    fn response_with_text_only_parses() {
        let raw = r#"{
            "candidates": [{
                "content": { "parts": [{ "text": "Which soap do you mean?" }] }
            }]
        }"#;
        let response: GeminiResponse = serde_json::from_str(raw).unwrap();
        let content = &response.candidates[0].content;
        assert!(content.first_function_call().is_none());
        assert_eq!(
            content.first_text().unwrap(),
            "Which soap do you mean?"
        );
    }

    #[test]
    fn request_serializes_camel_case() {
        let request = GeminiRequest {
            system_instruction: GeminiSystemInstruction {
                parts: vec![GeminiPart::text("route")],
            },
            contents: vec![],
            tools: vec![GeminiTools {
                function_declarations: vec![],
            }],
            tool_config: GeminiToolConfig {
                function_calling_config: GeminiFunctionCallingConfig {
                    mode: "ANY".into(),
                    allowed_function_names: vec!["route_to".into()],
                },
            },
            generation_config: GeminiGenerationConfig { temperature: 0.0 },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("systemInstruction").is_some());
        assert!(value.get("toolConfig").is_some());
        assert_eq!(
            value["toolConfig"]["functionCallingConfig"]["mode"],
            "ANY"
        );
    }
}
