// Search capability handler
//
// Information lookup beyond the ledger: the extractor produces a search
// query, the lookup provider answers it, and the reply is synthesized from
// the instant answer and result snippets.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Result, TallyError};
use crate::lookup::{LookupOutcome, LookupProvider};
use crate::retry::{retry_transient, RetryPolicy};
use crate::session::Session;
use crate::traits::{Extraction, IntentModel, OperationSchema};
use crate::turn::Turn;

use super::{reply_for_error, CapabilityHandler, HandlerKind, HandlerReply};

const DESCRIPTION: &str = "Internet search, general knowledge, news, and any question \
beyond expense tracking.";

const MAX_RESULTS: usize = 5;

/// Information-lookup handler
pub struct SearchHandler {
    model: Arc<dyn IntentModel>,
    lookup: Arc<dyn LookupProvider>,
    retry: RetryPolicy,
}

impl SearchHandler {
    pub fn new(model: Arc<dyn IntentModel>, lookup: Arc<dyn LookupProvider>) -> Self {
        Self {
            model,
            lookup,
            retry: RetryPolicy::exponential().with_max_attempts(3),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn run_lookup(&self, query: &str) -> Result<HandlerReply> {
        let outcome = retry_transient(&self.retry, "lookup.search", || async {
            self.lookup.search(query, MAX_RESULTS).await
        })
        .await?;

        if outcome.is_empty() {
            return Ok(HandlerReply::done(format!(
                "I couldn't find anything useful for \"{query}\"."
            )));
        }
        Ok(HandlerReply::done(render_outcome(query, &outcome)))
    }
}

#[async_trait]
impl CapabilityHandler for SearchHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Search
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn operations(&self) -> Vec<OperationSchema> {
        vec![OperationSchema {
            name: "lookup".to_string(),
            description: "Search the web for information".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "A specific, well-crafted search query" }
                },
                "required": ["query"]
            }),
        }]
    }

    async fn handle(&self, session: &Session, turn: &Turn) -> Result<HandlerReply> {
        let history_start = session.turns.len().saturating_sub(4);
        let extraction = self
            .model
            .extract(turn, &session.turns[history_start..], &self.operations())
            .await;

        let reply = match extraction {
            Ok(Extraction::Ambiguous(question)) => HandlerReply::clarify(question),
            Ok(Extraction::Operation(call)) if call.operation == "lookup" => {
                match parse_query(call.arguments) {
                    Ok(query) => match self.run_lookup(&query).await {
                        Ok(reply) => reply,
                        Err(e) => reply_for_error(e),
                    },
                    Err(e) => reply_for_error(e),
                }
            }
            Ok(Extraction::Operation(_)) => {
                HandlerReply::clarify("What would you like me to look up?")
            }
            Err(e) => reply_for_error(e),
        };
        Ok(reply)
    }
}

#[derive(Debug, Deserialize)]
struct LookupArgs {
    query: String,
}

fn parse_query(arguments: serde_json::Value) -> Result<String> {
    let args: LookupArgs = serde_json::from_value(arguments)
        .map_err(|e| TallyError::invalid(format!("I couldn't read the search query: {e}")))?;
    if args.query.trim().is_empty() {
        return Err(TallyError::invalid("What would you like me to look up?"));
    }
    Ok(args.query)
}

fn render_outcome(query: &str, outcome: &LookupOutcome) -> String {
    let mut lines = Vec::new();
    if let Some(answer) = &outcome.instant_answer {
        lines.push(answer.clone());
    }
    if !outcome.results.is_empty() {
        if lines.is_empty() {
            lines.push(format!("Here's what I found for \"{query}\":"));
        }
        for result in &outcome.results {
            lines.push(format!("- {} ({})", result.snippet, result.url));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::LookupResult;
    use crate::memory::{ScriptedIntentModel, StaticLookup};
    use crate::traits::OperationCall;

    async fn scripted_lookup_call(content: &str, query: &str) -> ScriptedIntentModel {
        let model = ScriptedIntentModel::new();
        let call = Extraction::Operation(OperationCall {
            operation: "lookup".into(),
            arguments: json!({ "query": query }),
        });
        model.script_extraction(content, call).await;
        model
    }

    #[tokio::test]
    async fn lookup_renders_instant_answer_first() {
        let model = scripted_lookup_call("capital of indonesia?", "capital of Indonesia").await;
        let lookup = StaticLookup::with_outcome(LookupOutcome {
            instant_answer: Some("Jakarta is the capital of Indonesia.".into()),
            results: vec![LookupResult {
                title: "Jakarta".into(),
                url: "https://example.com/jakarta".into(),
                snippet: "Jakarta - capital city".into(),
            }],
        });

        let handler = SearchHandler::new(Arc::new(model), Arc::new(lookup))
            .with_retry_policy(RetryPolicy::no_retry());
        let reply = handler
            .handle(&Session::new("u1"), &Turn::chat("capital of indonesia?"))
            .await
            .unwrap();

        assert!(reply.text.starts_with("Jakarta is the capital"));
        assert!(reply.text.contains("https://example.com/jakarta"));
        assert!(!reply.keep_active);
    }

    #[tokio::test]
    async fn empty_outcome_says_nothing_found() {
        let model = scripted_lookup_call("whats xyzzy", "xyzzy").await;
        let handler = SearchHandler::new(
            Arc::new(model),
            Arc::new(StaticLookup::with_outcome(LookupOutcome::default())),
        )
        .with_retry_policy(RetryPolicy::no_retry());

        let reply = handler
            .handle(&Session::new("u1"), &Turn::chat("whats xyzzy"))
            .await
            .unwrap();
        assert!(reply.text.contains("couldn't find"));
    }
}
