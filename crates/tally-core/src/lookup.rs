// Web lookup collaborator
//
// The search handler's backing provider. DuckDuckGo's instant-answer API is
// the production implementation; tests use the static stub in crate::memory.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, TallyError};

const DEFAULT_API_URL: &str = "https://api.duckduckgo.com/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One web search hit
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Outcome of a lookup: an instant answer when available, plus result hits
#[derive(Debug, Clone, Default)]
pub struct LookupOutcome {
    pub instant_answer: Option<String>,
    pub results: Vec<LookupResult>,
}

impl LookupOutcome {
    pub fn is_empty(&self) -> bool {
        self.instant_answer.is_none() && self.results.is_empty()
    }
}

/// Information-lookup collaborator behind the search handler
#[async_trait]
pub trait LookupProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<LookupOutcome>;
}

/// DuckDuckGo instant-answer client
#[derive(Clone)]
pub struct DuckDuckGoLookup {
    client: reqwest::Client,
    api_url: String,
}

impl DuckDuckGoLookup {
    pub fn new() -> Self {
        Self::with_api_url(DEFAULT_API_URL)
    }

    pub fn with_api_url(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
        }
    }
}

impl Default for DuckDuckGoLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LookupProvider for DuckDuckGoLookup {
    async fn search(&self, query: &str, max_results: usize) -> Result<LookupOutcome> {
        let response = self
            .client
            .get(&self.api_url)
            .timeout(REQUEST_TIMEOUT)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| TallyError::transient_fetch(format!("lookup request: {e}")))?;

        if !response.status().is_success() {
            return Err(TallyError::transient_fetch(format!(
                "lookup API returned {}",
                response.status()
            )));
        }

        let body: DdgResponse = response
            .json()
            .await
            .map_err(|e| TallyError::transient_fetch(format!("lookup response: {e}")))?;

        let instant_answer = [body.answer, body.abstract_text]
            .into_iter()
            .find(|s| !s.trim().is_empty());

        let mut results = Vec::new();
        collect_topics(&body.related_topics, &mut results, max_results);

        Ok(LookupOutcome {
            instant_answer,
            results,
        })
    }
}

fn collect_topics(topics: &[DdgTopic], out: &mut Vec<LookupResult>, max: usize) {
    for topic in topics {
        if out.len() >= max {
            return;
        }
        if let (Some(text), Some(url)) = (&topic.text, &topic.first_url) {
            out.push(LookupResult {
                title: text.chars().take(80).collect(),
                url: url.clone(),
                snippet: text.clone(),
            });
        }
        // Category groupings nest one level deep.
        collect_topics(&topic.topics, out, max);
    }
}

#[derive(Debug, Deserialize)]
struct DdgResponse {
    #[serde(default, rename = "Answer")]
    answer: String,
    #[serde(default, rename = "AbstractText")]
    abstract_text: String,
    #[serde(default, rename = "RelatedTopics")]
    related_topics: Vec<DdgTopic>,
}

#[derive(Debug, Deserialize)]
struct DdgTopic {
    #[serde(default, rename = "Text")]
    text: Option<String>,
    #[serde(default, rename = "FirstURL")]
    first_url: Option<String>,
    #[serde(default, rename = "Topics")]
    topics: Vec<DdgTopic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parsing_handles_nested_topics() {
        let raw = r#"{
            "Answer": "",
            "AbstractText": "Jakarta is the capital of Indonesia.",
            "RelatedTopics": [
                { "Text": "Jakarta - capital city", "FirstURL": "https://example.com/jakarta" },
                { "Topics": [
                    { "Text": "West Jakarta", "FirstURL": "https://example.com/west" }
                ] }
            ]
        }"#;
        let body: DdgResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(body.abstract_text, "Jakarta is the capital of Indonesia.");

        let mut results = Vec::new();
        collect_topics(&body.related_topics, &mut results, 8);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].url, "https://example.com/west");
    }

    #[test]
    fn topic_cap_is_respected() {
        let topics: Vec<DdgTopic> = (0..10)
            .map(|i| DdgTopic {
                text: Some(format!("t{i}")),
                first_url: Some(format!("https://example.com/{i}")),
                topics: Vec::new(),
            })
            .collect();
        let mut results = Vec::new();
        collect_topics(&topics, &mut results, 3);
        assert_eq!(results.len(), 3);
    }
}
