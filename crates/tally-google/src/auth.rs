// Bearer-token source for the Google clients
//
// Credential lifecycle (OAuth refresh, service-account exchange) is outside
// this crate's boundary; clients only ask for a currently-valid token.

use async_trait::async_trait;
use tally_core::{Result, TallyError};

/// Hands out a currently-valid bearer token for Google API calls
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

/// Token provider backed by a pre-issued token
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Read the token from an environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        let token = std::env::var(var)
            .map_err(|_| TallyError::config(format!("{var} environment variable not set")))?;
        Ok(Self::new(token))
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
