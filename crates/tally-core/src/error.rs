// Error taxonomy for the expense pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, TallyError>;

/// Errors that can occur while ingesting, routing, or executing a turn
#[derive(Debug, Error)]
pub enum TallyError {
    /// A collaborator read failed in a retryable way (timeout, 429, 5xx)
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    /// A collaborator write failed in a retryable way
    #[error("transient write failure: {0}")]
    TransientWrite(String),

    /// A referenced record no longer exists
    #[error("not found: {0}")]
    NotFound(String),

    /// A relative reference matched more than one candidate record
    #[error("ambiguous reference: {0}")]
    AmbiguousInput(String),

    /// Sender is not on the allow-list; never reaches the coordinator
    #[error("unauthorized sender")]
    Unauthorized,

    /// The coordinator could not match the turn to any handler
    #[error("no matching capability")]
    NoMatch,

    /// Retries exhausted; the event is surfaced, not silently dropped
    #[error("delivery failed after {attempts} attempts: {message}")]
    DeliveryFailure { attempts: u32, message: String },

    /// Input failed validation before reaching the ledger backend
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Classifier/extractor collaborator error
    #[error("classifier error: {0}")]
    Classifier(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Session or cursor store error
    #[error("store error: {0}")]
    Store(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TallyError {
    /// Create a transient fetch error
    pub fn transient_fetch(msg: impl Into<String>) -> Self {
        TallyError::TransientFetch(msg.into())
    }

    /// Create a transient write error
    pub fn transient_write(msg: impl Into<String>) -> Self {
        TallyError::TransientWrite(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        TallyError::NotFound(msg.into())
    }

    /// Create an ambiguous-input error
    pub fn ambiguous(msg: impl Into<String>) -> Self {
        TallyError::AmbiguousInput(msg.into())
    }

    /// Create a validation error
    pub fn invalid(msg: impl Into<String>) -> Self {
        TallyError::InvalidInput(msg.into())
    }

    /// Create a classifier error
    pub fn classifier(msg: impl Into<String>) -> Self {
        TallyError::Classifier(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        TallyError::Config(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        TallyError::Store(msg.into())
    }

    /// True for errors the retry policy is allowed to retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TallyError::TransientFetch(_) | TallyError::TransientWrite(_)
        )
    }
}
