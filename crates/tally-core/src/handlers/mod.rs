// Capability handlers
//
// Each handler exposes a bounded set of domain operations to the coordinator.
// Handlers extract structured arguments from a turn via the injected
// IntentModel and never surface raw backend errors - every outcome becomes a
// textual reply for the user.

mod expense;
mod search;

pub use expense::ExpenseHandler;
pub use search::SearchHandler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};
use crate::session::Session;
use crate::traits::{HandlerDescription, OperationSchema};
use crate::turn::Turn;

/// Identity of a capability handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Ledger mutations and reads: create, update, delete, query, summarize
    Expense,
    /// Information lookup beyond the ledger
    Search,
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerKind::Expense => write!(f, "expense"),
            HandlerKind::Search => write!(f, "search"),
        }
    }
}

impl std::str::FromStr for HandlerKind {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "expense" => Ok(HandlerKind::Expense),
            "search" => Ok(HandlerKind::Search),
            other => Err(TallyError::store(format!("Unknown handler kind '{other}'"))),
        }
    }
}

/// A handler's textual reply plus whether it stays active awaiting a
/// follow-up (e.g. a disambiguating answer).
#[derive(Debug, Clone)]
pub struct HandlerReply {
    pub text: String,
    pub keep_active: bool,
}

impl HandlerReply {
    /// A completed exchange; the handler releases the conversation.
    pub fn done(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keep_active: false,
        }
    }

    /// A clarifying follow-up; the handler stays active for the next turn.
    pub fn clarify(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keep_active: true,
        }
    }
}

/// One domain-bounded operation set exposed to the coordinator
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// Short natural-language description of the intents this handler
    /// accepts, published to the classifier.
    fn description(&self) -> &str;

    /// Operation schemas handed to the extractor as function declarations.
    fn operations(&self) -> Vec<OperationSchema>;

    /// Process one routed turn. Must return a textual reply for every
    /// outcome; only store-level failures may propagate as errors.
    async fn handle(&self, session: &Session, turn: &Turn) -> Result<HandlerReply>;

    /// The description record published to the classifier
    fn describe(&self) -> HandlerDescription {
        HandlerDescription {
            kind: self.kind(),
            description: self.description().to_string(),
        }
    }
}

/// Convert an executor/collaborator error into the reply the user sees.
/// Ambiguous references and dangling ids become clarifying follow-ups; retry
/// exhaustion becomes a bounded-effort failure notice.
pub(crate) fn reply_for_error(err: TallyError) -> HandlerReply {
    match err {
        TallyError::AmbiguousInput(msg) => HandlerReply::clarify(msg),
        TallyError::NotFound(msg) => {
            HandlerReply::clarify(format!("I couldn't find that transaction ({msg}). Could you describe it differently?"))
        }
        TallyError::InvalidInput(msg) => HandlerReply::clarify(msg),
        TallyError::DeliveryFailure { .. }
        | TallyError::TransientFetch(_)
        | TallyError::TransientWrite(_) => HandlerReply::done(
            "I couldn't reach the expense ledger just now. Nothing was changed - please try again in a moment.",
        ),
        other => {
            // Internal details stay in the logs, not in the chat.
            tracing::error!(error = %other, "Handler failed");
            HandlerReply::done("Something went wrong on my side. Please try again.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_kind_round_trip() {
        for kind in [HandlerKind::Expense, HandlerKind::Search] {
            let parsed: HandlerKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("bogus".parse::<HandlerKind>().is_err());
    }

    #[test]
    fn ambiguous_errors_keep_handler_active() {
        let reply = reply_for_error(TallyError::ambiguous("two matches"));
        assert!(reply.keep_active);

        let reply = reply_for_error(TallyError::transient_write("503"));
        assert!(!reply.keep_active);
    }
}
