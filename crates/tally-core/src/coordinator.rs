// Coordinator
//
// Classifies a turn's intent against the handlers' published descriptions and
// selects exactly one handler - or none, which the caller renders as a
// generic clarification. Classification is best-effort and non-deterministic;
// the invariants that hold regardless of its quality are: one handler (or
// none) per turn, and a turn that matches no handler never mutates the
// ledger. The stickiness heuristic below is a tunable policy, not a law.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::handlers::HandlerKind;
use crate::session::Session;
use crate::traits::{HandlerDescription, IntentModel};
use crate::turn::Turn;

/// Ephemeral routing outcome, consumed immediately by the chosen handler
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub turn_id: Uuid,
    /// The single handler to invoke, or None for a no-match turn
    pub handler: Option<HandlerKind>,
    /// True when the decision came from active-handler stickiness rather
    /// than a fresh classification
    pub sticky: bool,
}

/// Intent router over the declared capability set
pub struct Coordinator {
    model: Arc<dyn IntentModel>,
    descriptions: Vec<HandlerDescription>,
}

impl Coordinator {
    pub fn new(model: Arc<dyn IntentModel>, descriptions: Vec<HandlerDescription>) -> Self {
        Self {
            model,
            descriptions,
        }
    }

    /// Route one turn. An explicit classification wins (topic change); when
    /// the classifier is unsure and a handler is mid-exchange, the active
    /// handler keeps the turn; otherwise the turn is a NoMatch.
    pub async fn route(&self, session: &Session, turn: &Turn) -> Result<RoutingDecision> {
        let classified = self.model.classify(turn, &self.descriptions).await?;

        let (handler, sticky) = match (classified, session.active_handler) {
            (Some(kind), active) => (Some(kind), active == Some(kind)),
            (None, Some(active)) => (Some(active), true),
            (None, None) => (None, false),
        };

        debug!(
            turn_id = %turn.id,
            handler = handler.map(|h| h.to_string()).unwrap_or_else(|| "none".into()),
            sticky,
            "Turn routed"
        );

        Ok(RoutingDecision {
            turn_id: turn.id,
            handler,
            sticky,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ScriptedIntentModel;

    fn descriptions() -> Vec<HandlerDescription> {
        vec![
            HandlerDescription {
                kind: HandlerKind::Expense,
                description: "expense tracking".into(),
            },
            HandlerDescription {
                kind: HandlerKind::Search,
                description: "web search".into(),
            },
        ]
    }

    #[tokio::test]
    async fn classified_turn_routes_to_one_handler() {
        let model = ScriptedIntentModel::new();
        model
            .script_route("add yogurt 15000", Some(HandlerKind::Expense))
            .await;

        let coordinator = Coordinator::new(Arc::new(model), descriptions());
        let decision = coordinator
            .route(&Session::new("u1"), &Turn::chat("add yogurt 15000"))
            .await
            .unwrap();

        assert_eq!(decision.handler, Some(HandlerKind::Expense));
        assert!(!decision.sticky);
    }

    #[tokio::test]
    async fn unmatched_turn_is_no_match() {
        let model = ScriptedIntentModel::new();
        let coordinator = Coordinator::new(Arc::new(model), descriptions());

        let decision = coordinator
            .route(&Session::new("u1"), &Turn::chat("asdfghjkl"))
            .await
            .unwrap();
        assert_eq!(decision.handler, None);
    }

    #[tokio::test]
    async fn active_handler_keeps_unclassified_follow_up() {
        let model = ScriptedIntentModel::new();
        let coordinator = Coordinator::new(Arc::new(model), descriptions());

        let mut session = Session::new("u1");
        session.active_handler = Some(HandlerKind::Expense);

        // "the one for 15000" classifies to nothing on its own; stickiness
        // hands it to the handler awaiting the disambiguation.
        let decision = coordinator
            .route(&session, &Turn::chat("the one for 15000"))
            .await
            .unwrap();
        assert_eq!(decision.handler, Some(HandlerKind::Expense));
        assert!(decision.sticky);
    }

    #[tokio::test]
    async fn explicit_classification_overrides_active_handler() {
        let model = ScriptedIntentModel::new();
        model
            .script_route("who won the match last night", Some(HandlerKind::Search))
            .await;

        let coordinator = Coordinator::new(Arc::new(model), descriptions());
        let mut session = Session::new("u1");
        session.active_handler = Some(HandlerKind::Expense);

        let decision = coordinator
            .route(&session, &Turn::chat("who won the match last night"))
            .await
            .unwrap();
        assert_eq!(decision.handler, Some(HandlerKind::Search));
        assert!(!decision.sticky);
    }
}
