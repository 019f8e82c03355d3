// Session entity
//
// One session per end-user, shared by both producers. History is append-only;
// ordering reflects arrival order as observed by the session store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::handlers::HandlerKind;
use crate::turn::Turn;

/// Conversation state for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Stable end-user identifier (the chat transport's user id)
    pub user_id: String,

    /// Ordered, append-only turn history
    pub turns: Vec<Turn>,

    /// Handler left mid-multi-step-exchange, if any
    pub active_handler: Option<HandlerKind>,

    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create an empty session for a user
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            turns: Vec::new(),
            active_handler: None,
            updated_at: Utc::now(),
        }
    }

    /// The most recent user-authored turn, if any
    pub fn last_user_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.is_user())
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::TurnOrigin;

    #[test]
    fn last_user_turn_skips_agent_replies() {
        let mut session = Session::new("u1");
        session.turns.push(Turn::chat("add yogurt 15000"));
        session
            .turns
            .push(Turn::agent(TurnOrigin::Chat, "Recorded."));

        let last = session.last_user_turn().unwrap();
        assert_eq!(last.content, "add yogurt 15000");
    }

    #[test]
    fn new_session_is_empty() {
        let session = Session::new("u1");
        assert_eq!(session.turn_count(), 0);
        assert!(session.active_handler.is_none());
    }
}
