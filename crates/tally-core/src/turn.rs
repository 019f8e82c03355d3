// Turn types
//
// A Turn is the atomic unit of conversational input or output from either
// producer. Turns are immutable once appended to a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which producer a turn entered through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOrigin {
    /// Synthesized from a mail push notification
    Notification,
    /// Received from the chat transport
    Chat,
}

impl std::fmt::Display for TurnOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnOrigin::Notification => write!(f, "notification"),
            TurnOrigin::Chat => write!(f, "chat"),
        }
    }
}

impl From<&str> for TurnOrigin {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "notification" => TurnOrigin::Notification,
            _ => TurnOrigin::Chat,
        }
    }
}

/// Who produced the turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// End-user input (chat text or a synthesized notification instruction)
    User,
    /// Agent response
    Agent,
    /// Tool/operation output recorded for context
    Tool,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnRole::User => write!(f, "user"),
            TurnRole::Agent => write!(f, "agent"),
            TurnRole::Tool => write!(f, "tool"),
        }
    }
}

impl From<&str> for TurnRole {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "agent" => TurnRole::Agent,
            "tool" => TurnRole::Tool,
            _ => TurnRole::User,
        }
    }
}

/// One atomic unit of conversation, from either producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Unique turn ID
    pub id: Uuid,

    /// Producer channel the turn arrived through
    pub origin: TurnOrigin,

    /// Role of the turn's author
    pub role: TurnRole,

    /// Natural-language content
    pub content: String,

    /// Timestamp when the turn was created
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Create a user turn arriving from the chat transport
    pub fn chat(content: impl Into<String>) -> Self {
        Self::new(TurnOrigin::Chat, TurnRole::User, content)
    }

    /// Create a user turn synthesized from a mail notification
    pub fn notification(content: impl Into<String>) -> Self {
        Self::new(TurnOrigin::Notification, TurnRole::User, content)
    }

    /// Create an agent reply turn mirroring the origin of the turn it answers
    pub fn agent(origin: TurnOrigin, content: impl Into<String>) -> Self {
        Self::new(origin, TurnRole::Agent, content)
    }

    /// Create a tool-output turn
    pub fn tool(origin: TurnOrigin, content: impl Into<String>) -> Self {
        Self::new(origin, TurnRole::Tool, content)
    }

    fn new(origin: TurnOrigin, role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            origin,
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// True for turns authored by the end user
    pub fn is_user(&self) -> bool {
        self.role == TurnRole::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_turn() {
        let turn = Turn::chat("total expenses this month");
        assert_eq!(turn.origin, TurnOrigin::Chat);
        assert_eq!(turn.role, TurnRole::User);
        assert!(turn.is_user());
    }

    #[test]
    fn agent_turn_mirrors_origin() {
        let turn = Turn::agent(TurnOrigin::Notification, "Recorded it.");
        assert_eq!(turn.origin, TurnOrigin::Notification);
        assert!(!turn.is_user());
    }

    #[test]
    fn origin_round_trip() {
        assert_eq!(TurnOrigin::from("notification"), TurnOrigin::Notification);
        assert_eq!(
            TurnOrigin::from(TurnOrigin::Chat.to_string().as_str()),
            TurnOrigin::Chat
        );
    }
}
