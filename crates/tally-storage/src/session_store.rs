// Database-backed SessionStore implementation
//
// Implements the core SessionStore trait over the sessions/turns tables so
// both webhook processes observe one shared, ordered history per user.

use std::str::FromStr;

use async_trait::async_trait;
use tally_core::{
    HandlerKind, Result, Session, SessionStore, TallyError, Turn, TurnOrigin, TurnRole,
};

use crate::models::{SessionRow, TurnRow};
use crate::repositories::Database;

/// Postgres-backed session store
#[derive(Clone)]
pub struct DbSessionStore {
    db: Database,
}

impl DbSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn assemble(&self, row: SessionRow) -> Result<Session> {
        let turns = self
            .db
            .list_turns(&row.user_id)
            .await
            .map_err(|e| TallyError::store(e.to_string()))?;

        let active_handler = match row.active_handler.as_deref() {
            Some(s) => Some(HandlerKind::from_str(s)?),
            None => None,
        };

        Ok(Session {
            user_id: row.user_id,
            turns: turns.into_iter().map(turn_from_row).collect(),
            active_handler,
            updated_at: row.updated_at,
        })
    }
}

fn turn_from_row(row: TurnRow) -> Turn {
    Turn {
        id: row.id,
        origin: TurnOrigin::from(row.origin.as_str()),
        role: TurnRole::from(row.role.as_str()),
        content: row.content,
        created_at: row.created_at,
    }
}

#[async_trait]
impl SessionStore for DbSessionStore {
    async fn load_or_create(&self, user_id: &str) -> Result<Session> {
        let row = self
            .db
            .ensure_session(user_id)
            .await
            .map_err(|e| TallyError::store(e.to_string()))?;
        self.assemble(row).await
    }

    async fn append_turn(&self, user_id: &str, turn: Turn) -> Result<Session> {
        self.db
            .append_turn(user_id, &turn)
            .await
            .map_err(|e| TallyError::store(e.to_string()))?;
        self.load_or_create(user_id).await
    }

    async fn set_active_handler(
        &self,
        user_id: &str,
        handler: Option<HandlerKind>,
    ) -> Result<()> {
        self.db
            .set_active_handler(user_id, handler.map(|h| h.to_string()).as_deref())
            .await
            .map_err(|e| TallyError::store(e.to_string()))
    }
}
