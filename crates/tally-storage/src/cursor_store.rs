// Database-backed CursorStore implementation

use async_trait::async_trait;
use tally_core::{Cursor, CursorStore, Result, TallyError};

use crate::repositories::Database;

/// Postgres-backed cursor store
#[derive(Clone)]
pub struct DbCursorStore {
    db: Database,
}

impl DbCursorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CursorStore for DbCursorStore {
    async fn get(&self, mailbox_id: &str) -> Result<Option<Cursor>> {
        let row = self
            .db
            .get_cursor(mailbox_id)
            .await
            .map_err(|e| TallyError::store(e.to_string()))?;

        Ok(row.map(|r| Cursor {
            mailbox_id: r.mailbox_id,
            last_marker: r.last_marker,
            updated_at: r.updated_at,
        }))
    }

    async fn advance(
        &self,
        mailbox_id: &str,
        expected: Option<&str>,
        next: &str,
    ) -> Result<bool> {
        self.db
            .advance_cursor(mailbox_id, expected, next)
            .await
            .map_err(|e| TallyError::store(e.to_string()))
    }
}
