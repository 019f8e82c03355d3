// Repository layer for database operations
//
// Cursor/Session/Turns model. The turn log is append-only; sequence numbers
// are assigned under a row-level lock on the session row, which is the
// per-user critical section that serializes concurrent appends from the two
// webhooks across processes.

use anyhow::Result;
use sqlx::PgPool;
use tally_core::Turn;

use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ============================================
    // Cursors (per-mailbox change markers)
    // ============================================

    pub async fn get_cursor(&self, mailbox_id: &str) -> Result<Option<CursorRow>> {
        let row = sqlx::query_as::<_, CursorRow>(
            r#"
            SELECT mailbox_id, last_marker, updated_at
            FROM cursors
            WHERE mailbox_id = $1
            "#,
        )
        .bind(mailbox_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Compare-and-set advance. `expected = None` creates the cursor; a
    /// mismatched expectation changes nothing and returns false.
    pub async fn advance_cursor(
        &self,
        mailbox_id: &str,
        expected: Option<&str>,
        next: &str,
    ) -> Result<bool> {
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO cursors (mailbox_id, last_marker, updated_at)
                    VALUES ($1, $2, NOW())
                    ON CONFLICT (mailbox_id) DO NOTHING
                    "#,
                )
                .bind(mailbox_id)
                .bind(next)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE cursors
                    SET last_marker = $3, updated_at = NOW()
                    WHERE mailbox_id = $1 AND last_marker = $2
                    "#,
                )
                .bind(mailbox_id)
                .bind(expected)
                .bind(next)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Sessions (one per end-user)
    // ============================================

    pub async fn get_session(&self, user_id: &str) -> Result<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT user_id, active_handler, created_at, updated_at
            FROM sessions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Create the session row if missing and return it. Safe under concurrent
    /// first-access from both producers.
    pub async fn ensure_session(&self, user_id: &str) -> Result<SessionRow> {
        sqlx::query(
            r#"
            INSERT INTO sessions (user_id)
            VALUES ($1)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT user_id, active_handler, created_at, updated_at
            FROM sessions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn set_active_handler(
        &self,
        user_id: &str,
        handler: Option<&str>,
    ) -> Result<()> {
        self.ensure_session(user_id).await?;
        sqlx::query(
            r#"
            UPDATE sessions
            SET active_handler = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(handler)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============================================
    // Turns (append-only conversation log)
    // ============================================

    /// Append one turn. The SELECT ... FOR UPDATE on the session row is the
    /// per-user critical section: the sequence number is assigned and
    /// inserted before any concurrent append for the same user can proceed.
    pub async fn append_turn(&self, user_id: &str, turn: &Turn) -> Result<()> {
        self.ensure_session(user_id).await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT user_id FROM sessions WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO turns (id, user_id, sequence, origin, role, content, created_at)
            VALUES (
                $1, $2,
                COALESCE((SELECT MAX(sequence) + 1 FROM turns WHERE user_id = $2), 1),
                $3, $4, $5, $6
            )
            "#,
        )
        .bind(turn.id)
        .bind(user_id)
        .bind(turn.origin.to_string())
        .bind(turn.role.to_string())
        .bind(&turn.content)
        .bind(turn.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET updated_at = NOW() WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_turns(&self, user_id: &str) -> Result<Vec<TurnRow>> {
        let rows = sqlx::query_as::<_, TurnRow>(
            r#"
            SELECT id, user_id, sequence, origin, role, content, created_at
            FROM turns
            WHERE user_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
