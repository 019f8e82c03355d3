// Database row types

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct CursorRow {
    pub mailbox_id: String,
    pub last_marker: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub user_id: String,
    pub active_handler: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TurnRow {
    pub id: Uuid,
    pub user_id: String,
    pub sequence: i32,
    pub origin: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
