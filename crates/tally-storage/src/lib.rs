// Postgres persistence for the expense pipeline
//
// The cursor and session tables are the only mutable shared state in the
// system; both survive process restarts and are shared by the notification
// and chat webhooks.

pub mod cursor_store;
pub mod models;
pub mod repositories;
pub mod session_store;

pub use cursor_store::DbCursorStore;
pub use repositories::Database;
pub use session_store::DbSessionStore;
