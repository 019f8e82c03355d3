// Expense Pipeline Abstractions
//
// This crate provides a DB-agnostic implementation of the expense bot's core:
// event deduplication over the mail change stream, per-user session
// coordination across two producer channels, intent routing to exactly one
// capability handler, and idempotent ledger operations.
//
// Key design decisions:
// - Uses traits (SessionStore, CursorStore, MailProvider, LedgerBackend,
//   IntentModel, LookupProvider) for pluggable backends
// - The classifier/extractor is an injected, non-deterministic collaborator;
//   a deterministic scripted stub keeps the routing invariants testable
// - Both producers feed one serialized-per-user consumer (TurnPipeline);
//   per-user ordering is the store's contract, per-user single-flight is the
//   pipeline's
// - Error handling distinguishes transient (retryable) collaborator failures
//   from user-facing clarifications; every turn yields a textual reply
// - In-memory implementations for examples and testing live in memory

// Domain entity types
pub mod ledger;
pub mod session;
pub mod turn;

pub mod coordinator;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod retry;
pub mod traits;

// In-memory implementations for examples and testing
pub mod memory;

// Collaborator drivers
pub mod gemini;
pub mod lookup;

// Re-exports for convenience
pub use coordinator::{Coordinator, RoutingDecision};
pub use cursor::EventCursor;
pub use dispatch::TurnPipeline;
pub use error::{Result, TallyError};
pub use executor::{DeleteOutcome, OperationExecutor};
pub use handlers::{
    CapabilityHandler, ExpenseHandler, HandlerKind, HandlerReply, SearchHandler,
};
pub use ledger::{
    Category, LedgerRecord, LedgerSummary, RecordChanges, RecordDraft, RecordFilter,
};
pub use retry::{retry_transient, RetryPolicy};
pub use session::Session;
pub use traits::{
    Cursor, CursorStore, Extraction, HandlerDescription, IntentModel, LedgerBackend,
    MailMessage, MailProvider, OperationCall, OperationSchema, SessionStore,
};
pub use turn::{Turn, TurnOrigin, TurnRole};

// Collaborator re-exports
pub use gemini::GeminiIntentModel;
pub use lookup::{DuckDuckGoLookup, LookupOutcome, LookupProvider, LookupResult};
