// Core traits for pluggable backends
//
// These traits are the seams to every external collaborator:
// - In-memory implementations for tests live in crate::memory
// - Postgres implementations live in tally-storage
// - Google API implementations live in tally-google
//
// The session store and cursor store are the only mutable shared state; both
// require atomic read-modify-write semantics per key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::handlers::HandlerKind;
use crate::ledger::{LedgerRecord, RecordFilter};
use crate::session::Session;
use crate::turn::Turn;

// ============================================================================
// SessionStore - single source of truth for conversation state
// ============================================================================

/// Keyed, persisted conversation-state table shared by both entry points.
///
/// `append_turn` must serialize concurrent callers per user so that the
/// coordinator always observes one total order of turns per user, even when
/// the two producers race. After it returns, the turn is durably visible to
/// either producer, including one in a different process.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the existing session or create an empty one. Safe under
    /// concurrent first-access from both producers.
    async fn load_or_create(&self, user_id: &str) -> Result<Session>;

    /// Atomically append one turn and return the updated view.
    async fn append_turn(&self, user_id: &str, turn: Turn) -> Result<Session>;

    /// Record which handler (if any) is mid-multi-step-exchange.
    async fn set_active_handler(
        &self,
        user_id: &str,
        handler: Option<HandlerKind>,
    ) -> Result<()>;
}

// ============================================================================
// CursorStore - per-mailbox last-processed marker
// ============================================================================

/// Persisted cursor for one watched mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub mailbox_id: String,
    /// Opaque, monotonically non-decreasing change marker
    pub last_marker: String,
    pub updated_at: DateTime<Utc>,
}

/// Storage for mailbox cursors. Compare-and-set semantics keep two processes
/// from advancing past each other and re-delivering items.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, mailbox_id: &str) -> Result<Option<Cursor>>;

    /// Advance the cursor from `expected` to `next`. `expected: None` creates
    /// the cursor. Returns false when the stored marker no longer matches
    /// `expected` (another caller won the race); the cursor is left unchanged.
    async fn advance(
        &self,
        mailbox_id: &str,
        expected: Option<&str>,
        next: &str,
    ) -> Result<bool>;
}

// ============================================================================
// MailProvider - the mail API boundary
// ============================================================================

/// A fetched mail message, already flattened to the fields the pipeline needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
}

/// "List changes since marker" and "fetch item by id", per the provider
/// contract. Failures are transient-retryable.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Message ids added after `start_marker`, up to and including
    /// `end_marker`, carrying `label_id`, in change order, duplicates
    /// removed. Changes past `end_marker` belong to a later notification and
    /// must not be returned.
    async fn list_added_since(
        &self,
        mailbox_id: &str,
        start_marker: &str,
        end_marker: &str,
        label_id: &str,
    ) -> Result<Vec<String>>;

    /// Most recent message carrying `label_id`, used as the baseline when a
    /// mailbox is watched for the first time (or after state loss).
    async fn latest_message_id(
        &self,
        mailbox_id: &str,
        label_id: &str,
    ) -> Result<Option<String>>;

    async fn fetch_message(&self, mailbox_id: &str, message_id: &str) -> Result<MailMessage>;
}

// ============================================================================
// LedgerBackend - the spreadsheet/ledger API boundary
// ============================================================================

/// Row-level operations keyed by `record_id`. The backend is a generic
/// tabular store with no uniqueness enforcement; the operation executor
/// maintains id uniqueness and idempotency on top of these primitives.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn insert(&self, record: &LedgerRecord) -> Result<()>;

    async fn fetch(&self, record_id: Uuid) -> Result<Option<LedgerRecord>>;

    /// Replace the row for `record.record_id`. Returns false when absent.
    async fn overwrite(&self, record: &LedgerRecord) -> Result<bool>;

    /// Remove the row. Returns false when already absent.
    async fn remove(&self, record_id: Uuid) -> Result<bool>;

    /// All rows matching the filter, in occurred_at order.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<LedgerRecord>>;
}

// ============================================================================
// IntentModel - the classifier/extractor collaborator
// ============================================================================

/// A capability handler's advertised intent surface, published to the
/// classifier as free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerDescription {
    pub kind: HandlerKind,
    pub description: String,
}

/// One operation a handler exposes, described to the extractor as a function
/// declaration (name, description, JSON-schema parameters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A concrete operation invocation extracted from a turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationCall {
    pub operation: String,
    pub arguments: serde_json::Value,
}

/// Outcome of argument extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Extraction {
    /// Structured arguments were extracted
    Operation(OperationCall),
    /// The turn is resolvable in principle but needs a clarifying follow-up
    Ambiguous(String),
}

/// The language-model collaborator, treated as a non-deterministic black box.
/// It must never be assumed to produce identical output for identical input;
/// tests use a deterministic scripted implementation instead.
#[async_trait]
pub trait IntentModel: Send + Sync {
    /// Pick the handler whose published description matches the turn, or None.
    async fn classify(
        &self,
        turn: &Turn,
        handlers: &[HandlerDescription],
    ) -> Result<Option<HandlerKind>>;

    /// Extract a structured operation call from the turn, given the recent
    /// history for context and the handler's operation schemas.
    async fn extract(
        &self,
        turn: &Turn,
        history: &[Turn],
        operations: &[OperationSchema],
    ) -> Result<Extraction>;
}
