// In-memory implementations for examples and testing
//
// These keep all state in process memory behind the same traits the Postgres
// and Google implementations fill in production. The session store serializes
// appends per key under its write lock, which satisfies the store-level
// ordering contract within one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, TallyError};
use crate::handlers::HandlerKind;
use crate::ledger::{Category, LedgerRecord, RecordFilter};
use crate::lookup::{LookupOutcome, LookupProvider};
use crate::session::Session;
use crate::traits::{
    Cursor, CursorStore, Extraction, HandlerDescription, IntentModel, MailMessage, MailProvider,
    OperationSchema, SessionStore,
};
use crate::turn::{Turn, TurnOrigin};

// ============================================================================
// InMemorySessionStore
// ============================================================================

/// Session store backed by a HashMap keyed by user id
#[derive(Debug, Default, Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Pre-create a session with an active handler (useful for tests)
    pub async fn seed_session(&self, user_id: &str, active_handler: Option<HandlerKind>) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(user_id));
        session.active_handler = active_handler;
    }

    pub async fn clear(&self) {
        self.sessions.write().await.clear();
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load_or_create(&self, user_id: &str) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(user_id))
            .clone())
    }

    async fn append_turn(&self, user_id: &str, turn: Turn) -> Result<Session> {
        // The write lock is the per-key critical section: concurrent appends
        // for the same user serialize here and ordering is store-observed.
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(user_id));
        session.turns.push(turn);
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn set_active_handler(
        &self,
        user_id: &str,
        handler: Option<HandlerKind>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(user_id));
        session.active_handler = handler;
        session.updated_at = Utc::now();
        Ok(())
    }
}

// ============================================================================
// InMemoryCursorStore
// ============================================================================

/// Cursor store backed by a HashMap keyed by mailbox id
#[derive(Debug, Default, Clone)]
pub struct InMemoryCursorStore {
    cursors: Arc<RwLock<HashMap<String, Cursor>>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self {
            cursors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Pre-set a cursor marker (useful for tests)
    pub async fn seed(&self, mailbox_id: &str, marker: &str) {
        self.cursors.write().await.insert(
            mailbox_id.to_string(),
            Cursor {
                mailbox_id: mailbox_id.to_string(),
                last_marker: marker.to_string(),
                updated_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn get(&self, mailbox_id: &str) -> Result<Option<Cursor>> {
        Ok(self.cursors.read().await.get(mailbox_id).cloned())
    }

    async fn advance(
        &self,
        mailbox_id: &str,
        expected: Option<&str>,
        next: &str,
    ) -> Result<bool> {
        let mut cursors = self.cursors.write().await;
        match (cursors.get_mut(mailbox_id), expected) {
            (None, None) => {
                cursors.insert(
                    mailbox_id.to_string(),
                    Cursor {
                        mailbox_id: mailbox_id.to_string(),
                        last_marker: next.to_string(),
                        updated_at: Utc::now(),
                    },
                );
                Ok(true)
            }
            (Some(cursor), Some(expected)) if cursor.last_marker == expected => {
                cursor.last_marker = next.to_string();
                cursor.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// InMemoryLedger
// ============================================================================

/// Ledger backend backed by a HashMap keyed by record id
#[derive(Debug, Default, Clone)]
pub struct InMemoryLedger {
    records: Arc<RwLock<HashMap<Uuid, LedgerRecord>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Insert a record directly (useful for tests)
    pub async fn seed(
        &self,
        memo: &str,
        amount: f64,
        category: Category,
        date: &str,
    ) -> Uuid {
        let record = LedgerRecord {
            record_id: Uuid::now_v7(),
            memo: memo.to_string(),
            amount,
            currency: crate::ledger::DEFAULT_CURRENCY.to_string(),
            category,
            notes: String::new(),
            occurred_at: crate::ledger::parse_sheet_date(date).expect("test date"),
            created_by_origin: TurnOrigin::Chat,
            created_at: Utc::now(),
        };
        let id = record.record_id;
        self.records.write().await.insert(id, record);
        id
    }
}

#[async_trait]
impl crate::traits::LedgerBackend for InMemoryLedger {
    async fn insert(&self, record: &LedgerRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.record_id, record.clone());
        Ok(())
    }

    async fn fetch(&self, record_id: Uuid) -> Result<Option<LedgerRecord>> {
        Ok(self.records.read().await.get(&record_id).cloned())
    }

    async fn overwrite(&self, record: &LedgerRecord) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.record_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, record_id: Uuid) -> Result<bool> {
        Ok(self.records.write().await.remove(&record_id).is_some())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<LedgerRecord>> {
        let compiled = filter.compile()?;
        let records = self.records.read().await;
        let mut matching: Vec<LedgerRecord> = records
            .values()
            .filter(|r| compiled.matches(r))
            .cloned()
            .collect();
        matching.sort_by_key(|r| (r.occurred_at, r.created_at));
        Ok(matching)
    }
}

// ============================================================================
// ScriptedMailProvider
// ============================================================================

/// Mail provider with a scripted change history: marker -> message id.
/// `list_added_since` returns ids recorded after the start marker, up to and
/// including the end marker, in order.
#[derive(Debug, Default)]
pub struct ScriptedMailProvider {
    changes: RwLock<BTreeMap<u64, Vec<String>>>,
    messages: RwLock<HashMap<String, MailMessage>>,
    fail_next_list: RwLock<bool>,
}

impl ScriptedMailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message added at the given history marker
    pub async fn add_change(&self, marker: u64, message_id: &str) {
        self.changes
            .write()
            .await
            .entry(marker)
            .or_default()
            .push(message_id.to_string());
        self.messages.write().await.insert(
            message_id.to_string(),
            MailMessage {
                id: message_id.to_string(),
                subject: format!("Payment receipt {message_id}"),
                sender: "payments@example.com".to_string(),
                body: format!("Transaction {message_id}"),
            },
        );
    }

    /// Seed a full message payload
    pub async fn set_message(&self, message: MailMessage) {
        self.messages
            .write()
            .await
            .insert(message.id.clone(), message);
    }

    /// Make the next list call fail transiently
    pub async fn fail_next_list(&self) {
        *self.fail_next_list.write().await = true;
    }
}

#[async_trait]
impl MailProvider for ScriptedMailProvider {
    async fn list_added_since(
        &self,
        _mailbox_id: &str,
        start_marker: &str,
        end_marker: &str,
        _label_id: &str,
    ) -> Result<Vec<String>> {
        let mut fail = self.fail_next_list.write().await;
        if *fail {
            *fail = false;
            return Err(TallyError::transient_fetch("scripted list failure"));
        }
        drop(fail);

        let start: u64 = start_marker
            .parse()
            .map_err(|_| TallyError::invalid(format!("bad marker '{start_marker}'")))?;
        let end: u64 = end_marker
            .parse()
            .map_err(|_| TallyError::invalid(format!("bad marker '{end_marker}'")))?;

        let changes = self.changes.read().await;
        let mut ids = Vec::new();
        for (_, msgs) in changes.range(start + 1..=end) {
            for id in msgs {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        Ok(ids)
    }

    async fn latest_message_id(
        &self,
        _mailbox_id: &str,
        _label_id: &str,
    ) -> Result<Option<String>> {
        let changes = self.changes.read().await;
        Ok(changes
            .values()
            .rev()
            .flat_map(|msgs| msgs.iter().rev())
            .next()
            .cloned())
    }

    async fn fetch_message(&self, _mailbox_id: &str, message_id: &str) -> Result<MailMessage> {
        self.messages
            .read()
            .await
            .get(message_id)
            .cloned()
            .ok_or_else(|| TallyError::transient_fetch(format!("no message {message_id}")))
    }
}

// ============================================================================
// ScriptedIntentModel
// ============================================================================

/// Deterministic classifier/extractor: fixed mapping from canned turn content
/// to canned decisions. Unscripted content classifies to None, which lets
/// tests exercise NoMatch and stickiness paths.
#[derive(Debug, Default)]
pub struct ScriptedIntentModel {
    routes: RwLock<HashMap<String, Option<HandlerKind>>>,
    extractions: RwLock<HashMap<String, Extraction>>,
}

impl ScriptedIntentModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script_route(&self, content: &str, handler: Option<HandlerKind>) {
        self.routes
            .write()
            .await
            .insert(content.to_string(), handler);
    }

    pub async fn script_extraction(&self, content: &str, extraction: Extraction) {
        self.extractions
            .write()
            .await
            .insert(content.to_string(), extraction);
    }
}

#[async_trait]
impl IntentModel for ScriptedIntentModel {
    async fn classify(
        &self,
        turn: &Turn,
        _handlers: &[HandlerDescription],
    ) -> Result<Option<HandlerKind>> {
        Ok(self
            .routes
            .read()
            .await
            .get(&turn.content)
            .cloned()
            .flatten())
    }

    async fn extract(
        &self,
        turn: &Turn,
        _history: &[Turn],
        _operations: &[OperationSchema],
    ) -> Result<Extraction> {
        Ok(self
            .extractions
            .read()
            .await
            .get(&turn.content)
            .cloned()
            .unwrap_or_else(|| {
                Extraction::Ambiguous("Could you give me more detail?".to_string())
            }))
    }
}

// ============================================================================
// StaticLookup
// ============================================================================

/// Lookup provider that always returns the same outcome
#[derive(Debug, Default)]
pub struct StaticLookup {
    outcome: LookupOutcome,
}

impl StaticLookup {
    pub fn with_outcome(outcome: LookupOutcome) -> Self {
        Self { outcome }
    }
}

#[async_trait]
impl LookupProvider for StaticLookup {
    async fn search(&self, _query: &str, _max_results: usize) -> Result<LookupOutcome> {
        Ok(self.outcome.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::SessionStore as _;

    #[tokio::test]
    async fn concurrent_appends_lose_nothing() {
        let store = Arc::new(InMemorySessionStore::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .append_turn("u1", Turn::chat(format!("turn {i}")))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let session = store.load_or_create("u1").await.unwrap();
        assert_eq!(session.turn_count(), 16);

        // Each turn appears exactly once, in some valid interleaving.
        let mut contents: Vec<_> = session.turns.iter().map(|t| t.content.clone()).collect();
        contents.sort();
        contents.dedup();
        assert_eq!(contents.len(), 16);
    }

    #[tokio::test]
    async fn cursor_cas_rejects_mismatched_expectation() {
        let store = InMemoryCursorStore::new();
        assert!(store.advance("M", None, "10").await.unwrap());
        // Second create loses.
        assert!(!store.advance("M", None, "11").await.unwrap());
        // Stale expectation loses.
        assert!(!store.advance("M", Some("9"), "12").await.unwrap());
        // Matching expectation wins.
        assert!(store.advance("M", Some("10"), "12").await.unwrap());
        assert_eq!(store.get("M").await.unwrap().unwrap().last_marker, "12");
    }

    #[tokio::test]
    async fn scripted_mail_provider_lists_in_order() {
        let mail = ScriptedMailProvider::new();
        mail.add_change(41, "A").await;
        mail.add_change(42, "B").await;
        mail.add_change(44, "C").await;

        let ids = mail.list_added_since("me", "41", "44", "L").await.unwrap();
        assert_eq!(ids, vec!["B", "C"]);

        // Changes past the end marker are not delivered early.
        let ids = mail.list_added_since("me", "41", "42", "L").await.unwrap();
        assert_eq!(ids, vec!["B"]);

        assert_eq!(
            mail.latest_message_id("me", "L").await.unwrap(),
            Some("C".to_string())
        );
    }
}
