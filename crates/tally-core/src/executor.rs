// Operation Executor
//
// Applies single validated ledger operations against the LedgerBackend.
// Idempotency contract:
// - create always allocates a fresh record_id (duplicate pushes are guarded
//   upstream by the event cursor, not here)
// - update is retry-safe: same changes applied twice yield the same state
// - delete of an absent record signals AlreadyDeleted, not an error
// Relative references resolve by querying candidates; more than one match
// becomes AmbiguousInput instead of a guess.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, TallyError};
use crate::ledger::{
    format_amount, format_sheet_date, LedgerRecord, LedgerSummary, RecordChanges, RecordDraft,
    RecordFilter,
};
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::LedgerBackend;
use crate::turn::TurnOrigin;

/// Outcome of a delete; the second delete of the same record is a no-op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyDeleted,
}

/// Idempotent, validated mutation layer over the ledger backend
pub struct OperationExecutor {
    backend: Arc<dyn LedgerBackend>,
    retry: RetryPolicy,
}

impl OperationExecutor {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::exponential(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create one record. Allocates a fresh record_id on every call.
    pub async fn create(&self, draft: &RecordDraft, origin: TurnOrigin) -> Result<LedgerRecord> {
        let valid = draft.validate(Utc::now().date_naive())?;

        let record = LedgerRecord {
            record_id: Uuid::now_v7(),
            memo: valid.memo,
            amount: valid.amount,
            currency: valid.currency,
            category: valid.category,
            notes: valid.notes,
            occurred_at: valid.occurred_at,
            created_by_origin: origin,
            created_at: Utc::now(),
        };

        retry_transient(&self.retry, "ledger.insert", || async {
            self.backend.insert(&record).await
        })
        .await?;

        info!(record_id = %record.record_id, memo = %record.memo, "Record created");
        Ok(record)
    }

    /// Create records item-by-item. A failure on item k does not roll back
    /// items before k; each outcome is reported independently.
    pub async fn create_batch(
        &self,
        drafts: &[RecordDraft],
        origin: TurnOrigin,
    ) -> Vec<Result<LedgerRecord>> {
        let mut outcomes = Vec::with_capacity(drafts.len());
        for draft in drafts {
            outcomes.push(self.create(draft, origin).await);
        }
        outcomes
    }

    /// Apply field-level changes to an existing record. Last-write-wins per
    /// field; safe to retry.
    pub async fn update(&self, record_id: Uuid, changes: &RecordChanges) -> Result<LedgerRecord> {
        if changes.is_empty() {
            return Err(TallyError::invalid("No fields to update"));
        }

        let existing = retry_transient(&self.retry, "ledger.fetch", || async {
            self.backend.fetch(record_id).await
        })
        .await?
        .ok_or_else(|| TallyError::not_found(format!("record {record_id}")))?;

        let merged = changes.apply_to(&existing)?;

        let written = retry_transient(&self.retry, "ledger.overwrite", || async {
            self.backend.overwrite(&merged).await
        })
        .await?;
        if !written {
            return Err(TallyError::not_found(format!("record {record_id}")));
        }

        info!(record_id = %record_id, "Record updated");
        Ok(merged)
    }

    /// Delete by record_id. Retries are silent no-ops via AlreadyDeleted.
    pub async fn delete(&self, record_id: Uuid) -> Result<DeleteOutcome> {
        let removed = retry_transient(&self.retry, "ledger.remove", || async {
            self.backend.remove(record_id).await
        })
        .await?;

        if removed {
            info!(record_id = %record_id, "Record deleted");
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::AlreadyDeleted)
        }
    }

    /// Read-only: all records matching the filter, in occurred_at order.
    pub async fn query(&self, filter: &RecordFilter) -> Result<Vec<LedgerRecord>> {
        // Compile up-front so bad dates fail as InvalidInput, not mid-query.
        filter.compile()?;
        retry_transient(&self.retry, "ledger.list", || async {
            self.backend.list(filter).await
        })
        .await
    }

    /// Read-only: aggregate over the matching records.
    pub async fn summarize(&self, filter: &RecordFilter) -> Result<LedgerSummary> {
        let records = self.query(filter).await?;
        Ok(LedgerSummary::from_records(&records))
    }

    /// Resolve a relative description ("yesterday's soap purchase") to a
    /// concrete record. Exactly one match proceeds; zero is NotFound; more
    /// than one becomes AmbiguousInput listing the candidates.
    pub async fn resolve_reference(&self, filter: &RecordFilter) -> Result<LedgerRecord> {
        if filter.is_empty() {
            return Err(TallyError::invalid(
                "Which transaction do you mean? Give me a name, category, or date.",
            ));
        }

        let mut candidates = self.query(filter).await?;
        match candidates.len() {
            0 => Err(TallyError::not_found("no matching transaction")),
            1 => Ok(candidates.remove(0)),
            n => {
                let listing = candidates
                    .iter()
                    .take(5)
                    .map(describe_candidate)
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(TallyError::ambiguous(format!(
                    "I found {n} matching transactions: {listing}. Which one do you mean?"
                )))
            }
        }
    }
}

fn describe_candidate(record: &LedgerRecord) -> String {
    format!(
        "{} for {} {} on {}",
        record.memo,
        format_amount(record.amount),
        record.currency,
        format_sheet_date(record.occurred_at)
    )
}
