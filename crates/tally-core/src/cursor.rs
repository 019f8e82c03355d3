// Event Cursor
//
// Turns a stream of possibly-duplicated "something changed" push signals into
// a deterministic, gap-free sequence of new message ids. At-least-once
// delivery from the push transport is absorbed here: equal-or-behind markers
// return nothing, and the marker is persisted (compare-and-set) before the
// item list is handed to the caller. A failed provider query leaves the
// cursor unchanged so no item is ever skipped, at the cost of possible
// duplicate delivery downstream - which the idempotent executor tolerates.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, TallyError};
use crate::traits::{CursorStore, MailProvider};

/// Per-mailbox deduplicating cursor over the mail provider's change stream
pub struct EventCursor {
    store: Arc<dyn CursorStore>,
    mail: Arc<dyn MailProvider>,
    label_id: String,
}

impl EventCursor {
    pub fn new(
        store: Arc<dyn CursorStore>,
        mail: Arc<dyn MailProvider>,
        label_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mail,
            label_id: label_id.into(),
        }
    }

    /// Compare `observed_marker` against the stored marker and return the ids
    /// of messages added strictly after the stored marker, up to the observed
    /// marker, in change order. Changes past the observed marker stay behind
    /// for the push that announces them.
    ///
    /// Duplicate or stale notifications return an empty sequence. The new
    /// marker is persisted before the ids are returned; if another caller
    /// advanced the cursor concurrently, this call yields nothing (the winner
    /// delivers the items).
    pub async fn advance(
        &self,
        mailbox_id: &str,
        observed_marker: &str,
    ) -> Result<Vec<String>> {
        let observed = parse_marker(observed_marker)?;

        let Some(cursor) = self.store.get(mailbox_id).await? else {
            return self.initialize(mailbox_id, observed_marker).await;
        };

        let stored = parse_marker(&cursor.last_marker)?;
        if observed <= stored {
            debug!(
                mailbox_id,
                observed_marker,
                stored_marker = %cursor.last_marker,
                "Duplicate or stale notification absorbed"
            );
            return Ok(Vec::new());
        }

        // Provider failure propagates here and the cursor stays put.
        let message_ids = self
            .mail
            .list_added_since(mailbox_id, &cursor.last_marker, observed_marker, &self.label_id)
            .await?;

        let advanced = self
            .store
            .advance(mailbox_id, Some(&cursor.last_marker), observed_marker)
            .await?;
        if !advanced {
            debug!(
                mailbox_id,
                observed_marker, "Lost cursor race, another caller delivers"
            );
            return Ok(Vec::new());
        }

        info!(
            mailbox_id,
            from = %cursor.last_marker,
            to = observed_marker,
            new_items = message_ids.len(),
            "Cursor advanced"
        );
        Ok(message_ids)
    }

    /// First observation of a mailbox: no baseline exists, so the change
    /// stream cannot be replayed. Record the observed marker and hand back at
    /// most the single most recent labeled message.
    async fn initialize(&self, mailbox_id: &str, observed_marker: &str) -> Result<Vec<String>> {
        let latest = self
            .mail
            .latest_message_id(mailbox_id, &self.label_id)
            .await?;

        let created = self
            .store
            .advance(mailbox_id, None, observed_marker)
            .await?;
        if !created {
            // Concurrent first access: the winner already delivered.
            return Ok(Vec::new());
        }

        info!(mailbox_id, observed_marker, "Cursor initialized");
        Ok(latest.into_iter().collect())
    }
}

fn parse_marker(marker: &str) -> Result<u64> {
    marker
        .trim()
        .parse::<u64>()
        .map_err(|_| TallyError::invalid(format!("Marker is not numeric: '{marker}'")))
}
