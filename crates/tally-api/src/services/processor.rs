// Background notification processor
//
// Runs after the push delivery has already been acknowledged. Advances the
// event cursor, then walks the delivered message ids one at a time: fetch the
// mail, synthesize a user turn, run it through the pipeline, and forward the
// agent's reply to the chat. Fetch and send are retried under the bounded
// policy; exhaustion is logged as a delivery failure and never advances past
// the cursor state already recorded - the item stays eligible for a
// re-fetch.

use std::sync::Arc;

use tracing::{error, info};

use tally_core::{
    retry_transient, EventCursor, MailMessage, MailProvider, Result, RetryPolicy, Turn,
    TurnPipeline,
};

use super::telegram::TelegramClient;

pub struct NotificationProcessor {
    cursor: EventCursor,
    mail: Arc<dyn MailProvider>,
    pipeline: Arc<TurnPipeline>,
    telegram: TelegramClient,
    /// Session owner and chat target for notification-originated turns
    user_id: String,
    retry: RetryPolicy,
}

impl NotificationProcessor {
    pub fn new(
        cursor: EventCursor,
        mail: Arc<dyn MailProvider>,
        pipeline: Arc<TurnPipeline>,
        telegram: TelegramClient,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            cursor,
            mail,
            pipeline,
            telegram,
            user_id: user_id.into(),
            retry: RetryPolicy::exponential(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process one decoded push notification to completion.
    pub async fn process(&self, mailbox_id: &str, observed_marker: &str) {
        let message_ids = match retry_transient(&self.retry, "cursor.advance", || async {
            self.cursor.advance(mailbox_id, observed_marker).await
        })
        .await
        {
            Ok(ids) => ids,
            Err(e) => {
                // Cursor unchanged; the next push re-covers this range.
                error!(mailbox_id, observed_marker, error = %e, "Cursor advance failed");
                return;
            }
        };

        if message_ids.is_empty() {
            info!(mailbox_id, observed_marker, "No new messages");
            return;
        }

        for message_id in message_ids {
            if let Err(e) = self.process_one(mailbox_id, &message_id).await {
                // Surfaced, not dropped: the failure is visible for manual or
                // scheduled re-fetch.
                error!(
                    mailbox_id,
                    message_id,
                    error = %e,
                    "Notification delivery failed"
                );
            }
        }
    }

    async fn process_one(&self, mailbox_id: &str, message_id: &str) -> Result<()> {
        let mail = retry_transient(&self.retry, "mail.fetch_message", || async {
            self.mail.fetch_message(mailbox_id, message_id).await
        })
        .await?;

        let turn = Turn::notification(synthesize_instruction(&mail));
        let reply = self.pipeline.handle_turn(&self.user_id, turn).await?;

        retry_transient(&self.retry, "telegram.send_message", || async {
            self.telegram.send_message(&self.user_id, &reply).await
        })
        .await?;

        info!(mailbox_id, message_id, "Notification processed");
        Ok(())
    }
}

/// The synthesized turn the agent sees for a payment mail
fn synthesize_instruction(mail: &MailMessage) -> String {
    format!(
        "[SYSTEM: Email notification received. Tell the user you got this \
         invoice email and add it to the ledger. If anything is unclear, ask \
         for clarification.]\n\nFrom: {}\nSubject: {}\n\n{}",
        mail.sender, mail.subject, mail.body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_carries_mail_fields() {
        let mail = MailMessage {
            id: "m1".into(),
            sender: "payments@example.com".into(),
            subject: "Payment received".into(),
            body: "Total: 50.000 IDR".into(),
        };
        let text = synthesize_instruction(&mail);
        assert!(text.contains("From: payments@example.com"));
        assert!(text.contains("Subject: Payment received"));
        assert!(text.contains("Total: 50.000 IDR"));
    }
}
