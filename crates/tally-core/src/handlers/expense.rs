// Expense capability handler
//
// Owns the ledger operation set: add, update, delete, query, summarize.
// Argument extraction is delegated to the injected IntentModel; the handler
// resolves relative references through the executor and turns every outcome
// into a user-visible reply.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{Result, TallyError};
use crate::executor::{DeleteOutcome, OperationExecutor};
use crate::ledger::{
    format_amount, format_sheet_date, Category, LedgerRecord, RecordChanges, RecordDraft,
    RecordFilter,
};
use crate::session::Session;
use crate::traits::{Extraction, IntentModel, OperationCall, OperationSchema};
use crate::turn::Turn;

use super::{reply_for_error, CapabilityHandler, HandlerKind, HandlerReply};

const DESCRIPTION: &str = "Expense tracking: add, update, or delete transactions, \
look up past transactions, and summarize spending by period or category.";

// How many turns of history the extractor sees; enough for a clarifying
// follow-up to land with its context.
const HISTORY_WINDOW: usize = 12;

const MAX_LISTED: usize = 10;

/// Ledger-mutation handler
pub struct ExpenseHandler {
    model: Arc<dyn IntentModel>,
    executor: Arc<OperationExecutor>,
}

impl ExpenseHandler {
    pub fn new(model: Arc<dyn IntentModel>, executor: Arc<OperationExecutor>) -> Self {
        Self { model, executor }
    }

    async fn execute(&self, call: OperationCall, turn: &Turn) -> Result<HandlerReply> {
        match call.operation.as_str() {
            "add_transaction" => {
                let draft: RecordDraft = parse_args(call.arguments)?;
                let record = self.executor.create(&draft, turn.origin).await?;
                Ok(HandlerReply::done(confirm_created(&record)))
            }
            "add_transactions" => {
                let args: BatchArgs = parse_args(call.arguments)?;
                if args.items.is_empty() {
                    return Ok(HandlerReply::clarify(
                        "I didn't find any transactions to add. What should I record?",
                    ));
                }
                let outcomes = self.executor.create_batch(&args.items, turn.origin).await;
                Ok(HandlerReply::done(confirm_batch(&outcomes)))
            }
            "update_transaction" => {
                let args: UpdateArgs = parse_args(call.arguments)?;
                if args.changes.is_empty() {
                    return Ok(HandlerReply::clarify(
                        "What should I change on that transaction?",
                    ));
                }
                let record_id = self.resolve_target(&args.target).await?;
                let updated = self.executor.update(record_id, &args.changes).await?;
                Ok(HandlerReply::done(format!(
                    "Updated: {}.",
                    describe_record(&updated)
                )))
            }
            "delete_transaction" => {
                let args: TargetArgs = parse_args(call.arguments)?;
                let record_id = self.resolve_target(&args).await?;
                match self.executor.delete(record_id).await? {
                    DeleteOutcome::Deleted => {
                        Ok(HandlerReply::done("Deleted that transaction."))
                    }
                    DeleteOutcome::AlreadyDeleted => Ok(HandlerReply::done(
                        "That transaction was already deleted.",
                    )),
                }
            }
            "query_transactions" => {
                let filter: RecordFilter = parse_args(call.arguments)?;
                let records = self.executor.query(&filter).await?;
                Ok(HandlerReply::done(list_records(&records)))
            }
            "summarize_expenses" => {
                let filter: RecordFilter = parse_args(call.arguments)?;
                let summary = self.executor.summarize(&filter).await?;
                if summary.count == 0 {
                    return Ok(HandlerReply::done(
                        "No transactions matched that period.",
                    ));
                }
                let mut lines = vec![format!(
                    "{} transactions, total {} {}.",
                    summary.count,
                    format_amount(summary.total_amount),
                    summary.currency
                )];
                for (category, amount) in &summary.by_category {
                    lines.push(format!("- {category}: {}", format_amount(*amount)));
                }
                Ok(HandlerReply::done(lines.join("\n")))
            }
            other => {
                tracing::warn!(operation = other, "Extractor produced unknown operation");
                Ok(HandlerReply::clarify(
                    "I wasn't sure what to do with that. Could you rephrase?",
                ))
            }
        }
    }

    /// A target is either a concrete record_id or a relative description that
    /// resolves through the ledger.
    async fn resolve_target(&self, target: &TargetArgs) -> Result<Uuid> {
        if let Some(id) = &target.record_id {
            return Uuid::parse_str(id)
                .map_err(|_| TallyError::invalid(format!("'{id}' is not a record id")));
        }
        let record = self.executor.resolve_reference(&target.filter).await?;
        Ok(record.record_id)
    }
}

#[async_trait]
impl CapabilityHandler for ExpenseHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Expense
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn operations(&self) -> Vec<OperationSchema> {
        operation_schemas()
    }

    async fn handle(&self, session: &Session, turn: &Turn) -> Result<HandlerReply> {
        let history_start = session.turns.len().saturating_sub(HISTORY_WINDOW);
        let extraction = self
            .model
            .extract(turn, &session.turns[history_start..], &self.operations())
            .await;

        let reply = match extraction {
            Ok(Extraction::Ambiguous(question)) => HandlerReply::clarify(question),
            Ok(Extraction::Operation(call)) => match self.execute(call, turn).await {
                Ok(reply) => reply,
                Err(e) => reply_for_error(e),
            },
            Err(e) => reply_for_error(e),
        };
        Ok(reply)
    }
}

#[derive(Debug, Deserialize)]
struct BatchArgs {
    #[serde(default)]
    items: Vec<RecordDraft>,
}

/// Reference to an existing record: a record_id when known, otherwise the
/// filter fields of a relative description.
#[derive(Debug, Default, Deserialize)]
struct TargetArgs {
    #[serde(default)]
    record_id: Option<String>,
    #[serde(flatten)]
    filter: RecordFilter,
}

#[derive(Debug, Deserialize)]
struct UpdateArgs {
    #[serde(flatten)]
    target: TargetArgs,
    #[serde(default)]
    changes: RecordChanges,
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: serde_json::Value) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| TallyError::invalid(format!("I couldn't read those details: {e}")))
}

fn confirm_created(record: &LedgerRecord) -> String {
    format!("Recorded: {}.", describe_record(record))
}

fn confirm_batch(outcomes: &[Result<LedgerRecord>]) -> String {
    let mut lines = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            Ok(record) => lines.push(format!("- recorded {}", describe_record(record))),
            Err(e) => lines.push(format!("- skipped one item: {e}")),
        }
    }
    let ok = outcomes.iter().filter(|o| o.is_ok()).count();
    lines.insert(0, format!("Added {ok} of {} transactions:", outcomes.len()));
    lines.join("\n")
}

fn describe_record(record: &LedgerRecord) -> String {
    format!(
        "{} - {} {} ({}, {})",
        record.memo,
        format_amount(record.amount),
        record.currency,
        record.category,
        format_sheet_date(record.occurred_at)
    )
}

fn list_records(records: &[LedgerRecord]) -> String {
    if records.is_empty() {
        return "No transactions matched.".to_string();
    }
    let mut lines = vec![format!("Found {} transactions:", records.len())];
    for record in records.iter().take(MAX_LISTED) {
        lines.push(format!("- {}", describe_record(record)));
    }
    if records.len() > MAX_LISTED {
        lines.push(format!("... and {} more.", records.len() - MAX_LISTED));
    }
    lines.join("\n")
}

fn operation_schemas() -> Vec<OperationSchema> {
    let category_names: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();

    let draft_schema = json!({
        "type": "object",
        "properties": {
            "memo": { "type": "string", "description": "Item name, e.g. 'Yogurt'" },
            "amount": { "type": "number", "description": "Amount, positive" },
            "currency": { "type": "string", "description": "Currency code, default IDR" },
            "category": { "type": "string", "enum": category_names },
            "date": { "type": "string", "description": "MM/DD/YYYY, default today" },
            "notes": { "type": "string" }
        },
        "required": ["memo", "amount", "category"]
    });

    let filter_props = json!({
        "memo_contains": { "type": "string", "description": "Substring of the item name" },
        "category": { "type": "string", "enum": category_names },
        "date_from": { "type": "string", "description": "MM/DD/YYYY, inclusive" },
        "date_to": { "type": "string", "description": "MM/DD/YYYY, inclusive" }
    });

    let target_props = json!({
        "record_id": { "type": "string", "description": "Record id when already known" },
        "memo_contains": { "type": "string" },
        "category": { "type": "string", "enum": category_names },
        "amount": { "type": "number", "description": "Exact amount, for references like 'the one for 15000'" },
        "date_from": { "type": "string", "description": "MM/DD/YYYY" },
        "date_to": { "type": "string", "description": "MM/DD/YYYY" }
    });

    vec![
        OperationSchema {
            name: "add_transaction".to_string(),
            description: "Record one expense transaction in the ledger".to_string(),
            parameters: draft_schema.clone(),
        },
        OperationSchema {
            name: "add_transactions".to_string(),
            description: "Record several expense transactions at once, in order".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "items": { "type": "array", "items": draft_schema } },
                "required": ["items"]
            }),
        },
        OperationSchema {
            name: "update_transaction".to_string(),
            description: "Change fields of an existing transaction, found by id or description"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "record_id": { "type": "string" },
                    "memo_contains": { "type": "string" },
                    "category": { "type": "string", "enum": category_names },
                    "amount": { "type": "number", "description": "Current amount of the target transaction" },
                    "date_from": { "type": "string" },
                    "date_to": { "type": "string" },
                    "changes": {
                        "type": "object",
                        "properties": {
                            "memo": { "type": "string" },
                            "amount": { "type": "number" },
                            "currency": { "type": "string" },
                            "category": { "type": "string", "enum": category_names },
                            "date": { "type": "string", "description": "MM/DD/YYYY" },
                            "notes": { "type": "string" }
                        }
                    }
                },
                "required": ["changes"]
            }),
        },
        OperationSchema {
            name: "delete_transaction".to_string(),
            description: "Delete a transaction, found by id or description".to_string(),
            parameters: json!({ "type": "object", "properties": target_props }),
        },
        OperationSchema {
            name: "query_transactions".to_string(),
            description: "List transactions matching a name, category, or date range".to_string(),
            parameters: json!({ "type": "object", "properties": filter_props }),
        },
        OperationSchema {
            name: "summarize_expenses".to_string(),
            description: "Total spending, overall and per category, for a period".to_string(),
            parameters: json!({ "type": "object", "properties": filter_props }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryLedger, ScriptedIntentModel};
    use crate::retry::RetryPolicy;

    fn handler_with(model: ScriptedIntentModel) -> (ExpenseHandler, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let executor = Arc::new(
            OperationExecutor::new(ledger.clone()).with_retry_policy(RetryPolicy::no_retry()),
        );
        (ExpenseHandler::new(Arc::new(model), executor), ledger)
    }

    #[tokio::test]
    async fn add_transaction_confirms() {
        let model = ScriptedIntentModel::new();
        model
            .script_extraction(
                "add yogurt 15000",
                Extraction::Operation(OperationCall {
                    operation: "add_transaction".into(),
                    arguments: json!({
                        "memo": "Yogurt", "amount": 15000.0, "category": "Food",
                        "date": "11/04/2025"
                    }),
                }),
            )
            .await;

        let (handler, ledger) = handler_with(model);
        let session = Session::new("u1");
        let turn = Turn::chat("add yogurt 15000");

        let reply = handler.handle(&session, &turn).await.unwrap();
        assert!(reply.text.contains("Recorded"));
        assert!(!reply.keep_active);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn ambiguous_extraction_keeps_handler_active() {
        let model = ScriptedIntentModel::new();
        model
            .script_extraction(
                "change it",
                Extraction::Ambiguous("Which transaction do you mean?".into()),
            )
            .await;

        let (handler, _) = handler_with(model);
        let reply = handler
            .handle(&Session::new("u1"), &Turn::chat("change it"))
            .await
            .unwrap();
        assert!(reply.keep_active);
        assert!(reply.text.contains("Which transaction"));
    }

    #[tokio::test]
    async fn ambiguous_update_reference_becomes_clarifying_reply() {
        let model = ScriptedIntentModel::new();
        model
            .script_extraction(
                "change yesterday's soap price to 20000",
                Extraction::Operation(OperationCall {
                    operation: "update_transaction".into(),
                    arguments: json!({
                        "memo_contains": "soap",
                        "changes": { "amount": 20000.0 }
                    }),
                }),
            )
            .await;

        let (handler, ledger) = handler_with(model);
        ledger
            .seed("soap", 15_000.0, Category::Shopping, "11/04/2025")
            .await;
        ledger
            .seed("soap refill", 25_000.0, Category::Shopping, "11/04/2025")
            .await;

        let reply = handler
            .handle(
                &Session::new("u1"),
                &Turn::chat("change yesterday's soap price to 20000"),
            )
            .await
            .unwrap();

        // Two candidates: the handler must clarify and stay active, not guess.
        assert!(reply.keep_active);
        assert!(reply.text.contains("Which one"));
    }

    #[tokio::test]
    async fn delete_missing_record_clarifies() {
        let model = ScriptedIntentModel::new();
        model
            .script_extraction(
                "delete the bubur",
                Extraction::Operation(OperationCall {
                    operation: "delete_transaction".into(),
                    arguments: json!({ "memo_contains": "bubur" }),
                }),
            )
            .await;

        let (handler, _) = handler_with(model);
        let reply = handler
            .handle(&Session::new("u1"), &Turn::chat("delete the bubur"))
            .await
            .unwrap();
        assert!(reply.keep_active);
        assert!(reply.text.contains("couldn't find"));
    }

    #[tokio::test]
    async fn batch_partial_success_reports_per_item() {
        let model = ScriptedIntentModel::new();
        model
            .script_extraction(
                "log the receipt",
                Extraction::Operation(OperationCall {
                    operation: "add_transactions".into(),
                    arguments: json!({
                        "items": [
                            { "memo": "Rice", "amount": 50.0, "category": "Food" },
                            { "memo": "Bad", "amount": -2.0, "category": "Food" }
                        ]
                    }),
                }),
            )
            .await;

        let (handler, ledger) = handler_with(model);
        let reply = handler
            .handle(&Session::new("u1"), &Turn::notification("log the receipt"))
            .await
            .unwrap();

        assert!(reply.text.contains("Added 1 of 2"));
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn unparseable_arguments_clarify_instead_of_failing() {
        let model = ScriptedIntentModel::new();
        model
            .script_extraction(
                "add something",
                Extraction::Operation(OperationCall {
                    operation: "add_transaction".into(),
                    arguments: json!({ "amount": "not-a-number" }),
                }),
            )
            .await;

        let (handler, _) = handler_with(model);
        let reply = handler
            .handle(&Session::new("u1"), &Turn::chat("add something"))
            .await
            .unwrap();
        assert!(reply.keep_active);
    }
}
