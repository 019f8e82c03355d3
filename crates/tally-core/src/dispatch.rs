// Turn pipeline
//
// The serialized-per-key consumer both producers feed. One turn is in flight
// per user at a time (a per-user async mutex), so a handler never observes
// stale active_handler state; different users proceed in parallel. The store
// keeps its own per-key append serialization - the pipeline lock additionally
// covers handler execution, which the store lock must not.
//
// Every processed turn produces a textual reply: success confirmation,
// clarifying question, or a bounded-effort failure notice. Raw errors escape
// only for store-level failures the caller must handle itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::handlers::{CapabilityHandler, HandlerKind, HandlerReply};
use crate::traits::SessionStore;
use crate::turn::Turn;

const NO_MATCH_REPLY: &str = "Sorry, I didn't catch what you'd like me to do. I can track \
expenses (add, change, delete, summarize) or look something up for you.";

/// Per-user critical sections. Lock granularity is the whole turn, not just
/// the append, so active_handler reads stay consistent with handler runs.
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    async fn acquire(&self, user_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Routes turns from either producer through the coordinator into exactly one
/// capability handler, appending both sides of the exchange to the session.
pub struct TurnPipeline {
    session_store: Arc<dyn SessionStore>,
    coordinator: Coordinator,
    handlers: HashMap<HandlerKind, Arc<dyn CapabilityHandler>>,
    locks: UserLocks,
}

impl TurnPipeline {
    pub fn new(
        session_store: Arc<dyn SessionStore>,
        coordinator: Coordinator,
        handlers: Vec<Arc<dyn CapabilityHandler>>,
    ) -> Self {
        Self {
            session_store,
            coordinator,
            handlers: handlers.into_iter().map(|h| (h.kind(), h)).collect(),
            locks: UserLocks::default(),
        }
    }

    /// Process one turn end-to-end and return the reply text.
    pub async fn handle_turn(&self, user_id: &str, turn: Turn) -> Result<String> {
        let _guard = self.locks.acquire(user_id).await;

        let origin = turn.origin;
        let session = self.session_store.append_turn(user_id, turn.clone()).await?;

        let decision = self.coordinator.route(&session, &turn).await;

        let reply = match decision {
            Ok(decision) => match decision.handler {
                Some(kind) => {
                    let handler = self.handlers.get(&kind).cloned();
                    match handler {
                        Some(handler) => {
                            let reply = match handler.handle(&session, &turn).await {
                                Ok(reply) => reply,
                                Err(e) => {
                                    warn!(user_id, error = %e, "Handler error");
                                    crate::handlers::reply_for_error(e)
                                }
                            };
                            let next_active = reply.keep_active.then_some(kind);
                            self.session_store
                                .set_active_handler(user_id, next_active)
                                .await?;
                            reply
                        }
                        None => {
                            // A decision for an unregistered handler would be a
                            // wiring bug; degrade to a no-match reply.
                            warn!(user_id, handler = %kind, "No handler registered for kind");
                            HandlerReply::done(NO_MATCH_REPLY)
                        }
                    }
                }
                // NoMatch: no handler invoked, no mutation, active handler
                // left as-is.
                None => HandlerReply::done(NO_MATCH_REPLY),
            },
            Err(e) => {
                warn!(user_id, error = %e, "Routing failed");
                crate::handlers::reply_for_error(e)
            }
        };

        self.session_store
            .append_turn(user_id, Turn::agent(origin, reply.text.clone()))
            .await?;

        info!(user_id, reply_len = reply.text.len(), "Turn processed");
        Ok(reply.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemorySessionStore, ScriptedIntentModel};
    use crate::session::Session;
    use crate::traits::{HandlerDescription, OperationSchema};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts invocations; used to assert the single-dispatch property.
    struct CountingHandler {
        kind: HandlerKind,
        calls: AtomicUsize,
        reply: HandlerReply,
    }

    impl CountingHandler {
        fn new(kind: HandlerKind, reply: HandlerReply) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
                reply,
            })
        }
    }

    #[async_trait]
    impl CapabilityHandler for CountingHandler {
        fn kind(&self) -> HandlerKind {
            self.kind
        }
        fn description(&self) -> &str {
            "counting stub"
        }
        fn operations(&self) -> Vec<OperationSchema> {
            Vec::new()
        }
        async fn handle(&self, _session: &Session, _turn: &Turn) -> Result<HandlerReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn pipeline_with(
        model: ScriptedIntentModel,
        expense: Arc<CountingHandler>,
        search: Arc<CountingHandler>,
    ) -> (TurnPipeline, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let descriptions = vec![
            HandlerDescription {
                kind: HandlerKind::Expense,
                description: "expenses".into(),
            },
            HandlerDescription {
                kind: HandlerKind::Search,
                description: "search".into(),
            },
        ];
        let coordinator = Coordinator::new(Arc::new(model), descriptions);
        let pipeline = TurnPipeline::new(
            store.clone(),
            coordinator,
            vec![
                expense as Arc<dyn CapabilityHandler>,
                search as Arc<dyn CapabilityHandler>,
            ],
        );
        (pipeline, store)
    }

    #[tokio::test]
    async fn exactly_one_handler_per_turn() {
        let model = ScriptedIntentModel::new();
        model
            .script_route("add yogurt", Some(HandlerKind::Expense))
            .await;

        let expense = CountingHandler::new(HandlerKind::Expense, HandlerReply::done("ok"));
        let search = CountingHandler::new(HandlerKind::Search, HandlerReply::done("ok"));
        let (pipeline, _) = pipeline_with(model, expense.clone(), search.clone());

        pipeline
            .handle_turn("u1", Turn::chat("add yogurt"))
            .await
            .unwrap();

        assert_eq!(expense.calls.load(Ordering::SeqCst), 1);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_match_invokes_nothing_and_replies_generically() {
        let model = ScriptedIntentModel::new();
        let expense = CountingHandler::new(HandlerKind::Expense, HandlerReply::done("ok"));
        let search = CountingHandler::new(HandlerKind::Search, HandlerReply::done("ok"));
        let (pipeline, store) = pipeline_with(model, expense.clone(), search.clone());

        let reply = pipeline
            .handle_turn("u1", Turn::chat("blorp"))
            .await
            .unwrap();

        assert_eq!(reply, NO_MATCH_REPLY);
        assert_eq!(expense.calls.load(Ordering::SeqCst), 0);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);

        // Both the user turn and the agent reply are in the history.
        let session = store.load_or_create("u1").await.unwrap();
        assert_eq!(session.turn_count(), 2);
    }

    #[tokio::test]
    async fn clarifying_reply_sets_active_handler() {
        let model = ScriptedIntentModel::new();
        model
            .script_route("change the soap", Some(HandlerKind::Expense))
            .await;

        let expense = CountingHandler::new(
            HandlerKind::Expense,
            HandlerReply::clarify("Which one do you mean?"),
        );
        let search = CountingHandler::new(HandlerKind::Search, HandlerReply::done("ok"));
        let (pipeline, store) = pipeline_with(model, expense, search);

        pipeline
            .handle_turn("u1", Turn::chat("change the soap"))
            .await
            .unwrap();

        let session = store.load_or_create("u1").await.unwrap();
        assert_eq!(session.active_handler, Some(HandlerKind::Expense));

        // The unclassified follow-up lands on the sticky handler and, once it
        // completes, the handler releases the conversation.
        let expense_done =
            CountingHandler::new(HandlerKind::Expense, HandlerReply::done("Updated."));
        let model = ScriptedIntentModel::new();
        let (pipeline2, store2) = pipeline_with(model, expense_done.clone(), {
            CountingHandler::new(HandlerKind::Search, HandlerReply::done("ok"))
        });
        store2
            .seed_session("u1", Some(HandlerKind::Expense))
            .await;

        pipeline2
            .handle_turn("u1", Turn::chat("the one for 15000"))
            .await
            .unwrap();
        assert_eq!(expense_done.calls.load(Ordering::SeqCst), 1);
        let session = store2.load_or_create("u1").await.unwrap();
        assert_eq!(session.active_handler, None);
    }

    #[tokio::test]
    async fn cross_producer_race_keeps_both_turns_once() {
        let model = ScriptedIntentModel::new();
        model
            .script_route("logged: fried rice, 50", Some(HandlerKind::Expense))
            .await;
        model
            .script_route("total expenses this month", Some(HandlerKind::Expense))
            .await;

        let expense = CountingHandler::new(HandlerKind::Expense, HandlerReply::done("ok"));
        let search = CountingHandler::new(HandlerKind::Search, HandlerReply::done("ok"));
        let (pipeline, store) = pipeline_with(model, expense.clone(), search);
        let pipeline = Arc::new(pipeline);

        let a = {
            let p = pipeline.clone();
            tokio::spawn(async move {
                p.handle_turn("u1", Turn::notification("logged: fried rice, 50"))
                    .await
            })
        };
        let b = {
            let p = pipeline.clone();
            tokio::spawn(async move {
                p.handle_turn("u1", Turn::chat("total expenses this month"))
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let session = store.load_or_create("u1").await.unwrap();
        // Two user turns + two agent replies, each exactly once.
        assert_eq!(session.turn_count(), 4);
        let user_contents: Vec<_> = session
            .turns
            .iter()
            .filter(|t| t.is_user())
            .map(|t| t.content.clone())
            .collect();
        assert_eq!(user_contents.len(), 2);
        assert!(user_contents.contains(&"logged: fried rice, 50".to_string()));
        assert!(user_contents.contains(&"total expenses this month".to_string()));
        assert_eq!(expense.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_users_do_not_serialize() {
        // Regression guard: a long turn for one user must not block another
        // user's turn. Uses a handler that waits until both are in flight.
        use tokio::sync::Barrier;

        struct BarrierHandler {
            barrier: Arc<Barrier>,
        }

        #[async_trait]
        impl CapabilityHandler for BarrierHandler {
            fn kind(&self) -> HandlerKind {
                HandlerKind::Expense
            }
            fn description(&self) -> &str {
                "barrier stub"
            }
            fn operations(&self) -> Vec<OperationSchema> {
                Vec::new()
            }
            async fn handle(&self, _s: &Session, _t: &Turn) -> Result<HandlerReply> {
                // Completes only when both users' turns reach this point.
                self.barrier.wait().await;
                Ok(HandlerReply::done("ok"))
            }
        }

        let model = ScriptedIntentModel::new();
        model.script_route("hi", Some(HandlerKind::Expense)).await;

        let barrier = Arc::new(Barrier::new(2));
        let store = Arc::new(InMemorySessionStore::new());
        let coordinator = Coordinator::new(
            Arc::new(model),
            vec![HandlerDescription {
                kind: HandlerKind::Expense,
                description: "expenses".into(),
            }],
        );
        let pipeline = Arc::new(TurnPipeline::new(
            store,
            coordinator,
            vec![Arc::new(BarrierHandler {
                barrier: barrier.clone(),
            }) as Arc<dyn CapabilityHandler>],
        ));

        let a = {
            let p = pipeline.clone();
            tokio::spawn(async move { p.handle_turn("u1", Turn::chat("hi")).await })
        };
        let b = {
            let p = pipeline.clone();
            tokio::spawn(async move { p.handle_turn("u2", Turn::chat("hi")).await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
    }
}
