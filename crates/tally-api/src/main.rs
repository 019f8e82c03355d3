// Tally API server
// Decision: Two ingress webhooks (Pub/Sub push, Telegram) in one process sharing the session store
// Decision: Push deliveries are acknowledged immediately and processed in a background task

mod auth;
mod config;
mod pubsub;
mod services;
mod telegram;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_core::{
    CapabilityHandler, Coordinator, CursorStore, DuckDuckGoLookup, EventCursor, ExpenseHandler,
    GeminiIntentModel, IntentModel, MailProvider, OperationExecutor, SearchHandler, SessionStore,
    TurnPipeline,
};
use tally_google::{GmailClient, SheetsLedger, StaticTokenProvider, TokenProvider};
use tally_storage::{Database, DbCursorStore, DbSessionStore};

use config::AppConfig;
use services::{NotificationProcessor, TelegramClient};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    mailbox: String,
}

/// State for health endpoint
#[derive(Clone)]
struct HealthState {
    mailbox: String,
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        mailbox: state.mailbox.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("tally-api starting...");

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    // Initialize database
    let db = Database::from_url(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    let session_store: Arc<dyn SessionStore> = Arc::new(DbSessionStore::new(db.clone()));
    let cursor_store: Arc<dyn CursorStore> = Arc::new(DbCursorStore::new(db));

    // Google collaborators
    let gmail_token: Arc<dyn TokenProvider> =
        Arc::new(StaticTokenProvider::new(config.gmail_token.clone()));
    let gmail = GmailClient::new(gmail_token);

    let label_id = gmail
        .resolve_label(&config.mailbox_id, &config.payment_label)
        .await
        .context("Failed to list Gmail labels")?
        .with_context(|| {
            format!(
                "Gmail label '{}' not found in mailbox '{}'",
                config.payment_label, config.mailbox_id
            )
        })?;
    tracing::info!(
        label = %config.payment_label,
        label_id = %label_id,
        "Payment label resolved"
    );

    let sheets_token: Arc<dyn TokenProvider> =
        Arc::new(StaticTokenProvider::new(config.sheets_token.clone()));
    let ledger = SheetsLedger::new(
        sheets_token,
        config.spreadsheet_id.clone(),
        config.sheet_name.clone(),
        config.sheet_gid,
    );

    // Classifier/extractor, resolved once and injected everywhere
    let model: Arc<dyn IntentModel> = Arc::new(
        GeminiIntentModel::new(config.google_api_key.clone()).with_model(config.llm_model.clone()),
    );
    tracing::info!(model = %config.llm_model, "Intent model configured");

    // Capability handlers over the operation executor
    let executor = Arc::new(OperationExecutor::new(Arc::new(ledger)));
    let expense = Arc::new(ExpenseHandler::new(model.clone(), executor));
    let search = Arc::new(SearchHandler::new(
        model.clone(),
        Arc::new(DuckDuckGoLookup::new()),
    ));

    let coordinator = Coordinator::new(model, vec![expense.describe(), search.describe()]);
    let pipeline = Arc::new(TurnPipeline::new(
        session_store,
        coordinator,
        vec![
            expense as Arc<dyn CapabilityHandler>,
            search as Arc<dyn CapabilityHandler>,
        ],
    ));

    // Notification path: cursor over the Gmail change stream feeding the
    // same pipeline the chat path uses
    let mail: Arc<dyn MailProvider> = Arc::new(gmail);
    let cursor = EventCursor::new(cursor_store, mail.clone(), label_id);
    let telegram_client = TelegramClient::new(config.telegram_bot_token.clone());
    let processor = Arc::new(NotificationProcessor::new(
        cursor,
        mail,
        pipeline.clone(),
        telegram_client.clone(),
        config.notification_chat_id.clone(),
    ));

    let pubsub_state = pubsub::AppState {
        processor,
        auth_token: config.pubsub_auth_token.clone(),
    };
    let telegram_state = telegram::AppState {
        pipeline,
        telegram: telegram_client,
        webhook_secret: config.telegram_webhook_secret.clone(),
        allowed_user_ids: config.allowed_user_ids.clone(),
    };
    let health_state = HealthState {
        mailbox: config.mailbox_id.clone(),
    };

    let app = Router::new()
        .route("/health", get(health).with_state(health_state))
        .merge(pubsub::routes(pubsub_state))
        .merge(telegram::routes(telegram_state))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
