//! Source sheets server.
//!
//! This is the main entry point for the sheets web service. The application
//! is organized into the following modules:
//!
//! - `citation`, `corpus`, `resolver`: turning citations into bilingual text
//! - `disambiguation`, `history`, `session`: editing a sheet
//! - `store`, `persistence`: keeping it durable
//! - `auth`, `handlers`: the HTTP surface
//! - `config`, `error`: runtime settings and error types

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use sheets::{config::Config, error::StartupError, handlers, spawn_session_sweeper, AppState};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sheets=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Current sheet
        .route("/api/sheet", get(handlers::get_sheet))
        .route("/api/sheet/load", post(handlers::load_sheet))
        .route("/api/sheet/new", post(handlers::new_sheet))
        .route("/api/sheet/title", put(handlers::set_title))
        .route("/api/sheet/undo", post(handlers::undo))
        .route("/api/sheet/redo", post(handlers::redo))
        .route("/api/sheet/chat", post(handlers::chat))
        // Entries
        .route("/api/sheet/sources", post(handlers::add_source))
        .route(
            "/api/sheet/disambiguation/select",
            post(handlers::select_candidate),
        )
        .route(
            "/api/sheet/disambiguation/cancel",
            post(handlers::cancel_disambiguation),
        )
        .route("/api/sheet/notes", post(handlers::add_note))
        .route("/api/sheet/headers", post(handlers::add_header))
        .route("/api/sheet/entries/{id}", delete(handlers::remove_entry))
        .route("/api/sheet/entries/{id}/move", post(handlers::move_entry))
        .route(
            "/api/sheet/entries/{id}/version",
            post(handlers::change_version),
        )
        .route("/api/sheet/entries/{id}/view", post(handlers::set_view_mode))
        // Account sheets
        .route("/api/sheets", get(handlers::list_sheets))
        .route("/api/sheets/events", get(handlers::sheet_events))
        .route("/api/sheets/{id}", delete(handlers::delete_sheet))
        // Auth
        .route("/login", post(handlers::login_submit))
        .route("/logout", get(handlers::logout))
        .with_state(state)
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    let bind = config.bind.clone();
    let accounts = config.accounts_enabled();
    let state = Arc::new(AppState::new(config)?);
    spawn_session_sweeper(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|source| StartupError::Bind {
            addr: bind.clone(),
            source,
        })?;

    tracing::info!(addr = %bind, "sheets server running");
    tracing::info!(corpus = %state.config.corpus_url, db = %state.config.db_path, "storage and corpus");
    if accounts {
        tracing::info!("accounts: ENABLED (SHEETS_SECRET and SHEETS_PASSWORD set)");
    } else {
        tracing::info!("accounts: DISABLED (set SHEETS_SECRET and SHEETS_PASSWORD to enable)");
    }
    if state.assistant.is_none() {
        tracing::info!("assistant: not configured (set SHEETS_ASSISTANT_URL)");
    }

    axum::serve(listener, router(state))
        .await
        .map_err(StartupError::Serve)
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(e) = run().await {
        tracing::error!(error = %e, "sheets server stopped");
        std::process::exit(1);
    }
}
