//! # agora-server
//!
//! HTTP front end for the Agora conversation engine.
//!
//! This binary provides:
//! - **REST API** (axum) for direct conversations, groups, messages,
//!   reactions, read receipts, blocks, chat locks and typing
//! - **Server-sent event streams** of conversation deltas and presence
//! - **Background maintenance** that expires typing flags and idle sessions
//!
//! Identity comes from an upstream gateway in `x-user-*` headers.

mod api;
mod auth;
mod config;
mod error;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use agora_engine::collaborators::Collaborators;
use agora_engine::Engine;
use agora_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,agora_server=debug,agora_engine=debug")
            }),
        )
        .init();

    info!("Starting Agora server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the database and build the engine
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    match db.path() {
        Some(path) => info!(path = %path.display(), "Opened database"),
        None => info!("Opened in-memory database"),
    }

    let engine = Engine::new(db, config.engine.clone(), Collaborators::default());
    let http_addr = config.http_addr;
    let session_idle = config.session_idle;
    let app_state = AppState::new(engine, config);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Expire typing flags whose sender went quiet (every second)
    let engine = app_state.engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            engine.prune_typing().await;
        }
    });

    // Forget idle sessions and their unlocks (every minute)
    let sessions = app_state.sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sessions.purge_stale(session_idle).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
