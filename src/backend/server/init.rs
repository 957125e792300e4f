//! Server Initialization
//!
//! Builds the engine and its collaborators from configuration and wires
//! up the router. Initialization is resilient: a missing or unreachable
//! database downgrades to the in-memory store, and a missing webhook URL
//! disables push notifications, so the server always comes up.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::backend::auth::JwtVerifier;
use crate::backend::blob::LocalBlobStore;
use crate::backend::engine::{ChatEngine, EngineConfig};
use crate::backend::notify::{NullNotifier, Notifier, WebhookNotifier};
use crate::backend::server::config::{load_database, ServerConfig};
use crate::backend::server::state::AppState;
use crate::backend::server::ws::ws_handler;
use crate::backend::storage::{ChatStore, MemoryStore, PgStore};

async fn health() -> &'static str {
    "OK"
}

/// Create and configure the Axum application.
pub async fn create_app(config: ServerConfig) -> Router {
    info!("Initializing chat fan-out engine");

    // Storage: Postgres when configured and reachable, in-memory otherwise.
    let store: Arc<dyn ChatStore> = match load_database(&config).await {
        Some(pool) => Arc::new(PgStore::new(pool)),
        None => Arc::new(MemoryStore::new()),
    };

    let blobs = Arc::new(LocalBlobStore::new(&config.uploads_dir, "/uploads"));

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => {
            info!("Push notifications enabled via webhook");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => Arc::new(NullNotifier),
    };

    let engine = Arc::new(ChatEngine::new(
        store,
        blobs,
        notifier,
        EngineConfig {
            max_file_bytes: config.max_file_bytes(),
            upload_idle_timeout: config.upload_idle_timeout,
            ..EngineConfig::default()
        },
    ));

    // Periodic sweep for chunked uploads that stopped receiving data.
    let sweep_engine = engine.clone();
    let sweep_every = config.upload_idle_timeout / 2;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every.max(std::time::Duration::from_secs(5)));
        loop {
            interval.tick().await;
            let dropped = sweep_engine.sweep_idle_uploads();
            if dropped > 0 {
                info!("Swept {} stalled upload(s)", dropped);
            }
        }
    });

    let state = AppState { engine, verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)) };

    info!("Router configured");
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}
