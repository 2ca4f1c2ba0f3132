use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::consumer::{JobConsumer, Worker};
use super::db::{DbHandle, StudioDb};
use super::queue::JobQueue;
use super::ws::{self, WsMessage};
use crate::config::StudioConfig;

/// `[server]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a separately served frontend.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3141
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".pluffy/studio.db")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Open the database at `path`, creating its directory if needed.
pub fn open_db(path: &Path) -> Result<DbHandle> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    let db = StudioDb::new(path).context("Failed to initialize studio database")?;
    Ok(DbHandle::new(db))
}

/// Worker wired to the configured queue policy and agent backend.
pub fn build_worker(
    db: DbHandle,
    ws_tx: Option<broadcast::Sender<WsMessage>>,
    config: &StudioConfig,
) -> Worker {
    let queue = JobQueue::new(db.clone(), config.queue.policy());
    let mut consumer = JobConsumer::new(db, config.agent.provider(), config.agent.spec());
    if let Some(tx) = ws_tx {
        consumer = consumer.with_events(tx);
    }
    Worker::new(queue, consumer, config.queue.poll_interval())
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server and the job worker until Ctrl+C.
pub async fn start_server(config: StudioConfig) -> Result<()> {
    let db = open_db(&config.server.db_path)?;
    let (ws_tx, _rx) = broadcast::channel::<WsMessage>(256);

    let worker = build_worker(db.clone(), Some(ws_tx.clone()), &config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(async move { worker.run_until(shutdown_rx).await });

    let state = Arc::new(AppState::new(db, ws_tx));
    let mut app = build_router(state);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, agent = %config.agent.name, offline = config.agent.offline, "studio listening");
    println!("Pluffy studio running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "worker task panicked");
    }
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
