use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use relay_sessions::{SessionRegistry, SyncOrchestrator};
use relay_telemetry::SqliteLogSink;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub sync: Arc<SyncOrchestrator>,
    /// Persisted log records, when SQLite logging is enabled.
    pub logs: Option<Arc<SqliteLogSink>>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/start-client", post(handlers::start_client))
        .route("/qr/{user_id}", get(handlers::qr))
        .route("/run-client-task", post(handlers::run_client_task))
        .route("/status/{user_id}", get(handlers::status))
        .route("/logs/{user_id}", get(handlers::logs))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve the Control API. Port 0 picks a free port.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "control API listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "control API stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait up to `timeout` for in-flight
    /// requests to finish.
    pub async fn shutdown(self, timeout: Duration) {
        self.shutdown.cancel();
        if tokio::time::timeout(timeout, self.server).await.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "control API did not stop in time");
        }
    }
}
