//! # relay
//!
//! Session gateway binary. Loads settings, wires the engine adapter,
//! backend notifier, cleanup worker and session registry together, and
//! serves the Control API until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;

use relay_engine::SidecarFactory;
use relay_sessions::{
    CleanupPolicy, CleanupWorker, FsSessionStore, HttpNotifier, QrSvgRenderer, SessionRegistry, SyncOrchestrator,
};
use relay_settings::{loader, RelaySettings};
use relay_telemetry::TelemetryConfig;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Multi-tenant messaging session gateway.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Multi-tenant messaging session gateway")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to bind, overriding settings and environment.
    #[arg(long)]
    port: Option<u16>,
}

fn telemetry_config(settings: &RelaySettings) -> TelemetryConfig {
    let log_level = settings.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    TelemetryConfig {
        log_level,
        json: settings.logging.json,
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: settings.logging.db_path.clone(),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.config.unwrap_or_else(loader::settings_path);
    let mut settings = loader::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    let telemetry = relay_telemetry::init_telemetry(telemetry_config(&settings));
    tracing::info!(path = %settings_path.display(), "settings loaded");

    std::fs::create_dir_all(&settings.sessions.root).with_context(|| {
        format!("Failed to create sessions directory: {}", settings.sessions.root.display())
    })?;

    let notifier = Arc::new(
        HttpNotifier::new(&settings.backend.base_url, settings.backend.timeout())
            .context("Failed to build backend client")?,
    );
    let factory = Arc::new(
        SidecarFactory::new(&settings.engine.base_url, settings.engine.timeout())
            .context("Failed to build engine client")?,
    );
    let cleanup = CleanupWorker::new(
        &settings.sessions.root,
        Arc::new(FsSessionStore),
        CleanupPolicy {
            max_retries: settings.sessions.cleanup_max_retries,
            delay: settings.sessions.cleanup_delay(),
        },
    );
    let registry = Arc::new(SessionRegistry::new(
        factory,
        notifier.clone(),
        Arc::new(QrSvgRenderer::default()),
        cleanup,
    ));
    let sync = Arc::new(SyncOrchestrator::new(Arc::clone(&registry), notifier));

    let config = relay_server::ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
    };
    let server = relay_server::start(
        config,
        relay_server::AppState {
            registry: Arc::clone(&registry),
            sync,
            logs: telemetry.log_sink(),
        },
    )
    .await
    .context("Failed to start control API")?;

    tracing::info!(
        port = server.port,
        backend = %settings.backend.base_url,
        engine = %settings.engine.base_url,
        "relay ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    server.shutdown(SHUTDOWN_TIMEOUT).await;
    registry.shutdown_all().await;

    Ok(())
}
