use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use grcserver::alerts::sla::run_sweeper;
use grcserver::compliance::catalog::seed_builtin;
use grcserver::config::{AppConfig, LoggingConfig};
use grcserver::configure_api_routes;
use grcserver::core::state::AppState;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;
    init_tracing(&config.logging);

    let addr = config.bind_address();
    let seed_catalog = config.catalog.seed_builtin;
    let sweep_interval = Duration::from_secs(config.sla.sweep_interval_seconds.max(1));
    let state = AppState::new(config).context("Failed to initialize application state")?;

    if seed_catalog {
        match seed_builtin(&state.store) {
            Ok(0) => info!("Framework catalog already present"),
            Ok(count) => info!(count, "Seeded built-in framework catalog"),
            Err(e) => warn!("Failed to seed the framework catalog: {e}"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweeper(state.store.clone(), sweep_interval, shutdown_rx));

    let app = configure_api_routes(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("HTTP server listening on {addr}");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if shutdown_tx.send(true).is_err() {
        warn!("SLA sweeper already stopped");
    }
    if let Err(e) = sweeper.await {
        error!("SLA sweeper task failed: {e}");
    }

    served.context("HTTP server failed")
}
