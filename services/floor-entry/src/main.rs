use anyhow::{Context, Result};
use floor_entry::{
    start_api_server, AppState, Config, DetachedStore, DocumentStore, ExportAppender,
    PgDocumentStore,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting floor entry service"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    let store = open_store(&config).await?;

    let exporter = Arc::new(
        ExportAppender::new(&config.export.dir).context("Failed to prepare export directory")?,
    );

    let api_state = AppState {
        store: store.clone(),
        exporter,
    };

    info!(address = %config.listen_addr(), "Floor entry service started");

    start_api_server(api_state, &config.api, shutdown_signal()).await?;

    info!("Shutting down floor entry service");

    store.close().await;

    info!("Floor entry service stopped");

    Ok(())
}

/// Open the document store; a missing URL leaves the service running without one
async fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    let Some(url) = config.database.url.as_deref() else {
        warn!("No database URL configured; submissions will be rejected");
        return Ok(Arc::new(DetachedStore));
    };

    let store = PgDocumentStore::connect(url, &config.database)
        .context("Failed to initialize document store")?;

    // Unreachable database is reported by /test rather than blocking startup;
    // the store retries migrations on its next write
    if config.database.run_migrations {
        if let Err(e) = store.run_migrations().await {
            warn!(error = %e, "Database migrations did not run");
        }
    }

    Ok(Arc::new(store))
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
