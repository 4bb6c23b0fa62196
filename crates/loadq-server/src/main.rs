//! loadq Server - Main entry point

use anyhow::Result;
use loadq_common::logging::{init_logging, LogConfig};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tracing::info;

use loadq_server::{
    api::{self, AppState},
    config::{Config, StoreBackend},
    coordinator::LoadCoordinator,
    db,
    dispatch::Dispatcher,
    loader_config::ConfigResolver,
    manifest::ManifestStore,
    storage::{ObjectStore, Storage},
    tracker::{MemoryStateStore, PgStateStore, StateStore},
    warehouse::RedshiftDataWarehouse,
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("loadq-server")
        .filter_directives("loadq_server=debug,tower_http=debug,sqlx=info")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env_over(log_config.clone()).unwrap_or(log_config);

    let _log_guard = init_logging(&log_config)?;

    info!("Starting loadq server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let store: Arc<dyn StateStore> = match config.loader.store_backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config.database.pool_config()).await?;
            db::run_migrations(&pool).await?;
            Arc::new(PgStateStore::new(pool))
        },
        StoreBackend::Memory => Arc::new(MemoryStateStore::new()),
    };

    let objects: Arc<dyn ObjectStore> = Arc::new(Storage::new(config.storage.clone()).await?);
    let warehouse = Arc::new(RedshiftDataWarehouse::new(&config.warehouse).await?);

    let coordinator = LoadCoordinator::new(store).with_max_coalesce(config.loader.max_coalesce);
    let configs = ConfigResolver::new(
        objects.clone(),
        config.loader.config_bucket.clone(),
        config.loader.config_prefix.clone(),
    );
    let manifests = ManifestStore::new(
        objects,
        config.loader.manifest_bucket.clone(),
        config.loader.manifest_prefix.clone(),
    );
    let dispatcher = Dispatcher::new(coordinator, configs, manifests, warehouse)
        .with_retry(config.loader.retry_policy())
        .with_settings(config.loader.dispatch_settings());

    let app = api::router(AppState::new(dispatcher));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Statement retries run as detached tasks; give them a moment to submit.
    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
