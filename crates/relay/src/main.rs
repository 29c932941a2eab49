use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use formcollab_relay::{
    app::build_router,
    config::RelayConfig,
    db,
    idempotency::IdempotencyStore,
    log::LogStore,
    metrics::{self, RelayMetrics},
    notify::default_notifier,
    rooms::{RoomDeps, RoomRegistry},
    sync::snapshot::{
        DocumentStore, InMemoryDocumentStore, PgDocumentStore, SnapshotScheduler, SnapshotTrigger,
        SnapshotWorker,
    },
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Upper bound on waiting for queued snapshots at shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    metrics::set_global_metrics(Arc::new(RelayMetrics::default()));

    let (log, documents): (LogStore, Arc<dyn DocumentStore>) = match &config.database_url {
        Some(database_url) => {
            let pool = db::connect(database_url, &config.db_pool)
                .await
                .context("failed to initialize relay PostgreSQL")?;
            (LogStore::Postgres(pool.clone()), Arc::new(PgDocumentStore::new(pool)))
        }
        None => {
            warn!("FORMCOLLAB_RELAY_DATABASE_URL is not set; rooms are kept in memory only");
            (LogStore::in_memory(), Arc::new(InMemoryDocumentStore::new()))
        }
    };

    let (snapshots, snapshot_jobs) = SnapshotScheduler::channel();
    let snapshot_worker = SnapshotWorker::new(
        Arc::clone(&documents),
        config.snapshot_max_attempts,
        config.snapshot_retry_base,
    )
    .spawn(snapshot_jobs);

    let registry = RoomRegistry::new(RoomDeps {
        log,
        documents,
        idempotency: IdempotencyStore::new().with_ttl(config.idempotency_ttl),
        snapshots,
        notifier: default_notifier(),
        settings: config.rooms.clone(),
    });
    let sweeper = registry.spawn_sweeper(config.sweep_interval);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        backend = registry.deps().log.backend(),
        default_strategy = config.rooms.default_strategy.as_str(),
        "starting relay server"
    );

    axum::serve(listener, build_router(registry.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")?;

    sweeper.abort();
    let scheduled = registry.snapshot_all(SnapshotTrigger::Eviction).await;
    info!(scheduled, "final snapshots scheduled");

    // The worker stops once every scheduler handle is gone.
    drop(registry);
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, snapshot_worker).await.is_err() {
        warn!("snapshot worker did not drain before the shutdown timeout");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
