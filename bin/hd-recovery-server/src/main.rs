//! Herald Recovery Server
//!
//! Runs the reconciliation cron. Ticks are health-gated and every heal is a
//! store transaction, so it is safe to run alongside live consumers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use hd_cache::RedisCache;
use hd_config::ConfigLoader;
use hd_recovery::{RecoveryService, RecoverySettings};

#[tokio::main]
async fn main() -> Result<()> {
    hd_common::logging::init_logging("hd-recovery-server");

    let config = ConfigLoader::new().load()?;
    let worker_id = config
        .worker_id
        .clone()
        .unwrap_or_else(hd_common::worker_identity);

    info!(worker_id = %worker_id, "Starting Herald Recovery Server");

    let client = mongodb::Client::with_uri_str(&config.mongodb.uri).await?;
    let db = client.database(&config.mongodb.database);

    let cache = Arc::new(RedisCache::connect(&config.redis.url, &config.redis.key_prefix).await?);

    let service = Arc::new(RecoveryService::new(
        client,
        db,
        cache.clone(),
        cache,
        RecoverySettings {
            poll_interval: Duration::from_millis(config.recovery.poll_interval_ms),
            batch_size: config.recovery.batch_size,
            processing_stuck_threshold: Duration::from_millis(
                config.recovery.processing_stuck_threshold_ms,
            ),
            pending_stuck_threshold: Duration::from_millis(
                config.recovery.pending_stuck_threshold_ms,
            ),
            alert_retention: Duration::from_millis(config.recovery.alert_retention_ms),
            status_outbox_retention: Duration::from_millis(
                config.recovery.status_outbox_retention_ms,
            ),
            outbox_retention: Duration::from_millis(config.recovery.outbox_retention_ms),
            max_retry_count: config.dispatch.max_retry_count,
            worker_id,
        },
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let service_handle = {
        let service = service.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            service.run(shutdown_rx).await;
        })
    };

    let metrics_handle = serve_metrics(shutdown_tx.subscribe()).await?;

    info!("Herald Recovery Server started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = service_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("Herald Recovery Server shutdown complete");
    Ok(())
}

async fn serve_metrics(
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let metrics_port: u16 = std::env::var("HD_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9094);
    let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));

    let app = axum::Router::new()
        .route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        )
        .route("/health", get(|| async { "UP" }));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics server listening on http://{}/metrics", addr);

    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .ok();
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
