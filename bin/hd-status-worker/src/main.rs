//! Herald Status Worker
//!
//! Single serialization point for terminal states: applies them to the
//! store and delivers client webhooks with bounded retries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use hd_bus::kafka::KafkaBusConsumer;
use hd_common::topics::{STATUS_GROUP, STATUS_TOPIC};
use hd_config::ConfigLoader;
use hd_status::{MongoStatusStore, StatusWorker, WebhookDispatcher, WebhookSettings};

#[tokio::main]
async fn main() -> Result<()> {
    hd_common::logging::init_logging("hd-status-worker");

    let config = ConfigLoader::new().load()?;

    info!("Starting Herald Status Worker");

    let client = mongodb::Client::with_uri_str(&config.mongodb.uri).await?;
    let store = Arc::new(MongoStatusStore::new(client.database(&config.mongodb.database)));

    let consumer = Arc::new(KafkaBusConsumer::new(
        &config.kafka.brokers,
        STATUS_GROUP,
        &[STATUS_TOPIC],
        config.kafka.session_timeout_ms,
    )?);

    let webhook = Arc::new(WebhookDispatcher::new(WebhookSettings {
        max_retries: config.webhook.max_retries,
        timeout: Duration::from_millis(config.webhook.timeout_ms),
        signing_key: config.webhook.signing_key.clone(),
    })?);

    let worker = Arc::new(StatusWorker::new(consumer, store, webhook));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let worker_handle = {
        let worker = worker.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            worker.run(shutdown_rx).await;
        })
    };

    let metrics_handle = serve_metrics(shutdown_tx.subscribe()).await?;

    info!("Herald Status Worker started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = worker_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("Herald Status Worker shutdown complete");
    Ok(())
}

async fn serve_metrics(
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let metrics_port: u16 = std::env::var("HD_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9093);
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
