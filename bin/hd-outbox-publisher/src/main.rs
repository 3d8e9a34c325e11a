//! Herald Outbox Publisher
//!
//! Horizontally replicated worker that claims pending outbox rows and
//! publishes them to the bus. Safe to run N instances: claims are CAS'd
//! with this worker's identity and stale claims are reclaimed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use hd_bus::kafka::KafkaBusPublisher;
use hd_bus::BusPublisher;
use hd_config::ConfigLoader;
use hd_outbox::{MongoOutboxStore, OutboxPublisher, OutboxPublisherConfig};

#[tokio::main]
async fn main() -> Result<()> {
    hd_common::logging::init_logging("hd-outbox-publisher");

    let config = ConfigLoader::new().load()?;
    let worker_id = config
        .worker_id
        .clone()
        .unwrap_or_else(hd_common::worker_identity);

    info!(worker_id = %worker_id, "Starting Herald Outbox Publisher");

    let client = mongodb::Client::with_uri_str(&config.mongodb.uri).await?;
    let store = Arc::new(MongoOutboxStore::new(client.database(&config.mongodb.database)));

    let bus = Arc::new(KafkaBusPublisher::new(
        &config.kafka.brokers,
        Duration::from_millis(config.kafka.delivery_timeout_ms),
    )?);

    let publisher = Arc::new(OutboxPublisher::new(
        store,
        bus.clone(),
        OutboxPublisherConfig {
            poll_interval: Duration::from_millis(config.outbox.poll_interval_ms),
            batch_size: config.outbox.batch_size,
            claim_timeout: Duration::from_millis(config.outbox.claim_timeout_ms),
            worker_id,
        },
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let publisher_handle = {
        let publisher = publisher.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            publisher.run(shutdown_rx).await;
        })
    };

    let metrics_handle = serve_metrics(shutdown_tx.subscribe()).await?;

    info!("Herald Outbox Publisher started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Stop claiming, drain the loop, then flush the producer.
    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = publisher_handle.await;
        let _ = metrics_handle.await;
    })
    .await;
    let _ = bus.flush().await;

    info!("Herald Outbox Publisher shutdown complete");
    Ok(())
}

async fn serve_metrics(
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let metrics_port: u16 = std::env::var("HD_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9090);
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
