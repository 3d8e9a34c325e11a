//! Herald Delayed Worker
//!
//! Runs the delayed stager (topic → ordered set) and the claim/confirm
//! poller (ordered set → channel topics) in one process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use hd_bus::kafka::{KafkaBusConsumer, KafkaBusPublisher};
use hd_bus::BusPublisher;
use hd_cache::RedisCache;
use hd_common::topics::{DELAYED_GROUP, DELAYED_TOPIC};
use hd_config::ConfigLoader;
use hd_delayed::{DelayedPoller, DelayedPollerConfig, DelayedStager};

#[tokio::main]
async fn main() -> Result<()> {
    hd_common::logging::init_logging("hd-delayed-worker");

    let config = ConfigLoader::new().load()?;

    info!("Starting Herald Delayed Worker");

    let cache = Arc::new(RedisCache::connect(&config.redis.url, &config.redis.key_prefix).await?);

    let consumer = Arc::new(KafkaBusConsumer::new(
        &config.kafka.brokers,
        DELAYED_GROUP,
        &[DELAYED_TOPIC],
        config.kafka.session_timeout_ms,
    )?);

    let bus = Arc::new(KafkaBusPublisher::new(
        &config.kafka.brokers,
        Duration::from_millis(config.kafka.delivery_timeout_ms),
    )?);

    let stager = Arc::new(DelayedStager::new(consumer, cache.clone()));
    let poller = Arc::new(DelayedPoller::new(
        cache,
        bus.clone(),
        DelayedPollerConfig {
            poll_interval: Duration::from_millis(config.delayed.poll_interval_ms),
            batch_size: config.delayed.batch_size,
            claim_ttl: Duration::from_millis(config.delayed.claim_ttl_ms),
            max_poller_retries: config.delayed.max_poller_retries,
        },
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let stager_handle = {
        let stager = stager.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            stager.run(shutdown_rx).await;
        })
    };

    let poller_handle = {
        let poller = poller.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            poller.run(shutdown_rx).await;
        })
    };

    let metrics_handle = serve_metrics(shutdown_tx.subscribe()).await?;

    info!("Herald Delayed Worker started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = stager_handle.await;
        let _ = poller_handle.await;
        let _ = metrics_handle.await;
    })
    .await;
    let _ = bus.flush().await;

    info!("Herald Delayed Worker shutdown complete");
    Ok(())
}

async fn serve_metrics(
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let metrics_port: u16 = std::env::var("HD_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9092);
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
