//! Herald Dispatch Worker
//!
//! Channel consumer deployment. `HD_CHANNEL` selects a single channel;
//! without it, one worker is started per configured channel (dev mode).

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
use hd_common::topics;
use hd_config::{AppConfig, ChannelConfig, ConfigLoader};
use hd_dispatch::{ChannelEntry, ChannelRegistry, DispatchWorker, DispatchWorkerConfig, HttpProvider};

#[tokio::main]
async fn main() -> Result<()> {
    hd_common::logging::init_logging("hd-dispatch-worker");

    let config = ConfigLoader::new().load()?;

    let channels: Vec<ChannelConfig> = match std::env::var("HD_CHANNEL") {
        Ok(name) => {
            let channel = config
                .channel(&name)
                .ok_or_else(|| anyhow::anyhow!("channel {} is not configured", name))?;
            vec![channel.clone()]
        }
        Err(_) => config.channels.clone(),
    };

    info!(
        channels = ?channels.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        "Starting Herald Dispatch Worker"
    );

    let cache = Arc::new(RedisCache::connect(&config.redis.url, &config.redis.key_prefix).await?);

    let bus = Arc::new(KafkaBusPublisher::new(
        &config.kafka.brokers,
        Duration::from_millis(config.kafka.delivery_timeout_ms),
    )?);

    // The registry is the only place channel tags map to providers and
    // topics; the workers themselves are channel-agnostic.
    let provider_timeout = Duration::from_millis(config.dispatch.provider_timeout_ms);
    let mut registry = ChannelRegistry::new();
    for channel in &channels {
        let provider = Arc::new(HttpProvider::new(
            &format!("{}-gateway", channel.name),
            &channel.provider_url,
            channel.provider_token.clone(),
            provider_timeout,
        )?);
        registry.register(
            &channel.name,
            provider,
            channel.rate_limit_tokens,
            channel.rate_limit_refill_rate,
        );
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut worker_handles = Vec::new();
    for (name, entry) in registry.channels() {
        let worker = build_worker(&config, name, entry, cache.clone(), bus.clone())?;
        let shutdown_rx = shutdown_tx.subscribe();
        worker_handles.push(tokio::spawn(async move {
            worker.run(shutdown_rx).await;
        }));
    }

    let metrics_handle = serve_metrics(shutdown_tx.subscribe()).await?;

    info!("Herald Dispatch Worker started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Pause consumption, drain in-flight handlers, then flush the producer.
    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = metrics_handle.await;
    })
    .await;
    let _ = bus.flush().await;

    info!("Herald Dispatch Worker shutdown complete");
    Ok(())
}

fn build_worker(
    config: &AppConfig,
    channel: &str,
    entry: &ChannelEntry,
    cache: Arc<RedisCache>,
    bus: Arc<KafkaBusPublisher>,
) -> Result<DispatchWorker> {
    let consumer = Arc::new(KafkaBusConsumer::new(
        &config.kafka.brokers,
        &topics::channel_group(channel),
        &[entry.topic.as_str()],
        config.kafka.session_timeout_ms,
    )?);

    Ok(DispatchWorker::new(
        DispatchWorkerConfig {
            channel: channel.to_string(),
            max_retry_count: config.dispatch.max_retry_count,
            processing_ttl: Duration::from_secs(config.dispatch.processing_ttl_seconds),
            idempotency_ttl: Duration::from_secs(config.dispatch.idempotency_ttl_seconds),
            backoff_base_ms: config.dispatch.backoff_base_ms,
            backoff_cap_ms: config.dispatch.backoff_cap_ms,
            provider_timeout: Duration::from_millis(config.dispatch.provider_timeout_ms),
            rate_limit_tokens: entry.rate_limit_tokens,
            rate_limit_refill_rate: entry.rate_limit_refill_rate,
        },
        consumer,
        bus,
        cache.clone(),
        cache,
        entry.provider.clone(),
    ))
}

async fn serve_metrics(
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let metrics_port: u16 = std::env::var("HD_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9091);
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
