//! Herald Ingest Server
//!
//! Accepts notification send requests and persists them together with their
//! outbox rows in one store transaction. Publishing is handled by the
//! outbox publisher deployment.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use tokio::signal;
use tracing::info;

use hd_config::ConfigLoader;
use hd_ingest::{indexes, ApiKeyAuth, AppState, IngestService};

#[tokio::main]
async fn main() -> Result<()> {
    hd_common::logging::init_logging("hd-ingest-server");

    let config = ConfigLoader::new().load()?;

    info!("Starting Herald Ingest Server");

    let client = mongodb::Client::with_uri_str(&config.mongodb.uri).await?;
    let service = Arc::new(IngestService::new(client, &config.mongodb.database));

    indexes::ensure_indexes(service.database()).await?;

    let auth = Arc::new(ApiKeyAuth::new(&config.auth.api_key));
    if !auth.is_enabled() {
        tracing::warn!("HD_API_KEY not set; ingest API is unauthenticated");
    }

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let state = AppState {
        service,
        auth,
    };
    let app = hd_ingest::router(state).route(
        "/metrics",
        get(move || {
            let prometheus = prometheus.clone();
            async move { prometheus.render() }
        }),
    );

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    info!("Ingest API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Herald Ingest Server shutdown complete");
    Ok(())
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
