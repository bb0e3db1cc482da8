use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tracing_subscriber::EnvFilter;

/// Serves `GET /metrics` on `0.0.0.0:{port}` until the process exits.
pub async fn run_metrics_server(registry: Registry, port: u16) -> Result<(), anyhow::Error> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Serving metrics on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics(State(registry): State<Registry>) -> Result<String, (StatusCode, String)> {
    render_metrics(&registry).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

pub fn render_metrics(registry: &Registry) -> Result<String, anyhow::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Creates a counter and registers it with `registry`.
pub fn register_counter(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

pub fn setup_tracing() {
    // construct a subscriber that prints formatted traces to stdout
    let filter = EnvFilter::from_default_env();
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    // use that subscriber to process traces emitted after this point
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("A global tracing subscriber was already installed");
        return;
    }
    tracing::info!("Tracing initialized");
}
