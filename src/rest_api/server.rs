//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::WorkQueue;
use crate::store::ResourceStore;
use crate::{Error, Result};

use super::handlers;

/// Shared state for the handlers
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ResourceStore>,
    pub queue: Arc<WorkQueue>,
}

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> std::result::Result<String, axum::http::StatusCode> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

pub fn router(state: ApiState) -> Router {
    let app = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/api/v1/databases", get(handlers::list_databases))
        .route(
            "/api/v1/databases/{namespace}/{name}",
            get(handlers::get_database),
        );
    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the REST API server
pub async fn run_server(state: ApiState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("REST API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
