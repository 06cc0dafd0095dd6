//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{header, HeaderValue},
    middleware,
    response::Response,
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{Error, Result};

use super::handlers::{self, ApiState};

/// Value of the `Server` response header
pub const SERVER_ID: &str = concat!("OCI-monitor/", env!("CARGO_PKG_VERSION"));

async fn server_header(mut resp: Response) -> Response {
    resp.headers_mut()
        .insert(header::SERVER, HeaderValue::from_static(SERVER_ID));
    resp
}

/// Routes of the local endpoint
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(handlers::node_status).head(handlers::node_status))
        .route("/service/{op}", post(handlers::service_action))
        .fallback(handlers::invalid_request)
        .method_not_allowed_fallback(handlers::invalid_request)
        .layer(middleware::map_response(server_header))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the REST API until `shutdown` flips to true.
pub async fn run_server(
    state: Arc<ApiState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    info!("REST API server stopped");
    Ok(())
}
