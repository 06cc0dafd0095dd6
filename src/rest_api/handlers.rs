//! HTTP handlers for the REST API

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{OriginalUri, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::drain::DrainCoordinator;
use crate::controller::install_state::{InstallState, InstallStatus};
use crate::controller::service_control::ServiceControl;
use crate::error::Result;
use crate::labels::ServiceRequest;

const UNKNOWN_MSG: &str = "Node status UNKNOWN\n";
const INSTALLING_MSG: &str = "Node status INSTALLING\n";
const FAILURE_MSG: &str = "INTERNAL ERROR - please check servers logs";

/// Operation requested through `POST /service/{op}`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestAction {
    Service(ServiceRequest),
    /// Drain every volume consumer pod
    Drain,
    /// Drain controller-managed volume consumer pods only
    DrainManaged,
}

impl RestAction {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "drain" => Some(RestAction::Drain),
            "drain-managed" => Some(RestAction::DrainManaged),
            _ => ServiceRequest::ALL
                .into_iter()
                .find(|r| r.as_str() == op)
                .map(RestAction::Service),
        }
    }
}

/// Client for the downstream node health endpoint
pub struct HealthProxy {
    client: reqwest::Client,
    url: String,
    grace_until: Instant,
    grace_over: AtomicBool,
}

impl HealthProxy {
    pub fn new(url: impl Into<String>, grace: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(2)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            grace_until: Instant::now() + grace,
            grace_over: AtomicBool::new(false),
        })
    }

    fn in_grace(&self) -> bool {
        if self.grace_over.load(Ordering::Relaxed) {
            return false;
        }
        if Instant::now() < self.grace_until {
            return true;
        }
        self.grace_over.store(true, Ordering::Relaxed);
        false
    }

    async fn fetch(&self) -> Result<(StatusCode, Option<HeaderValue>, Vec<u8>)> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        let content_type = resp.headers().get(header::CONTENT_TYPE).cloned();
        let body = match resp.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => {
                warn!(error = %e, "Could not read node status");
                Vec::new()
            }
        };
        Ok((status, content_type, body))
    }
}

/// Shared state of the REST handlers
pub struct ApiState {
    pub ctl: Arc<ServiceControl>,
    pub drain: Arc<DrainCoordinator>,
    pub status: InstallStatus,
    pub op_lock: Arc<Mutex<()>>,
    pub health: HealthProxy,
}

fn text(status: StatusCode, body: impl Into<Body>, with_body: bool) -> Response {
    let body = if with_body { body.into() } else { Body::empty() };
    (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

/// GET/HEAD: install progress, then the downstream node health verbatim
#[instrument(skip(state))]
pub async fn node_status(method: Method, State(state): State<Arc<ApiState>>) -> Response {
    let with_body = method != Method::HEAD;
    match state.status.get() {
        InstallState::Unknown => {
            return text(StatusCode::SERVICE_UNAVAILABLE, UNKNOWN_MSG, with_body)
        }
        InstallState::Installing => {
            return text(StatusCode::SERVICE_UNAVAILABLE, INSTALLING_MSG, with_body)
        }
        InstallState::Finished => {}
    }

    match state.health.fetch().await {
        Ok((status, content_type, body)) => {
            let mut resp = if with_body {
                (status, body).into_response()
            } else {
                status.into_response()
            };
            if let Some(ct) = content_type {
                resp.headers_mut().insert(header::CONTENT_TYPE, ct);
            }
            resp
        }
        Err(e) => {
            if state.health.in_grace() {
                debug!(error = %e, "Could not retrieve node status");
            } else {
                warn!(error = %e, "Could not retrieve node status");
            }
            text(StatusCode::SERVICE_UNAVAILABLE, UNKNOWN_MSG, with_body)
        }
    }
}

/// POST /service/{op}
#[instrument(skip(state, uri), fields(op = %op))]
pub async fn service_action(
    State(state): State<Arc<ApiState>>,
    Path(op): Path<String>,
    method: Method,
    uri: OriginalUri,
) -> Response {
    let Some(action) = RestAction::parse(&op) else {
        return invalid_request(method, uri).await;
    };

    let result = {
        let _op = state.op_lock.lock().await;
        run_action(&state, action).await
    };
    match result {
        Ok(()) => {
            let msg = format!("REST action {} completed successfully\n", op.to_uppercase());
            info!("{}", msg.trim_end());
            text(StatusCode::OK, msg, true)
        }
        Err(e) => {
            error!(error = %e, "Error with REST call POST /service/{}", op);
            text(StatusCode::INTERNAL_SERVER_ERROR, FAILURE_MSG, true)
        }
    }
}

async fn run_action(state: &ApiState, action: RestAction) -> Result<()> {
    match action {
        RestAction::Service(req) => state.ctl.apply(req).await,
        RestAction::Drain => state.drain.drain(true).await.map(|_| ()),
        RestAction::DrainManaged => state.drain.drain(false).await.map(|_| ()),
    }
}

/// Anything else: 405 and the connection is closed
pub async fn invalid_request(method: Method, OriginalUri(uri): OriginalUri) -> Response {
    warn!("Ignoring REST call {} {}", method, uri);
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::CONNECTION, "close")],
    )
        .into_response()
}
