//! Hydra gateway: plain HTTP front for captured container logs and hydration progress.
//!
//! `GET /containerLogs/{ns}/{pod}/{container}` streams the matching `current.log` from the
//! snapshot. `GET /status` returns the latest published [`HydrationStatus`]. Any other path gets
//! the same 404 as an unknown log path.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hydra_apply::StatusHandle;
use hydra_core::HydrationStatus;
use hydra_store::LogPathIndex;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared, read-only state behind every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub logs: Arc<LogPathIndex>,
    /// Absent when no reconciler runs (inspect, tests).
    pub status: Option<StatusHandle>,
}

/// Build the router. Tracing middleware is attached by [`serve`] so tests can use the bare router.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/containerLogs/*rest", get(container_logs))
        .route("/status", get(status))
        .fallback(container_logs)
        .with_state(Arc::new(state))
}

/// Bind the listener. Failing to bind is fatal for the caller.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding log gateway on {}", addr))?;
    info!(addr = %addr, "log gateway listening");
    Ok(listener)
}

pub async fn serve(listener: TcpListener, router: Router) -> Result<()> {
    axum::serve(listener, router.layer(TraceLayer::new_for_http())).await.context("log gateway stopped")
}

fn attachment_name(request_path: &str) -> &str {
    request_path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("container")
}

async fn container_logs(State(st): State<Arc<GatewayState>>, uri: Uri) -> Response {
    let path = uri.path();
    let Some(file) = st.logs.resolve(path) else {
        debug!(path, "no log file registered for request path");
        return (StatusCode::NOT_FOUND, format!("unable to find log path from URL: {}", path)).into_response();
    };
    let handle = match tokio::fs::File::open(file).await {
        Ok(f) => f,
        Err(e) => {
            warn!(path, file = %file.display(), error = %e, "unable to open log file");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("unable to open log file: {}", e)).into_response();
        }
    };
    debug!(path, file = %file.display(), "streaming log file");
    let disposition = format!("attachment; filename={}.log", attachment_name(path));
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain".to_string()), (header::CONTENT_DISPOSITION, disposition)],
        Body::from_stream(ReaderStream::new(handle)),
    )
        .into_response()
}

async fn status(State(st): State<Arc<GatewayState>>) -> Response {
    match &st.status {
        Some(h) => {
            let snap: Arc<HydrationStatus> = h.current();
            (StatusCode::OK, Json(snap.as_ref().clone())).into_response()
        }
        None => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "error": "reconciliation is not running" }))).into_response()
        }
    }
}
