//! HTTP surface of the gateway.

mod handlers;

use crate::engine::ConnectionState;
use crate::error::GatewayError;
use crate::lifecycle::LifecycleManager;
use crate::send::MessageSender;
use crate::session::AuthPhase;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub sender: Arc<MessageSender>,
    pub api_key: Option<Arc<str>>,
    pub qr_wait: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/qr", get(handlers::qr))
        .route("/qr/wait", get(handlers::qr_wait))
        .route("/send-text", post(handlers::send_text))
        .route("/send-group", post(handlers::send_group))
        .route("/send-media", post(handlers::send_media))
        .route("/warmup", post(handlers::warmup))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Nests `router` under `prefix`. An empty prefix or `/` mounts at the root.
pub fn mount(router: Router, prefix: &str) -> Router {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        router
    } else {
        Router::new().nest(&format!("/{trimmed}"), router)
    }
}

pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(target: "Gateway/Http", "Listening on {addr}");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = state.api_key.as_deref() {
        let provided = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected) {
            return GatewayError::Unauthorized.into_response();
        }
    }
    next.run(request).await
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        target: "Gateway/Http",
        "{method} {uri} {} {:.1}ms",
        response.status().as_u16(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    response
}

/// Lets the request through only when the session is ready and the engine
/// reports `CONNECTED`.
async fn ensure_ready(state: &AppState) -> Result<(), GatewayError> {
    let probed = probe_engine_state(&state.lifecycle).await;
    let phase = state.lifecycle.tracker().phase();
    if phase == AuthPhase::Ready && probed == Some(ConnectionState::Connected) {
        return Ok(());
    }
    let label = probed
        .map(|s| s.as_str().to_string())
        .or_else(|| state.lifecycle.tracker().snapshot().engine_state);
    Err(GatewayError::NotReady(label))
}

/// Current engine state, or `None` when there is no handle or the probe fails.
async fn probe_engine_state(lifecycle: &LifecycleManager) -> Option<ConnectionState> {
    let engine = lifecycle.engine().await.ok()?;
    engine.get_state().await.ok().flatten()
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotReady(_) | GatewayError::ConnectionNotReady { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(target: "Gateway/Http", "Request failed: {self}");
        }
        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}
