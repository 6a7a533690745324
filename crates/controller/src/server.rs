//! HTTP surface of a running controller: probes, status, reload and clear.

use crate::controller::{RecoveryController, ReloadSummary};
use crate::report::StatusReport;
use crate::resource::ResourceKey;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

pub type AppState = Arc<RecoveryController>;

/// Body of `POST /clear`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearRequest {
    /// `Kind/namespace/name` or `Kind/name`
    pub key: String,
}

/// Response of `POST /clear`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearResponse {
    pub key: String,
    pub cleared: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(status))
        .route("/reload", post(reload))
        .route("/clear", post(clear))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(60))),
        )
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Status server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "recovery-controller",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.is_running() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "patterns": state.store().version(),
    })))
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.status_report())
}

async fn reload(
    State(state): State<AppState>,
) -> Result<Json<ReloadSummary>, (StatusCode, Json<Value>)> {
    state.reload().await.map(Json).map_err(|e| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": e.to_string(),
                "category": e.category(),
                "active_version": state.store().version(),
            })),
        )
    })
}

async fn clear(
    State(state): State<AppState>,
    Json(request): Json<ClearRequest>,
) -> Result<Json<ClearResponse>, (StatusCode, Json<Value>)> {
    let Some(key) = ResourceKey::parse(&request.key) else {
        warn!(key = %request.key, "Rejecting malformed resource key");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "expected Kind/namespace/name or Kind/name" })),
        ));
    };
    let cleared = state.clear(&key);
    Ok(Json(ClearResponse {
        key: key.to_string(),
        cleared,
    }))
}
