//! Admin and load-test HTTP API.
//!
//! - GET  /health
//! - GET  /metrics
//! - GET  /v1/cache/stats
//! - POST /v1/cache/invalidate
//! - GET  /v1/jobs/{id}
//! - GET  /v1/lookup

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::entry::CacheKey;
use crate::config::Config;
use crate::error::CacheError;
use crate::jobs::job::{fetch_fn, JobId, JobSnapshot};
use crate::metrics::CacheMetrics;
use crate::orchestrator::{CacheOrchestrator, OrchestratorStats};

/// Values served by the binary: whatever JSON the upstream returns.
pub type JsonCache = CacheOrchestrator<serde_json::Value>;

/// Application state shared across handlers.
pub struct AppState {
    pub cache: Arc<JsonCache>,
    pub config: Arc<Config>,
    pub metrics: Arc<CacheMetrics>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/invalidate", post(invalidate))
        .route("/v1/jobs/{id}", get(job_status))
        .route("/v1/lookup", get(lookup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: OrchestratorStats,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    /// Remove keys whose category (text before the first `:`) matches.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

#[derive(Debug, Deserialize)]
pub struct LookupParams {
    pub identity: String,
    pub key: String,
    /// Make the synthetic upstream fail.
    #[serde(default)]
    pub fail: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResponse {
    pub request_id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub latency_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: String,
    pub message: String,
}

/// HTTP status for a core error.
pub fn status_for(err: &CacheError) -> StatusCode {
    match err {
        CacheError::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
        CacheError::QueueFull { .. } | CacheError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        CacheError::AwaitTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        CacheError::FetchFailed { .. } | CacheError::StoreUnavailable { .. } => {
            StatusCode::BAD_GATEWAY
        }
    }
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: state.cache.stats(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<OrchestratorStats> {
    Json(state.cache.stats())
}

async fn invalidate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, StatusCode> {
    let removed = match (req.category, req.prefix) {
        (Some(category), None) => state.cache.invalidate(|k| k.category() == category).await,
        (None, Some(prefix)) => {
            state
                .cache
                .invalidate(|k| k.as_str().starts_with(prefix.as_str()))
                .await
        }
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    Ok(Json(InvalidateResponse { removed }))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobSnapshot>, StatusCode> {
    state
        .cache
        .job_status(id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn lookup(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LookupParams>,
) -> Response {
    let request_id = format!("req-{}", Uuid::new_v4());
    let started = Instant::now();
    let key = CacheKey::new(&params.key);

    let latency = Duration::from_millis(state.config.server.synthetic_upstream_latency_ms);
    let fail = params.fail;
    let upstream_key = params.key.clone();
    let fetch = fetch_fn(move || synthetic_upstream(upstream_key, latency, fail));

    match state.cache.get(&params.identity, &key, fetch).await {
        Ok(value) => Json(LookupResponse {
            request_id,
            key: params.key,
            value,
            latency_ms: started.elapsed().as_millis() as u64,
        })
        .into_response(),
        Err(e) => {
            warn!(
                request_id = %request_id,
                identity = %params.identity,
                key = %key,
                error = %e,
                "Lookup failed"
            );
            let body = ErrorResponse {
                request_id,
                error: error_kind(&e).to_string(),
                message: e.user_message().to_string(),
            };
            (status_for(&e), Json(body)).into_response()
        }
    }
}

fn error_kind(err: &CacheError) -> &'static str {
    match err {
        CacheError::AdmissionDenied { .. } => "admission_denied",
        CacheError::QueueFull { .. } => "queue_full",
        CacheError::AwaitTimeout { .. } => "await_timeout",
        CacheError::FetchFailed { .. } => "fetch_failed",
        CacheError::StoreUnavailable { .. } => "store_unavailable",
        CacheError::ShuttingDown => "shutting_down",
    }
}

/// Stand-in for a slow upstream data source.
async fn synthetic_upstream(
    key: String,
    latency: Duration,
    fail: bool,
) -> Result<serde_json::Value, std::io::Error> {
    tokio::time::sleep(latency).await;
    if fail {
        return Err(std::io::Error::other(format!("upstream error for {key}")));
    }
    let fetched_at_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    info!(key = %key, "Synthetic upstream fetch");
    Ok(json!({ "key": key, "fetched_at_ms": fetched_at_ms }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let denied = CacheError::AdmissionDenied {
            identity: "u".into(),
        };
        assert_eq!(status_for(&denied), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            status_for(&CacheError::QueueFull { capacity: 1 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CacheError::AwaitTimeout {
                job_id: 1,
                waited: Duration::from_millis(5)
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(error_kind(&CacheError::ShuttingDown), "shutting_down");
    }

    #[tokio::test]
    async fn test_synthetic_upstream() {
        let ok = synthetic_upstream("k".into(), Duration::ZERO, false).await.unwrap();
        assert_eq!(ok["key"], "k");
        assert!(synthetic_upstream("k".into(), Duration::ZERO, true).await.is_err());
    }
}
