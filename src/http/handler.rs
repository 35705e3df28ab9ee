//! Main axum router, shared response helpers and the error type.
//!
//! Routes:
//! - `GET  /api/packages/{name}`                          - Live package metadata, `archive_url` rewritten
//! - `GET  /api/packages/{name}/versions/{version}.json`  - Live version metadata, `archive_url` rewritten
//! - `GET|POST /admin/purge/{name}[/{version}]`           - Drop cached archives
//! - `POST /admin/prefetch/{name}/{version}`              - Warm the cache for one archive
//! - `GET  /healthz`                                      - Health check
//! - `GET  /metrics`                                      - Prometheus metrics
//! - anything else                                        - Cached artifact (GET/HEAD) or `/api/` pass-through

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::{error, warn};

use crate::AppState;
use crate::error::FetchError;

/// Response header reporting how an artifact request was served.
pub const X_CACHE: &str = "x-cache";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Live metadata with archive_url rewriting
        .route(
            "/api/packages/{name}",
            get(super::metadata::handle_package),
        )
        .route(
            "/api/packages/{name}/versions/{file}",
            get(super::metadata::handle_package_version),
        )
        // Admin
        .route(
            "/admin/purge/{name}",
            get(super::admin::handle_purge_package).post(super::admin::handle_purge_package),
        )
        .route(
            "/admin/purge/{name}/{version}",
            get(super::admin::handle_purge_version).post(super::admin::handle_purge_version),
        )
        .route(
            "/admin/prefetch/{name}/{version}",
            post(super::admin::handle_prefetch),
        )
        // Health, metrics
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        // Artifacts and generic pass-through
        .fallback(super::artifact::handle_fallback)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        store: Arc::clone(&state.store),
        origin: Arc::clone(&state.origin),
        max_bytes: state.config.storage.max_bytes,
    };
    crate::health::health_handler(axum::extract::State(health_state)).await
}

/// `GET /metrics`
///
/// Cache gauges are sampled from the store at scrape time.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let metrics = &state.metrics.metrics;
    let index = state.store.index();
    metrics
        .cache_size_bytes
        .set(i64::try_from(index.total_bytes()).unwrap_or(i64::MAX));
    metrics
        .cache_entries
        .set(i64::try_from(index.len()).unwrap_or(i64::MAX));

    let buf = state
        .metrics
        .render()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// Insert `value` under `name`, skipping values that are not valid header
/// text (e.g. an upstream ETag with control characters).
pub(crate) fn set_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => warn!(header = %name, value, "dropping invalid header value"),
    }
}

/// Build a response from its parts, leaving the body empty for HEAD.
pub(crate) fn build_response(
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
    head_only: bool,
) -> Response {
    let body = if head_only { Body::empty() } else { body };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Reject path segments that could escape the cache directory.
pub(crate) fn validate_path_segment(segment: &str, label: &str) -> Result<(), AppError> {
    if segment.is_empty() {
        return Err(AppError::BadRequest(format!("{label} must not be empty")));
    }
    if segment.contains('/')
        || segment.contains('\\')
        || segment.contains('\0')
        || segment == ".."
        || segment == "."
    {
        return Err(AppError::BadRequest(format!(
            "invalid {label}: {segment:?}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// A fetch failed; the status follows the error kind.
    Fetch(FetchError),
    /// The request cannot be served as asked.
    BadRequest(String),
    /// Upstream answered with something we could not use.
    BadGateway(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Fetch(err) => {
                let status = err.status_code();
                if status.is_server_error() {
                    warn!(error = %err, %status, "request failed");
                }
                (status, err.to_string()).into_response()
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::BadGateway(msg) => {
                warn!(%msg, "bad gateway");
                (StatusCode::BAD_GATEWAY, msg).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::InvalidRequest(msg) => AppError::BadRequest(msg),
            other => AppError::Fetch(other),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
