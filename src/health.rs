use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::cache::CacheStore;
use crate::cache::store::remove_quietly;
use crate::upstream::Origin;

const UPSTREAM_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache: CheckResult,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: Option<String>) -> Self {
        Self { ok: true, detail }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// The parts of `AppState` the health check needs.
#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<CacheStore>,
    pub origin: Arc<dyn Origin>,
    pub max_bytes: Option<u64>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The cache directory must exist and accept writes.
async fn check_cache(store: &CacheStore, max_bytes: Option<u64>) -> CheckResult {
    let base = store.base_path();
    match tokio::fs::metadata(base).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return CheckResult::unhealthy(format!("{} is not a directory", base.display())),
        Err(e) => return CheckResult::unhealthy(format!("{}: {e}", base.display())),
    }

    let marker = base.join(format!(".healthz-{}.part", uuid::Uuid::new_v4().simple()));
    if let Err(e) = tokio::fs::write(&marker, b"ok").await {
        return CheckResult::unhealthy(format!("cache dir not writable: {e}"));
    }
    remove_quietly(&marker).await;

    let used = store.index().total_bytes();
    let entries = store.index().len();
    let detail = match max_bytes {
        Some(max) => format!(
            "{entries} entries, used {used} / {max} bytes ({:.1}%)",
            store.usage_fraction() * 100.0
        ),
        None => format!("{entries} entries, used {used} bytes"),
    };
    CheckResult::healthy(Some(detail))
}

/// Upstream is reachable if it answers `/` with anything below 500.
async fn check_upstream(origin: &dyn Origin) -> CheckResult {
    match tokio::time::timeout(UPSTREAM_CHECK_TIMEOUT, origin.forward("/")).await {
        Ok(Ok(resp)) if !resp.status.is_server_error() => CheckResult::healthy(None),
        Ok(Ok(resp)) => CheckResult::unhealthy(format!("GET / returned {}", resp.status)),
        Ok(Err(e)) => CheckResult::unhealthy(format!("GET / failed: {e}")),
        Err(_) => CheckResult::unhealthy("GET / timed out"),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.cache.ok {
        // Cannot serve or store anything without the cache dir.
        HealthStatus::Unhealthy
    } else if !checks.upstream.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (cache, upstream) = tokio::join!(
        check_cache(&state.store, state.max_bytes),
        check_upstream(state.origin.as_ref()),
    );

    let checks = HealthChecks { cache, upstream };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
