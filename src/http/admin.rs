//! Operator endpoints: purge cached archives, prefetch an archive.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::handler::{AppError, validate_path_segment};
use crate::AppState;
use crate::cache::CacheKey;
use crate::coordination::Artifact;
use crate::error::FetchError;

#[derive(Debug, Serialize)]
struct AdminResponse {
    status: &'static str,
    package: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    evicted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl AdminResponse {
    fn new(status: &'static str, package: &str, version: Option<&str>) -> Self {
        Self {
            status,
            package: package.to_string(),
            version: version.map(str::to_owned),
            evicted: None,
            path: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Purge
// ---------------------------------------------------------------------------

/// `GET|POST /admin/purge/{name}`
#[instrument(skip(state))]
pub async fn handle_purge_package(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    validate_path_segment(&name, "package name")?;
    Ok(purge(&state, &name, None).await)
}

/// `GET|POST /admin/purge/{name}/{version}`
#[instrument(skip(state))]
pub async fn handle_purge_version(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Response, AppError> {
    validate_path_segment(&name, "package name")?;
    validate_path_segment(&version, "version")?;
    Ok(purge(&state, &name, Some(&version)).await)
}

async fn purge(state: &AppState, name: &str, version: Option<&str>) -> Response {
    let evicted = match version {
        Some(v) => match CacheKey::archive(name, v) {
            Ok(key) => {
                state.coordinator.negative().remove(&key);
                usize::from(state.store.evict(&key).await)
            }
            Err(_) => 0,
        },
        None => {
            state
                .store
                .evict_if(|key| key.archive_ref().is_some_and(|archive| archive.name == name))
                .await
        }
    };

    if evicted == 0 {
        return (
            StatusCode::NOT_FOUND,
            Json(AdminResponse::new("not_found", name, version)),
        )
            .into_response();
    }

    state
        .metrics
        .metrics
        .cache_evictions
        .inc_by(evicted as u64);
    info!(package = %name, ?version, evicted, "purged cached archives");

    let mut body = AdminResponse::new("purged", name, version);
    body.evicted = Some(evicted);
    (StatusCode::OK, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Prefetch
// ---------------------------------------------------------------------------

/// `POST /admin/prefetch/{name}/{version}`
///
/// Runs the archive through the normal fetch path so a concurrent client
/// request for the same archive shares the download.
#[instrument(skip(state))]
pub async fn handle_prefetch(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Response, AppError> {
    validate_path_segment(&name, "package name")?;
    validate_path_segment(&version, "version")?;
    let key = CacheKey::archive(&name, &version)?;

    if let Some(open) = state.store.lookup(&key).await {
        return Ok(cached_response(&name, &version, &open.entry.path));
    }

    let origin = Arc::clone(&state.origin);
    let upstream_path = key.as_string();
    let result = state
        .coordinator
        .get_or_fetch(&key, move || async move { origin.fetch(&upstream_path).await })
        .await;

    match result {
        Ok(Artifact::Cached(entry)) => {
            info!(%key, size = entry.size, "prefetched archive");
            Ok(cached_response(&name, &version, &entry.path))
        }
        Ok(Artifact::Uncached(_)) => Ok(error_response(
            &name,
            &version,
            "cache directory is not writable".to_string(),
        )),
        Err(FetchError::CacheWrite(e)) => {
            warn!(%key, error = %e, "prefetch could not persist archive");
            Ok(error_response(&name, &version, e))
        }
        Err(e) => Err(e.into()),
    }
}

fn cached_response(name: &str, version: &str, path: &std::path::Path) -> Response {
    let mut body = AdminResponse::new("cached", name, Some(version));
    body.path = Some(path.display().to_string());
    (StatusCode::OK, Json(body)).into_response()
}

fn error_response(name: &str, version: &str, error: String) -> Response {
    let mut body = AdminResponse::new("error", name, Some(version));
    body.error = Some(error);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
