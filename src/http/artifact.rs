//! Artifact serving: cache hit, coordinated miss, or uncached bypass.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use super::handler::{AppError, X_CACHE, build_response, set_header};
use crate::AppState;
use crate::cache::{CacheKey, OpenEntry};
use crate::coordination::{Artifact, SpoolBody, Spooled};
use crate::error::FetchError;
use crate::metrics::LookupResult;
use crate::upstream::UpstreamResponse;

const HIT: &str = "HIT";
const MISS: &str = "MISS";
const BYPASS: &str = "BYPASS";

/// Catch-all handler for every path without a dedicated route.
///
/// GET and HEAD only.  Pass-through prefixes are proxied live; everything
/// else is a cacheable artifact.
#[instrument(skip(state, uri), fields(path = %uri.path()))]
pub async fn handle_fallback(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
) -> Result<Response, AppError> {
    let head_only = match method {
        Method::GET => false,
        Method::HEAD => true,
        _ => {
            return Ok((
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, "GET, HEAD")],
                "only GET and HEAD are supported",
            )
                .into_response());
        }
    };

    let key = CacheKey::from_request(uri.path(), uri.query())?;

    if state.config.cache.is_passthrough(key.path()) {
        return super::metadata::passthrough(&state, &key, head_only).await;
    }
    serve_artifact(&state, &key, head_only).await
}

/// Serve `key` from the cache, fetching it through the coordinator on a miss.
///
/// Exactly one lookup outcome is recorded per request.
pub(crate) async fn serve_artifact(
    state: &Arc<AppState>,
    key: &CacheKey,
    head_only: bool,
) -> Result<Response, AppError> {
    let metrics = &state.metrics.metrics;

    if let Some(open) = state.store.lookup(key).await {
        metrics.record_lookup(LookupResult::Hit);
        debug!(%key, "cache hit");
        metrics.record_served(open.entry.size, head_only);
        return Ok(entry_response(open, HIT, head_only));
    }
    info!(%key, "cache miss, fetching from upstream");

    let origin = Arc::clone(&state.origin);
    let upstream_path = key.as_string();
    let result = state
        .coordinator
        .get_or_fetch(key, move || async move { origin.fetch(&upstream_path).await })
        .await;

    let (outcome, response) = match result {
        Ok(Artifact::Cached(entry)) => match entry.open().await {
            Ok(file) => {
                metrics.record_served(entry.size, head_only);
                (
                    LookupResult::Miss,
                    Ok(entry_response(OpenEntry { entry, file }, MISS, head_only)),
                )
            }
            Err(e) => {
                // Evicted between publish and open.
                warn!(%key, error = %e, "cached entry disappeared, bypassing cache");
                (LookupResult::Bypass, bypass(state, key, head_only).await)
            }
        },
        Ok(Artifact::Uncached(spooled)) => {
            metrics.record_served(spooled.size, head_only);
            (
                LookupResult::Bypass,
                spooled_response(spooled, head_only).await,
            )
        }
        Err(e) => (LookupResult::Miss, Err(e.into())),
    };
    metrics.record_lookup(outcome);
    response
}

/// Fetch `key` straight from upstream without touching the cache.
async fn bypass(state: &AppState, key: &CacheKey, head_only: bool) -> Result<Response, AppError> {
    let upstream = state.origin.fetch(&key.as_string()).await?;
    Ok(upstream_response(upstream, Some(BYPASS), head_only))
}

// ---------------------------------------------------------------------------
// Response builders
// ---------------------------------------------------------------------------

fn entry_response(open: OpenEntry, cache_status: &'static str, head_only: bool) -> Response {
    let OpenEntry { entry, file } = open;

    let mut headers = HeaderMap::new();
    set_header(&mut headers, header::CONTENT_TYPE, &entry.content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.size));
    if let Some(ref etag) = entry.etag {
        set_header(&mut headers, header::ETAG, etag);
    }
    headers.insert(X_CACHE, HeaderValue::from_static(cache_status));

    let body = if head_only {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(file))
    };
    build_response(StatusCode::OK, headers, body, head_only)
}

/// Serve a body the cache could not keep.
async fn spooled_response(spooled: Spooled, head_only: bool) -> Result<Response, AppError> {
    let mut headers = HeaderMap::new();
    set_header(&mut headers, header::CONTENT_TYPE, &spooled.content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(spooled.size));
    if let Some(ref etag) = spooled.etag {
        set_header(&mut headers, header::ETAG, etag);
    }
    headers.insert(X_CACHE, HeaderValue::from_static(BYPASS));

    let body = match spooled.body {
        _ if head_only => Body::empty(),
        SpoolBody::Memory(bytes) => Body::from(bytes),
        SpoolBody::File(path) => {
            let file = tokio::fs::File::open(&**path).await.map_err(|e| {
                FetchError::CacheWrite(format!("open spooled body {}: {e}", path.display()))
            })?;
            // The stream keeps the temp file alive until the body is sent.
            Body::from_stream(ReaderStream::new(file).map(move |chunk| {
                let _spool = &path;
                chunk
            }))
        }
    };
    Ok(build_response(StatusCode::OK, headers, body, head_only))
}

/// Stream an upstream response to the client with its status and headers.
pub(crate) fn upstream_response(
    upstream: UpstreamResponse,
    cache_status: Option<&'static str>,
    head_only: bool,
) -> Response {
    let mut headers = HeaderMap::new();
    let content_type = upstream
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    set_header(&mut headers, header::CONTENT_TYPE, content_type);
    if let Some(len) = upstream.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    if let Some(ref etag) = upstream.etag {
        set_header(&mut headers, header::ETAG, etag);
    }
    if let Some(status) = cache_status {
        headers.insert(X_CACHE, HeaderValue::from_static(status));
    }
    build_response(
        upstream.status,
        headers,
        Body::from_stream(upstream.body),
        head_only,
    )
}
