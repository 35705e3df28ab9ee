//! Live package metadata with `archive_url` rewriting, plus the generic
//! `/api/` pass-through.
//!
//! Metadata is never cached: every request goes upstream so new versions are
//! visible immediately.  Archive URLs in the returned documents are pointed
//! at this proxy so the archives themselves flow through the cache.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{debug, instrument};

use super::artifact::upstream_response;
use super::handler::{AppError, validate_path_segment};
use crate::AppState;
use crate::cache::CacheKey;
use crate::config::Config;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /api/packages/{name}`
#[instrument(skip(state, headers))]
pub async fn handle_package(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    validate_path_segment(&name, "package name")?;
    let base = public_base_url(&state.config, &headers);
    let upstream_path = format!("/api/packages/{name}");

    fetch_and_rewrite(&state, &upstream_path, |doc| {
        rewrite_package_document(doc, &name, &base)
    })
    .await
}

/// `GET /api/packages/{name}/versions/{version}.json`
///
/// Any other file under `versions/` is passed through untouched.
#[instrument(skip(state, method, uri, headers))]
pub async fn handle_package_version(
    State(state): State<Arc<AppState>>,
    Path((name, file)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    validate_path_segment(&name, "package name")?;
    validate_path_segment(&file, "version")?;

    let Some(version) = file.strip_suffix(".json") else {
        let key = CacheKey::from_request(uri.path(), uri.query())?;
        return passthrough(&state, &key, method == Method::HEAD).await;
    };

    let base = public_base_url(&state.config, &headers);
    let upstream_path = format!("/api/packages/{name}/versions/{version}.json");

    fetch_and_rewrite(&state, &upstream_path, |doc| {
        set_archive_url(doc, &name, version, &base)
    })
    .await
}

/// Proxy `key` live and stream whatever upstream answers.
pub(crate) async fn passthrough(
    state: &AppState,
    key: &CacheKey,
    head_only: bool,
) -> Result<Response, AppError> {
    debug!(%key, "live pass-through");
    let upstream = state.origin.forward(&key.as_string()).await?;
    Ok(upstream_response(upstream, None, head_only))
}

async fn fetch_and_rewrite<F>(
    state: &AppState,
    upstream_path: &str,
    rewrite: F,
) -> Result<Response, AppError>
where
    F: FnOnce(&mut Value),
{
    let upstream = state.origin.forward(upstream_path).await?;
    if upstream.status != StatusCode::OK {
        debug!(status = %upstream.status, %upstream_path, "passing through metadata response");
        return Ok(upstream_response(upstream, None, false));
    }

    let body = upstream.into_bytes().await?;
    let mut doc: Value = serde_json::from_slice(&body).map_err(|e| {
        AppError::BadGateway(format!("invalid JSON from upstream for {upstream_path}: {e}"))
    })?;
    rewrite(&mut doc);
    Ok(Json(doc).into_response())
}

// ---------------------------------------------------------------------------
// Rewriting
// ---------------------------------------------------------------------------

/// Point every version listed in a package document at this proxy.
pub fn rewrite_package_document(doc: &mut Value, name: &str, base: &str) {
    if let Some(versions) = doc.get_mut("versions").and_then(Value::as_array_mut) {
        for entry in versions {
            rewrite_listed_version(entry, name, base);
        }
    }
    if let Some(latest) = doc.get_mut("latest") {
        rewrite_listed_version(latest, name, base);
    }
}

fn rewrite_listed_version(entry: &mut Value, name: &str, base: &str) {
    let Some(version) = entry
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        return;
    };
    set_archive_url(entry, name, &version, base);
}

fn set_archive_url(doc: &mut Value, name: &str, version: &str, base: &str) {
    if let Some(obj) = doc.as_object_mut() {
        obj.insert(
            "archive_url".to_string(),
            Value::String(archive_url(base, name, version)),
        );
    }
}

pub fn archive_url(base: &str, name: &str, version: &str) -> String {
    format!("{base}/packages/{name}/versions/{version}.tar.gz")
}

/// Externally visible base URL: configured, else derived from the request.
pub fn public_base_url(config: &Config, headers: &HeaderMap) -> String {
    if let Some(ref url) = config.server.public_url {
        return url.trim_end_matches('/').to_string();
    }

    let proto = header_value(headers, "x-forwarded-proto").unwrap_or("http");
    match header_value(headers, header::HOST.as_str()) {
        Some(host) => format!("{proto}://{host}"),
        None => format!("{proto}://{}:{}", config.server.host, config.server.port),
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::error::FetchError;
    use crate::http::handler::create_router;
    use crate::testing::{FakeOrigin, config_in, state_with};

    const PACKAGE_DOC: &[u8] = br#"{
        "name": "foo",
        "latest": {"version": "2.0.0", "archive_url": "https://pub.dev/packages/foo/versions/2.0.0.tar.gz"},
        "versions": [
            {"version": "1.0.0", "archive_url": "https://pub.dev/packages/foo/versions/1.0.0.tar.gz"},
            {"version": "2.0.0", "archive_url": "https://pub.dev/packages/foo/versions/2.0.0.tar.gz"}
        ]
    }"#;

    async fn app_with(config: Config, origin: Arc<FakeOrigin>) -> Router {
        create_router(Arc::new(state_with(config, origin).await))
    }

    async fn get(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json_of(resp: Response) -> Value {
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn rewrites_versions_and_latest() {
        let mut doc: Value = serde_json::from_slice(PACKAGE_DOC).unwrap();
        rewrite_package_document(&mut doc, "foo", "http://proxy:8080");
        assert_eq!(
            doc["versions"][0]["archive_url"],
            "http://proxy:8080/packages/foo/versions/1.0.0.tar.gz"
        );
        assert_eq!(
            doc["versions"][1]["archive_url"],
            "http://proxy:8080/packages/foo/versions/2.0.0.tar.gz"
        );
        assert_eq!(
            doc["latest"]["archive_url"],
            "http://proxy:8080/packages/foo/versions/2.0.0.tar.gz"
        );
    }

    #[test]
    fn entries_without_version_are_left_alone() {
        let mut doc = json!({"versions": [{"pubspec": {}}]});
        rewrite_package_document(&mut doc, "foo", "http://proxy");
        assert!(doc["versions"][0].get("archive_url").is_none());
    }

    #[test]
    fn base_url_prefers_config_then_host_header() {
        let mut config = Config::default();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "mirror.local:8080".parse().unwrap());
        assert_eq!(public_base_url(&config, &headers), "http://mirror.local:8080");

        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(public_base_url(&config, &headers), "https://mirror.local:8080");

        config.server.public_url = Some("https://pub.internal/".into());
        assert_eq!(public_base_url(&config, &headers), "https://pub.internal");

        config.server.public_url = None;
        assert_eq!(public_base_url(&config, &HeaderMap::new()), "http://0.0.0.0:8080");
    }

    #[tokio::test]
    async fn package_metadata_is_live_and_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("/api/packages/foo", StatusCode::OK, PACKAGE_DOC, "application/json");
        let app = app_with(config_in(tmp.path()), Arc::clone(&origin)).await;

        for _ in 0..2 {
            let resp = get(&app, "/api/packages/foo").await;
            assert_eq!(resp.status(), StatusCode::OK);
            let doc = json_of(resp).await;
            assert_eq!(
                doc["versions"][0]["archive_url"],
                "http://proxy.test/packages/foo/versions/1.0.0.tar.gz"
            );
        }
        assert_eq!(origin.calls("/api/packages/foo"), 2);
    }

    #[tokio::test]
    async fn version_metadata_is_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::new());
        origin.respond(
            "/api/packages/foo/versions/1.0.0.json",
            StatusCode::OK,
            br#"{"version": "1.0.0", "archive_url": "https://pub.dev/x.tar.gz"}"#,
            "application/json",
        );
        let app = app_with(config_in(tmp.path()), origin).await;

        let resp = get(&app, "/api/packages/foo/versions/1.0.0.json").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            json_of(resp).await["archive_url"],
            "http://proxy.test/packages/foo/versions/1.0.0.tar.gz"
        );
    }

    #[tokio::test]
    async fn non_ok_metadata_passes_through() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::new());
        origin.respond(
            "/api/packages/nope",
            StatusCode::NOT_FOUND,
            br#"{"error": "not found"}"#,
            "application/json",
        );
        let app = app_with(config_in(tmp.path()), origin).await;

        let resp = get(&app, "/api/packages/nope").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_of(resp).await["error"], "not found");
    }

    #[tokio::test]
    async fn invalid_json_is_bad_gateway() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("/api/packages/foo", StatusCode::OK, b"<html>", "text/html");
        let app = app_with(config_in(tmp.path()), origin).await;

        let resp = get(&app, "/api/packages/foo").await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::new());
        origin.fail(
            "/api/packages/foo",
            FetchError::UpstreamUnreachable("refused".into()),
        );
        let app = app_with(config_in(tmp.path()), origin).await;

        let resp = get(&app, "/api/packages/foo").await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn other_api_paths_pass_through_uncached() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("/api/search?q=http", StatusCode::OK, b"{}", "application/json");
        let app = app_with(config_in(tmp.path()), Arc::clone(&origin)).await;

        for _ in 0..2 {
            let resp = get(&app, "/api/search?q=http").await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert!(resp.headers().get(crate::http::handler::X_CACHE).is_none());
        }
        assert_eq!(origin.calls("/api/search?q=http"), 2);
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }
}
