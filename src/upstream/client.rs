//! reqwest-backed [`Origin`] talking to the mirrored repository.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use axum::http::header::{CONTENT_TYPE, ETAG};
use futures::{StreamExt, TryStreamExt};
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::FetchError;

use super::{Origin, UpstreamResponse};

pub struct UpstreamClient {
    http: reqwest::Client,
    /// Base URL without a trailing slash.
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        Self::with_timeouts(
            &config.base_url,
            &config.user_agent,
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.read_timeout_secs),
        )
    }

    pub fn with_timeouts(
        base_url: &str,
        user_agent: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }
}

#[async_trait::async_trait]
impl Origin for UpstreamClient {
    async fn forward(&self, path_and_query: &str) -> Result<UpstreamResponse, FetchError> {
        let url = self.url_for(path_and_query);
        debug!(%url, "requesting upstream");

        let resp = self.http.get(&url).send().await.map_err(classify)?;

        let status = resp.status();
        let content_type = header_string(resp.headers(), CONTENT_TYPE.as_str());
        let etag = header_string(resp.headers(), ETAG.as_str());
        let content_length = resp.content_length();
        debug!(%url, %status, ?content_length, "upstream responded");

        Ok(UpstreamResponse {
            status,
            content_type,
            etag,
            content_length,
            body: resp.bytes_stream().map_err(classify).boxed(),
        })
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Turn a transport error into the proxy's error vocabulary.
fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::UpstreamTimeout
    } else if err.is_connect() {
        FetchError::UpstreamUnreachable(format!("connect failed: {err}"))
    } else {
        FetchError::UpstreamUnreachable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::upstream::collect_body;

    fn client(base: &str) -> UpstreamClient {
        UpstreamClient::with_timeouts(
            base,
            "pubcache-test",
            Duration::from_secs(2),
            Duration::from_millis(300),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn streams_successful_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/packages/foo/versions/1.0.0.tar.gz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"tarball".to_vec(), "application/gzip")
                    .insert_header("etag", "\"v1\""),
            )
            .expect(1)
            .mount(&server)
            .await;

        let origin = client(&server.uri());
        let resp = origin
            .fetch("/packages/foo/versions/1.0.0.tar.gz")
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type.as_deref(), Some("application/gzip"));
        assert_eq!(resp.etag.as_deref(), Some("\"v1\""));
        assert_eq!(resp.content_length, Some(7));
        assert_eq!(&collect_body(resp.body).await.unwrap()[..], b"tarball");
    }

    #[tokio::test]
    async fn not_found_and_server_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let origin = client(&server.uri());
        assert_eq!(
            origin.fetch("/missing").await.unwrap_err(),
            FetchError::UpstreamNotFound("/missing".into())
        );
        assert_eq!(
            origin.fetch("/broken").await.unwrap_err(),
            FetchError::UpstreamError {
                status: 500,
                path: "/broken".into()
            }
        );

        // forward hands back the raw status instead.
        let raw = origin.forward("/broken").await.unwrap();
        assert_eq!(raw.status, 500);
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let origin = client(&server.uri());
        assert_eq!(
            origin.fetch("/slow").await.unwrap_err(),
            FetchError::UpstreamTimeout
        );
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let origin = client("http://127.0.0.1:1");
        let err = origin.fetch("/anything").await.unwrap_err();
        assert!(matches!(err, FetchError::UpstreamUnreachable(_)), "{err:?}");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let origin = client("https://pub.dev/");
        assert_eq!(origin.base_url(), "https://pub.dev");
        assert_eq!(
            origin.url_for("/api/packages/foo"),
            "https://pub.dev/api/packages/foo"
        );
    }
}
