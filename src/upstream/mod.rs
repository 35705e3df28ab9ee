//! Upstream repository access.
//!
//! [`Origin`] is the seam between the proxy and the mirrored repository.
//! The production implementation is [`client::UpstreamClient`]; tests plug
//! in their own origins.

pub mod client;

use std::fmt;

use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::cache::EntryMetadata;
use crate::error::FetchError;

pub use client::UpstreamClient;

/// Streamed upstream body.  Stream errors are already classified.
pub type BodyStream = BoxStream<'static, Result<Bytes, FetchError>>;

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Status, relevant headers and streaming body of an upstream response.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl UpstreamResponse {
    /// Metadata to persist alongside the body when it is cached.
    pub fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            content_type: self.content_type.clone(),
            etag: self.etag.clone(),
            expected_len: self.content_length,
        }
    }

    /// Buffer the whole body in memory.
    pub async fn into_bytes(self) -> Result<Bytes, FetchError> {
        collect_body(self.body).await
    }
}

/// Drain a body stream into a single buffer.
pub async fn collect_body(mut body: BodyStream) -> Result<Bytes, FetchError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Something that can serve upstream resources by path.
#[async_trait::async_trait]
pub trait Origin: Send + Sync {
    /// Issue a GET for `path_and_query` and return whatever upstream said,
    /// including non-2xx statuses.
    async fn forward(&self, path_and_query: &str) -> Result<UpstreamResponse, FetchError>;

    /// Like [`Origin::forward`], but only a 2xx response is `Ok`.
    async fn fetch(&self, path_and_query: &str) -> Result<UpstreamResponse, FetchError> {
        let response = self.forward(path_and_query).await?;
        check_status(response, path_and_query)
    }
}

/// Map a non-2xx response to the matching [`FetchError`].
pub fn check_status(
    response: UpstreamResponse,
    path_and_query: &str,
) -> Result<UpstreamResponse, FetchError> {
    let status = response.status;
    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::NOT_FOUND {
        Err(FetchError::UpstreamNotFound(path_and_query.to_string()))
    } else {
        Err(FetchError::UpstreamError {
            status: status.as_u16(),
            path: path_and_query.to_string(),
        })
    }
}
