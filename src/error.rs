//! Error kinds shared by the cache, the fetch coordinator and the upstream
//! client.
//!
//! [`FetchError`] is `Clone` because a single in-flight fetch hands the same
//! outcome to every waiter.

use axum::http::StatusCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Upstream answered 404.
    #[error("upstream has no resource at {0}")]
    UpstreamNotFound(String),
    /// Upstream answered with any other non-2xx status.
    #[error("upstream returned {status} for {path}")]
    UpstreamError { status: u16, path: String },
    /// Connect or read timeout against upstream.
    #[error("upstream timed out")]
    UpstreamTimeout,
    /// Connection failure, or the body stream broke off.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    /// The artifact could not be persisted (disk full, permissions, ...).
    #[error("cache write failed: {0}")]
    CacheWrite(String),
    /// The request path cannot be mapped to an upstream resource.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Client-facing status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UpstreamNotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamError { .. } | Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::CacheWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}
