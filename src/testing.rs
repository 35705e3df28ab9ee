//! Fixtures shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;

use crate::AppState;
use crate::config::Config;
use crate::error::FetchError;
use crate::upstream::{Origin, UpstreamResponse};

/// Build an in-memory upstream response.
pub fn response(status: StatusCode, body: &'static [u8], content_type: Option<&str>) -> UpstreamResponse {
    UpstreamResponse {
        status,
        content_type: content_type.map(str::to_owned),
        etag: None,
        content_length: Some(body.len() as u64),
        body: futures::stream::iter(vec![Ok(Bytes::from_static(body))]).boxed(),
    }
}

#[derive(Clone)]
enum Reply {
    Respond {
        status: StatusCode,
        body: &'static [u8],
        content_type: Option<String>,
    },
    Fail(FetchError),
}

/// Scriptable [`Origin`] that counts calls per path.
#[derive(Default)]
pub struct FakeOrigin {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    delay: Duration,
}

impl FakeOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn respond(&self, path: &str, status: StatusCode, body: &'static [u8], content_type: &str) {
        self.replies.lock().unwrap().insert(
            path.to_string(),
            Reply::Respond {
                status,
                body,
                content_type: Some(content_type.to_string()),
            },
        );
    }

    pub fn fail(&self, path: &str, err: FetchError) {
        self.replies
            .lock()
            .unwrap()
            .insert(path.to_string(), Reply::Fail(err));
    }

    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Origin for FakeOrigin {
    async fn forward(&self, path_and_query: &str) -> Result<UpstreamResponse, FetchError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(path_and_query.to_string())
            .or_default() += 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = self.replies.lock().unwrap().get(path_and_query).cloned();
        match reply {
            Some(Reply::Respond {
                status,
                body,
                content_type,
            }) => Ok(response(status, body, content_type.as_deref())),
            Some(Reply::Fail(err)) => Err(err),
            None => Ok(response(StatusCode::NOT_FOUND, b"not found", Some("text/plain"))),
        }
    }
}

/// Config rooted at `dir` with everything else defaulted.
pub fn config_in(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.path = dir.to_string_lossy().into_owned();
    config.server.public_url = Some("http://proxy.test".to_string());
    config
}

/// Application state over a temp cache dir and a fake origin.
pub async fn state_with(config: Config, origin: Arc<FakeOrigin>) -> AppState {
    AppState::new(config, origin).await.unwrap()
}
