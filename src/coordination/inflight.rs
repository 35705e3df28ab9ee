//! Per-key deduplication of upstream fetches.
//!
//! The first request for a missing key spawns a fetch task and registers a
//! shared handle to it; later requests for the same key await that handle
//! instead of contacting upstream.  The task runs to completion even if
//! every requester disconnects, so a started download still lands in the
//! cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::cache::entry::content_type_for_ext;
use crate::cache::store::{FailedWrite, WriteFailure};
use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::error::FetchError;
use crate::metrics::Metrics;
use crate::upstream::{BodyStream, UpstreamResponse};

use super::NegativeCache;
use super::spool::{MemorySpool, SpoolBody, Spooled};

/// Outcome of a successful fetch.
#[derive(Debug, Clone)]
pub enum Artifact {
    /// Published to the store; serve it from disk.
    Cached(CacheEntry),
    /// The store refused the body; serve the spooled copy.
    Uncached(Spooled),
}

type SharedFetch = Shared<BoxFuture<'static, Result<Artifact, FetchError>>>;

pub struct FetchCoordinator {
    store: Arc<CacheStore>,
    in_flight: Mutex<HashMap<CacheKey, SharedFetch>>,
    negative: NegativeCache,
    metrics: Arc<Metrics>,
    /// Memory ceiling for a body the store could not take.
    spool_limit: u64,
}

impl FetchCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        negative: NegativeCache,
        metrics: Arc<Metrics>,
        spool_limit: u64,
    ) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashMap::new()),
            negative,
            metrics,
            spool_limit,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn negative(&self) -> &NegativeCache {
        &self.negative
    }

    /// Number of keys with a fetch currently running.
    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, SharedFetch>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the artifact for `key`, fetching it with `fetch` unless a fetch
    /// for the same key is already running, in which case its result is
    /// shared.
    pub async fn get_or_fetch<F, Fut>(
        self: &Arc<Self>,
        key: &CacheKey,
        fetch: F,
    ) -> Result<Artifact, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<UpstreamResponse, FetchError>> + Send + 'static,
    {
        if self.negative.contains(key) {
            self.metrics.negative_cache_hits.inc();
            debug!(%key, "answering from negative cache");
            return Err(FetchError::UpstreamNotFound(key.as_string()));
        }

        let shared = {
            let mut in_flight = self.lock();
            if let Some(existing) = in_flight.get(key) {
                self.metrics.coalesced_requests.inc();
                debug!(%key, "joining in-flight fetch");
                existing.clone()
            } else {
                // Spawned and registered under the lock: the task's cleanup
                // cannot run before the handle is in the map.
                let this = Arc::clone(self);
                let task_key = key.clone();
                let handle = tokio::spawn(async move { this.run_fetch(task_key, fetch).await });
                let shared = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(FetchError::UpstreamUnreachable(format!(
                            "fetch task failed: {e}"
                        ))),
                    }
                }
                .boxed()
                .shared();
                in_flight.insert(key.clone(), shared.clone());
                shared
            }
        };

        shared.await
    }

    async fn run_fetch<F, Fut>(self: Arc<Self>, key: CacheKey, fetch: F) -> Result<Artifact, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UpstreamResponse, FetchError>>,
    {
        let _guard = InFlightGuard {
            coordinator: &self,
            key: &key,
        };

        // Another task may have published the key since the caller's lookup.
        if let Some(open) = self.store.lookup(&key).await {
            debug!(%key, "entry published while waiting, skipping upstream");
            return Ok(Artifact::Cached(open.entry));
        }

        let started = Instant::now();
        let result = self.fetch_and_store(&key, fetch).await;
        self.metrics
            .upstream_fetch_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        self.metrics.record_fetch(result.as_ref().map(|_| ()));

        match &result {
            Err(FetchError::UpstreamNotFound(_)) => self.negative.insert(key.clone()),
            Err(FetchError::CacheWrite(e)) => {
                warn!(%key, error = %e, "artifact could neither be cached nor spooled");
            }
            Err(e) => warn!(%key, error = %e, "upstream fetch failed"),
            Ok(_) => {}
        }
        result
    }

    async fn fetch_and_store<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<Artifact, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UpstreamResponse, FetchError>>,
    {
        let response = fetch().await?;
        let meta = response.metadata();
        let content_type = response
            .content_type
            .clone()
            .unwrap_or_else(|| content_type_for_ext(key.extension()).to_string());
        let etag = response.etag.clone();
        let expected_len = response.content_length;
        let mut body = response.body;

        let failed = match self.store.begin_put(key, meta).await {
            Ok(pending) => match self.store.write_or_salvage(pending, &mut body).await {
                Ok(entry) => {
                    info!(%key, size = entry.size, "artifact cached");
                    let evicted = self.store.enforce_limits(&entry.path).await;
                    if evicted > 0 {
                        self.metrics.cache_evictions.inc_by(evicted as u64);
                    }
                    return Ok(Artifact::Cached(entry));
                }
                Err(WriteFailure::Upstream(e)) => return Err(e),
                Err(WriteFailure::Disk(failed)) => {
                    self.metrics.cache_write_failures.inc();
                    warn!(
                        %key,
                        error = %failed.error,
                        written = failed.written,
                        "cache write failed, serving fetched body uncached"
                    );
                    Some(failed)
                }
            },
            Err(err) => {
                self.metrics.cache_write_failures.inc();
                warn!(%key, error = %err, "cache unavailable, serving body uncached");
                None
            }
        };

        let (size, spooled) = self.spool_rest(failed, &mut body).await?;
        if let Some(expected) = expected_len
            && size != expected
        {
            return Err(FetchError::UpstreamUnreachable(format!(
                "upstream body truncated: got {size} of {expected} bytes"
            )));
        }

        Ok(Artifact::Uncached(Spooled {
            content_type,
            etag,
            size,
            body: spooled,
        }))
    }

    /// Gather the body the store gave up on, reusing what it already wrote.
    async fn spool_rest(
        &self,
        failed: Option<FailedWrite>,
        body: &mut BodyStream,
    ) -> Result<(u64, SpoolBody), FetchError> {
        let mut spool = MemorySpool::new(self.spool_limit);
        if let Some(failed) = failed {
            if failed.complete {
                return Ok((failed.written, SpoolBody::File(Arc::new(failed.partial))));
            }
            spool
                .push_file_prefix(&failed.partial, failed.written)
                .await?;
            if let Some(ref chunk) = failed.unwritten {
                spool.push(chunk)?;
            }
        }
        spool.drain(body).await?;
        Ok((spool.buffered(), SpoolBody::Memory(spool.freeze())))
    }
}

/// Drops the key from the in-flight map when the fetch task ends, panics
/// included.
struct InFlightGuard<'a> {
    coordinator: &'a FetchCoordinator,
    key: &'a CacheKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.lock().remove(self.key);
    }
}
