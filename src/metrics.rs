use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::error::FetchError;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LookupLabels {
    pub result: LookupResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LookupResult {
    Hit,
    Miss,
    Bypass,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub outcome: FetchOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchOutcome {
    Success,
    NotFound,
    UpstreamError,
    Timeout,
    Unreachable,
    CacheWrite,
}

impl FetchOutcome {
    pub fn of(result: &Result<(), &FetchError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(FetchError::UpstreamNotFound(_)) => Self::NotFound,
            Err(FetchError::UpstreamError { .. } | FetchError::InvalidRequest(_)) => {
                Self::UpstreamError
            }
            Err(FetchError::UpstreamTimeout) => Self::Timeout,
            Err(FetchError::UpstreamUnreachable(_)) => Self::Unreachable,
            Err(FetchError::CacheWrite(_)) => Self::CacheWrite,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- cache --
    pub cache_lookups: Family<LookupLabels, Counter>,
    pub cache_evictions: Counter,
    pub cache_write_failures: Counter,
    pub bytes_served: Counter,

    // -- upstream --
    pub upstream_fetches: Family<FetchLabels, Counter>,
    pub upstream_fetch_duration_seconds: Histogram,
    pub coalesced_requests: Counter,
    pub negative_cache_hits: Counter,

    // -- gauges --
    pub cache_size_bytes: Gauge,
    pub cache_entries: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_lookups = Family::<LookupLabels, Counter>::default();
        registry.register(
            "pubcache_cache_lookups",
            "Artifact requests by cache result",
            cache_lookups.clone(),
        );

        let cache_evictions = Counter::default();
        registry.register(
            "pubcache_cache_evictions",
            "Entries removed by eviction or purge",
            cache_evictions.clone(),
        );

        let cache_write_failures = Counter::default();
        registry.register(
            "pubcache_cache_write_failures",
            "Fetches that could not be persisted to disk",
            cache_write_failures.clone(),
        );

        let bytes_served = Counter::default();
        registry.register(
            "pubcache_bytes_served",
            "Artifact body bytes sent to clients from the cache",
            bytes_served.clone(),
        );

        let upstream_fetches = Family::<FetchLabels, Counter>::default();
        registry.register(
            "pubcache_upstream_fetches",
            "Upstream fetches by outcome",
            upstream_fetches.clone(),
        );

        let upstream_fetch_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "pubcache_upstream_fetch_duration_seconds",
            "Time to fetch and persist an artifact from upstream",
            upstream_fetch_duration_seconds.clone(),
        );

        let coalesced_requests = Counter::default();
        registry.register(
            "pubcache_coalesced_requests",
            "Requests that joined an in-flight fetch instead of starting one",
            coalesced_requests.clone(),
        );

        let negative_cache_hits = Counter::default();
        registry.register(
            "pubcache_negative_cache_hits",
            "Requests answered from the remembered-404 cache",
            negative_cache_hits.clone(),
        );

        let cache_size_bytes: Gauge = Gauge::default();
        registry.register(
            "pubcache_cache_size_bytes",
            "Current local cache disk usage in bytes",
            cache_size_bytes.clone(),
        );

        let cache_entries: Gauge = Gauge::default();
        registry.register(
            "pubcache_cache_entries",
            "Number of entries currently cached locally",
            cache_entries.clone(),
        );

        Self {
            cache_lookups,
            cache_evictions,
            cache_write_failures,
            bytes_served,
            upstream_fetches,
            upstream_fetch_duration_seconds,
            coalesced_requests,
            negative_cache_hits,
            cache_size_bytes,
            cache_entries,
        }
    }

    pub fn record_lookup(&self, result: LookupResult) {
        self.cache_lookups.get_or_create(&LookupLabels { result }).inc();
    }

    pub fn record_served(&self, size: u64, head_only: bool) {
        if !head_only {
            self.bytes_served.inc_by(size);
        }
    }

    pub fn record_fetch(&self, result: Result<(), &FetchError>) {
        let outcome = FetchOutcome::of(&result);
        self.upstream_fetches
            .get_or_create(&FetchLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Encode the registry in the OpenMetrics text format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
