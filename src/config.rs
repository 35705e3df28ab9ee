use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Proxy configuration.  Every section has defaults, so an empty YAML
/// document (or no file at all) yields a working pub.dev mirror.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind (e.g. `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally visible base URL used when rewriting `archive_url`.  When
    /// unset it is derived from the request `Host` header.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the mirrored repository (e.g. `https://pub.dev`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-read timeout; a stalled body surfaces as a timeout.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> String {
    "https://pub.dev".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("pubcache/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the on-disk cache (usually a mounted volume).
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Ceiling for cache usage in bytes.  `None` keeps everything forever.
    #[serde(default)]
    pub max_bytes: Option<u64>,
    /// Eviction starts when usage exceeds this fraction (0.0 .. 1.0).
    #[serde(default = "default_high_water")]
    pub high_water_mark: f64,
    /// Eviction stops when usage drops below this fraction.
    #[serde(default = "default_low_water")]
    pub low_water_mark: f64,
    /// Eviction policy: `lru` or `lfu`.
    #[serde(default = "default_eviction_policy")]
    pub eviction_policy: EvictionPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            max_bytes: None,
            high_water_mark: default_high_water(),
            low_water_mark: default_low_water(),
            eviction_policy: default_eviction_policy(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
}

fn default_cache_path() -> String {
    "./packages".to_string()
}

fn default_high_water() -> f64 {
    0.90
}

fn default_low_water() -> f64 {
    0.75
}

fn default_eviction_policy() -> EvictionPolicy {
    EvictionPolicy::Lru
}

// ---------------------------------------------------------------------------
// Cache behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Seconds an upstream 404 is remembered.  `0` disables negative caching.
    #[serde(default)]
    pub negative_cache_ttl: u64,
    /// Path prefixes that are always proxied live and never cached.
    #[serde(default = "default_passthrough_prefixes")]
    pub passthrough_prefixes: Vec<String>,
    /// Largest body held in memory when the cache directory cannot take it.
    #[serde(default = "default_spool_max_bytes")]
    pub spool_max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            negative_cache_ttl: 0,
            passthrough_prefixes: default_passthrough_prefixes(),
            spool_max_bytes: default_spool_max_bytes(),
        }
    }
}

impl CacheConfig {
    pub fn is_passthrough(&self, path: &str) -> bool {
        self.passthrough_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

fn default_passthrough_prefixes() -> Vec<String> {
    vec!["/api/".to_string()]
}

fn default_spool_max_bytes() -> u64 {
    64 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.storage.high_water_mark > config.storage.low_water_mark,
        "high_water_mark must be greater than low_water_mark"
    );
    anyhow::ensure!(
        config.storage.high_water_mark <= 1.0 && config.storage.low_water_mark >= 0.0,
        "water marks must be in range [0.0, 1.0]"
    );
    anyhow::ensure!(
        config.storage.max_bytes != Some(0),
        "max_bytes must be greater than zero when set"
    );
    anyhow::ensure!(
        !config.storage.path.is_empty(),
        "storage.path must not be empty"
    );

    let base = url::Url::parse(&config.upstream.base_url)
        .with_context(|| format!("invalid upstream base_url: {}", config.upstream.base_url))?;
    anyhow::ensure!(
        matches!(base.scheme(), "http" | "https"),
        "upstream base_url must be http or https"
    );
    anyhow::ensure!(
        config.upstream.connect_timeout_secs > 0 && config.upstream.read_timeout_secs > 0,
        "upstream timeouts must be greater than zero"
    );

    if let Some(ref public_url) = config.server.public_url {
        url::Url::parse(public_url)
            .with_context(|| format!("invalid server.public_url: {public_url}"))?;
    }
    anyhow::ensure!(
        config
            .cache
            .passthrough_prefixes
            .iter()
            .all(|p| p.starts_with('/')),
        "passthrough_prefixes must start with '/'"
    );
    anyhow::ensure!(
        config.cache.spool_max_bytes > 0,
        "cache.spool_max_bytes must be greater than zero"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.upstream.base_url, "https://pub.dev");
        assert_eq!(config.storage.path, "./packages");
        assert!(config.storage.max_bytes.is_none());
        assert_eq!(config.cache.negative_cache_ttl, 0);
        assert_eq!(config.cache.spool_max_bytes, 64 * 1024 * 1024);
        validate_config(&config).unwrap();
    }

    #[test]
    fn parses_full_document() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9000
  public_url: https://pub.internal
upstream:
  base_url: https://mirror.example.com
  read_timeout_secs: 5
storage:
  path: /srv/pub/packages
  max_bytes: 1000000
  eviction_policy: lfu
cache:
  negative_cache_ttl: 30
  spool_max_bytes: 1048576
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.upstream.read_timeout_secs, 5);
        assert_eq!(config.upstream.connect_timeout_secs, 10);
        assert_eq!(config.storage.max_bytes, Some(1_000_000));
        assert_eq!(config.storage.eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(config.cache.passthrough_prefixes, vec!["/api/".to_string()]);
        assert_eq!(config.cache.spool_max_bytes, 1_048_576);
    }

    #[test]
    fn rejects_inverted_water_marks() {
        let mut config = Config::default();
        config.storage.high_water_mark = 0.5;
        config.storage.low_water_mark = 0.8;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_non_http_upstream() {
        let mut config = Config::default();
        config.upstream.base_url = "ftp://pub.dev".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn passthrough_matches_prefix() {
        let cache = CacheConfig::default();
        assert!(cache.is_passthrough("/api/packages/foo"));
        assert!(!cache.is_passthrough("/packages/foo/versions/1.0.0.tar.gz"));
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server:\n  port: 8181\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 8181);
    }
}
