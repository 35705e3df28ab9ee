//! Cache entry types and the JSON sidecar persisted next to each body.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::CacheKey;

/// A published, immutable cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Location of the body on disk.
    pub path: PathBuf,
    pub content_type: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub etag: Option<String>,
}

impl CacheEntry {
    /// Open the body for reading.
    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

/// A looked-up entry together with its already-open body.
#[derive(Debug)]
pub struct OpenEntry {
    pub entry: CacheEntry,
    pub file: tokio::fs::File,
}

/// Response metadata captured before the body is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    pub content_type: Option<String>,
    pub etag: Option<String>,
    /// `Content-Length` announced by upstream, checked on commit.
    pub expected_len: Option<u64>,
}

/// On-disk form of an entry's metadata (`<body>.meta.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
    pub key: String,
    pub content_type: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Path of the sidecar belonging to `body`.
pub fn sidecar_path(body: &Path) -> PathBuf {
    let mut name = body.as_os_str().to_owned();
    name.push(".meta.json");
    PathBuf::from(name)
}

/// Map a file extension to an appropriate Content-Type.
pub fn content_type_for_ext(ext: Option<&str>) -> &'static str {
    match ext {
        Some(".tar.gz" | ".tgz" | ".gz") => "application/gzip",
        Some(".tar") => "application/x-tar",
        Some(".zip") => "application/zip",
        Some(".json") => "application/json",
        Some(".yaml" | ".yml") => "application/yaml",
        Some(".html") => "text/html; charset=utf-8",
        Some(".txt" | ".md") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
