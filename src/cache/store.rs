//! On-disk artifact store with atomic publish and water-mark-based eviction.
//!
//! Layout under `base_path`:
//!
//! ```text
//! {name}/{version}/{name}-{version}.tar.gz            pub archives
//! {name}/{version}/{name}-{version}.tar.gz.meta.json  sidecar
//! _objects/{digest[..2]}/{digest}                     everything else
//! _objects/{digest[..2]}/{digest}.meta.json
//! ```
//!
//! Bodies are written to a uniquely named `.part` file and renamed into
//! place, so readers never observe a partial entry.  Archives written by
//! earlier deployments (no sidecar) are served as-is.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{EvictionPolicy, StorageConfig};
use crate::error::FetchError;

use super::entry::{
    CacheEntry, EntryMetadata, OpenEntry, Sidecar, content_type_for_ext, sidecar_path,
};
use super::index::{CacheIndex, IndexEntry};
use super::key::{CacheKey, is_package_name, is_version};
use super::{lfu, lru};

/// Directory holding every entry that is not a pub archive.
const OBJECTS_DIR: &str = "_objects";
const PART_SUFFIX: &str = ".part";
const SIDECAR_SUFFIX: &str = ".meta.json";

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// Owns the cache directory and every entry published into it.
#[derive(Debug)]
pub struct CacheStore {
    base_path: PathBuf,
    index: CacheIndex,
    /// Hard ceiling for total cache usage in bytes; `None` is unbounded.
    max_bytes: Option<u64>,
    high_water: f64,
    low_water: f64,
    eviction_policy: EvictionPolicy,
    /// Serializes eviction sweeps.
    sweep: tokio::sync::Mutex<()>,
}

impl CacheStore {
    /// Open the store rooted at `config.path`, creating it if missing.
    ///
    /// Orphaned `.part` files from interrupted writes are removed and the
    /// in-memory index is rebuilt from what is on disk.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let base_path = PathBuf::from(&config.path);
        tokio::fs::create_dir_all(&base_path)
            .await
            .with_context(|| format!("failed to create cache dir: {}", base_path.display()))?;

        let scan_root = base_path.clone();
        let report = tokio::task::spawn_blocking(move || scan_cache_dir(&scan_root))
            .await
            .context("cache scan task failed")??;

        let index = CacheIndex::new();
        let entries = report.entries.len();
        for entry in report.entries {
            index.insert(entry);
        }

        info!(
            path = %base_path.display(),
            entries,
            bytes = index.total_bytes(),
            orphans_removed = report.orphans_removed,
            "cache index rebuilt"
        );

        Ok(Self {
            base_path,
            index,
            max_bytes: config.max_bytes,
            high_water: config.high_water_mark,
            low_water: config.low_water_mark,
            eviction_policy: config.eviction_policy,
            sweep: tokio::sync::Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    /// Return the on-disk body path for `key`.
    pub fn body_path(&self, key: &CacheKey) -> PathBuf {
        layout_path(&self.base_path, key)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Look up `key`, returning the entry with its body already open.
    ///
    /// Any I/O problem is logged and reported as a miss.
    pub async fn lookup(&self, key: &CacheKey) -> Option<OpenEntry> {
        let path = self.body_path(key);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(%key, error = %e, "failed to open cached body, treating as miss");
                return None;
            }
        };
        let fs_meta = match file.metadata().await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return None,
            Err(e) => {
                warn!(%key, error = %e, "failed to stat cached body, treating as miss");
                return None;
            }
        };

        let (content_type, created, etag) = match read_sidecar(&sidecar_path(&path)).await {
            Some(sidecar) if sidecar.key == key.as_string() => {
                (sidecar.content_type, sidecar.created, sidecar.etag)
            }
            Some(sidecar) => {
                warn!(%key, stored = %sidecar.key, "sidecar key mismatch, treating as miss");
                return None;
            }
            None => (
                content_type_for_ext(key.extension()).to_string(),
                fs_meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
                None,
            ),
        };

        // Size comes from the open handle so it always matches the bytes served.
        let size = fs_meta.len();
        let now = Utc::now().timestamp_millis();
        if !self.index.touch(&path, now) {
            self.index.insert(IndexEntry {
                key: key.clone(),
                path: path.clone(),
                size,
                last_access: now,
                hits: 1,
            });
        }

        Some(OpenEntry {
            entry: CacheEntry {
                key: key.clone(),
                path,
                content_type,
                size,
                created,
                etag,
            },
            file,
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Prepare a temp file for `key`.  Fails with [`FetchError::CacheWrite`]
    /// before any body byte is consumed.
    pub async fn begin_put(
        &self,
        key: &CacheKey,
        meta: EntryMetadata,
    ) -> Result<PendingEntry, FetchError> {
        let final_path = self.body_path(key);
        let tmp_path = temp_path_for(&final_path);
        let file = create_with_parents(&tmp_path)
            .await
            .map_err(|e| FetchError::CacheWrite(format!("create {}: {e}", tmp_path.display())))?;

        Ok(PendingEntry {
            key: key.clone(),
            meta,
            tmp_path,
            final_path,
            file,
            written: 0,
        })
    }

    /// Drain `body` into `pending` and publish it.
    ///
    /// An upstream stream error is returned as-is; a disk error becomes
    /// [`FetchError::CacheWrite`].  Either way the temp file is removed and
    /// nothing is published.
    pub async fn write_stream<S>(
        &self,
        pending: PendingEntry,
        mut body: S,
    ) -> Result<CacheEntry, FetchError>
    where
        S: Stream<Item = Result<Bytes, FetchError>> + Unpin,
    {
        self.write_or_salvage(pending, &mut body)
            .await
            .map_err(|failure| match failure {
                WriteFailure::Upstream(e) => e,
                // Dropping the partial body removes its temp file.
                WriteFailure::Disk(failed) => failed.error,
            })
    }

    /// Like [`CacheStore::write_stream`], but a disk failure hands back the
    /// bytes already written and leaves the rest of `body` unread, so the
    /// caller can still deliver the content.
    pub async fn write_or_salvage<S>(
        &self,
        mut pending: PendingEntry,
        body: &mut S,
    ) -> Result<CacheEntry, WriteFailure>
    where
        S: Stream<Item = Result<Bytes, FetchError>> + Unpin,
    {
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    pending.abort().await;
                    return Err(WriteFailure::Upstream(e));
                }
            };
            if let Err(e) = pending.write_chunk(&chunk).await {
                warn!(key = %pending.key, error = %e, "failed to write chunk to disk");
                return Err(WriteFailure::Disk(pending.into_failed(e, Some(chunk))));
            }
        }

        if let Some(expected) = pending.meta.expected_len
            && pending.written != expected
        {
            let written = pending.written;
            pending.abort().await;
            return Err(WriteFailure::Upstream(FetchError::UpstreamUnreachable(
                format!("upstream body truncated: got {written} of {expected} bytes"),
            )));
        }

        self.commit(pending).await.map_err(WriteFailure::Disk)
    }

    /// Write `body` under `key` and publish it atomically.
    pub async fn put<S>(
        &self,
        key: &CacheKey,
        body: S,
        meta: EntryMetadata,
    ) -> Result<CacheEntry, FetchError>
    where
        S: Stream<Item = Result<Bytes, FetchError>> + Unpin,
    {
        let pending = self.begin_put(key, meta).await?;
        self.write_stream(pending, body).await
    }

    async fn commit(&self, pending: PendingEntry) -> Result<CacheEntry, FailedWrite> {
        let PendingEntry {
            key,
            meta,
            tmp_path,
            final_path,
            mut file,
            written,
        } = pending;

        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = synced {
            return Err(FailedWrite::complete(
                FetchError::CacheWrite(format!("sync {}: {e}", tmp_path.display())),
                tmp_path,
                written,
            ));
        }

        let content_type = meta
            .content_type
            .unwrap_or_else(|| content_type_for_ext(key.extension()).to_string());
        let entry = CacheEntry {
            key,
            path: final_path,
            content_type,
            size: written,
            created: Utc::now(),
            etag: meta.etag,
        };

        if let Err(e) = publish(&entry, &tmp_path).await {
            return Err(FailedWrite::complete(
                FetchError::CacheWrite(format!("publish {}: {e}", entry.path.display())),
                tmp_path,
                written,
            ));
        }

        self.index.insert(IndexEntry {
            key: entry.key.clone(),
            path: entry.path.clone(),
            size: entry.size,
            last_access: entry.created.timestamp_millis(),
            hits: 0,
        });

        debug!(key = %entry.key, path = %entry.path.display(), size = entry.size, "entry published");
        Ok(entry)
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    /// Remove the entry for `key`.  Returns `true` if a body was deleted.
    pub async fn evict(&self, key: &CacheKey) -> bool {
        let path = self.body_path(key);
        self.remove_entry(&path).await
    }

    /// Remove every indexed entry whose key matches `predicate`.
    pub async fn evict_if<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let victims: Vec<IndexEntry> = self
            .index
            .snapshot()
            .into_iter()
            .filter(|e| predicate(&e.key))
            .collect();

        let mut evicted = 0;
        for victim in victims {
            if self.remove_entry(&victim.path).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Current usage as a fraction of `max_bytes` (0 when unbounded).
    pub fn usage_fraction(&self) -> f64 {
        match self.max_bytes {
            Some(max) if max > 0 => self.index.total_bytes() as f64 / max as f64,
            _ => 0.0,
        }
    }

    /// Return `true` when usage exceeds the high-water mark.
    pub fn needs_eviction(&self) -> bool {
        self.max_bytes.is_some() && self.usage_fraction() > self.high_water
    }

    /// Evict entries by the configured policy until usage drops to the
    /// low-water mark.  The entry at `protect` is never evicted.
    ///
    /// Returns the number of entries evicted.
    pub async fn enforce_limits(&self, protect: &Path) -> usize {
        let Some(max_bytes) = self.max_bytes else {
            return 0;
        };
        if !self.needs_eviction() {
            return 0;
        }
        let Ok(_sweep) = self.sweep.try_lock() else {
            debug!("eviction sweep already running");
            return 0;
        };

        let snapshot = self.index.snapshot();
        let candidates = match self.eviction_policy {
            EvictionPolicy::Lru => lru::get_eviction_candidates(snapshot, protect),
            EvictionPolicy::Lfu => lfu::get_eviction_candidates(snapshot, protect),
        };

        let low_target = (max_bytes as f64 * self.low_water) as u64;
        let mut evicted: usize = 0;

        for candidate in &candidates {
            let used = self.index.total_bytes();
            if used <= low_target {
                info!(evicted, used, "eviction complete: reached low-water mark");
                break;
            }
            if self.remove_entry(&candidate.path).await {
                evicted += 1;
            }
        }

        info!(evicted, "eviction sweep finished");
        evicted
    }

    async fn remove_entry(&self, path: &Path) -> bool {
        self.index.remove(path);

        let removed = match tokio::fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove cached body");
                false
            }
        };
        remove_quietly(&sidecar_path(path)).await;
        self.prune_empty_dirs(path).await;

        if removed {
            debug!(path = %path.display(), "evicted entry from local cache");
        }
        removed
    }

    /// Remove now-empty parent directories up to (not including) the root.
    async fn prune_empty_dirs(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.base_path || !d.starts_with(&self.base_path) {
                break;
            }
            if tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

// ---------------------------------------------------------------------------
// PendingEntry
// ---------------------------------------------------------------------------

/// A body being written to its temp file, not yet visible to readers.
#[derive(Debug)]
pub struct PendingEntry {
    key: CacheKey,
    meta: EntryMetadata,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: tokio::fs::File,
    written: u64,
}

impl PendingEntry {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| FetchError::CacheWrite(format!("write {}: {e}", self.tmp_path.display())))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Discard the partial body.
    pub async fn abort(self) {
        drop(self.file);
        remove_quietly(&self.tmp_path).await;
    }

    fn into_failed(self, error: FetchError, unwritten: Option<Bytes>) -> FailedWrite {
        drop(self.file);
        FailedWrite {
            error,
            partial: TempPath::from_path(self.tmp_path),
            written: self.written,
            unwritten,
            complete: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Write failures
// ---------------------------------------------------------------------------

/// Why a body did not make it into the store.
#[derive(Debug)]
pub enum WriteFailure {
    /// The upstream body failed or came up short.  Nothing was kept.
    Upstream(FetchError),
    /// The disk refused the body.
    Disk(FailedWrite),
}

/// Body bytes left behind by a write the store gave up on.
#[derive(Debug)]
pub struct FailedWrite {
    pub error: FetchError,
    /// Temp file holding the first `written` bytes of the body.  Removed on
    /// drop.
    pub partial: TempPath,
    pub written: u64,
    /// The chunk that was being written when the disk failed.
    pub unwritten: Option<Bytes>,
    /// `partial` holds the whole body; only the publish step failed.
    pub complete: bool,
}

impl FailedWrite {
    fn complete(error: FetchError, tmp_path: PathBuf, written: u64) -> Self {
        Self {
            error,
            partial: TempPath::from_path(tmp_path),
            written,
            unwritten: None,
            complete: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compute where `key` lives under `base`.
fn layout_path(base: &Path, key: &CacheKey) -> PathBuf {
    match key.archive_ref() {
        Some(archive) => base
            .join(archive.name)
            .join(archive.version)
            .join(format!("{}-{}.tar.gz", archive.name, archive.version)),
        None => {
            let digest = key.digest();
            base.join(OBJECTS_DIR).join(&digest[..2]).join(digest)
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}{PART_SUFFIX}", uuid::Uuid::new_v4().simple()));
    PathBuf::from(name)
}

/// Publish the sidecar, then the body.  A reader that can open the body
/// therefore always finds the matching sidecar.
async fn publish(entry: &CacheEntry, tmp_body: &Path) -> std::io::Result<()> {
    let sidecar = Sidecar {
        key: entry.key.as_string(),
        content_type: entry.content_type.clone(),
        size: entry.size,
        created: entry.created,
        etag: entry.etag.clone(),
    };
    let json = serde_json::to_vec_pretty(&sidecar).map_err(std::io::Error::other)?;

    let meta_path = sidecar_path(&entry.path);
    let meta_tmp = temp_path_for(&meta_path);
    tokio::fs::write(&meta_tmp, &json).await?;
    if let Err(e) = tokio::fs::rename(&meta_tmp, &meta_path).await {
        remove_quietly(&meta_tmp).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(tmp_body, &entry.path).await {
        remove_quietly(&meta_path).await;
        return Err(e);
    }
    Ok(())
}

/// Create `path`, creating missing parent directories first.  An eviction
/// sweep may prune an empty parent between the two steps, so a vanished
/// parent is recreated a bounded number of times.
async fn create_with_parents(path: &Path) -> std::io::Result<tokio::fs::File> {
    let mut retries = 0;
    loop {
        match tokio::fs::File::create(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound && retries < 3 => {
                retries += 1;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            other => return other,
        }
    }
}

async fn read_sidecar(path: &Path) -> Option<Sidecar> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read sidecar");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(sidecar) => Some(sidecar),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed sidecar");
            None
        }
    }
}

pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove file");
    }
}

struct ScanReport {
    entries: Vec<IndexEntry>,
    orphans_removed: usize,
}

/// Walk `base` and index every recognisable body file.
fn scan_cache_dir(base: &Path) -> Result<ScanReport> {
    let mut report = ScanReport {
        entries: Vec::new(),
        orphans_removed: 0,
    };

    let mut stack = vec![base.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("failed to read cache directory: {}", current.display()))?;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let path = entry.path();
            if meta.is_dir() {
                stack.push(path);
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(PART_SUFFIX) {
                match std::fs::remove_file(&path) {
                    Ok(()) => report.orphans_removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphan"),
                }
                continue;
            }
            if name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }

            let Some(key) = key_for_body(base, &path) else {
                debug!(path = %path.display(), "skipping unrecognised file in cache dir");
                continue;
            };
            let last_access = meta
                .modified()
                .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                .unwrap_or(0);

            report.entries.push(IndexEntry {
                key,
                path,
                size: meta.len(),
                last_access,
                hits: 0,
            });
        }
    }

    Ok(report)
}

/// Recover the key a body file was stored under.
fn key_for_body(base: &Path, path: &Path) -> Option<CacheKey> {
    if let Ok(bytes) = std::fs::read(sidecar_path(path)) {
        let sidecar: Sidecar = serde_json::from_slice(&bytes).ok()?;
        let key = CacheKey::parse(&sidecar.key).ok()?;
        return (layout_path(base, &key) == path).then_some(key);
    }

    // Sidecar-less archive: `{name}/{version}/{name}-{version}.tar.gz`.
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;
    let [name, version, file] = parts.as_slice() else {
        return None;
    };
    if !is_package_name(name) || !is_version(version) {
        return None;
    }
    if *file != format!("{name}-{version}.tar.gz") {
        return None;
    }
    CacheKey::archive(name, version).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &Path) -> StorageConfig {
        StorageConfig {
            path: dir.to_string_lossy().into_owned(),
            ..StorageConfig::default()
        }
    }

    fn body(chunks: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, FetchError>> + Unpin {
        futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
    }

    fn gzip_meta() -> EntryMetadata {
        EntryMetadata {
            content_type: Some("application/gzip".into()),
            etag: Some("\"abc\"".into()),
            expected_len: None,
        }
    }

    async fn read_all(open: OpenEntry) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut file = open.file;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            for e in std::fs::read_dir(&d).unwrap() {
                let p = e.unwrap().path();
                if p.is_dir() {
                    stack.push(p);
                } else {
                    out.push(p);
                }
            }
        }
        out.sort();
        out
    }

    #[test]
    fn archive_layout_matches_legacy_volume() {
        let key = CacheKey::archive("foo", "1.0.0").unwrap();
        assert_eq!(
            layout_path(Path::new("/srv/pub"), &key),
            PathBuf::from("/srv/pub/foo/1.0.0/foo-1.0.0.tar.gz")
        );
    }

    #[test]
    fn generic_layout_uses_digest_shards() {
        let key = CacheKey::from_request("/packages/foo-1.0.tar.gz", None).unwrap();
        let path = layout_path(Path::new("/srv/pub"), &key);
        let digest = key.digest();
        assert_eq!(
            path,
            PathBuf::from(format!("/srv/pub/_objects/{}/{}", &digest[..2], digest))
        );
    }

    #[tokio::test]
    async fn put_then_lookup_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let key = CacheKey::archive("foo", "1.0.0").unwrap();

        let entry = store
            .put(&key, body(&[b"hello ", b"world"]), gzip_meta())
            .await
            .unwrap();
        assert_eq!(entry.size, 11);

        let open = store.lookup(&key).await.unwrap();
        assert_eq!(open.entry.content_type, "application/gzip");
        assert_eq!(open.entry.etag.as_deref(), Some("\"abc\""));
        assert_eq!(open.entry.size, 11);
        assert_eq!(read_all(open).await, b"hello world");
    }

    #[tokio::test]
    async fn lookup_misses_on_empty_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let key = CacheKey::from_request("/nothing", None).unwrap();
        assert!(store.lookup(&key).await.is_none());
    }

    #[tokio::test]
    async fn repeated_put_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let key = CacheKey::archive("foo", "1.0.0").unwrap();

        store.put(&key, body(&[b"same"]), gzip_meta()).await.unwrap();
        let first = files_under(tmp.path());
        store.put(&key, body(&[b"same"]), gzip_meta()).await.unwrap();
        let second = files_under(tmp.path());

        assert_eq!(first, second);
        assert_eq!(second.len(), 2, "body and sidecar only: {second:?}");
        assert_eq!(store.index().len(), 1);
        assert_eq!(store.index().total_bytes(), 4);
        assert_eq!(read_all(store.lookup(&key).await.unwrap()).await, b"same");
    }

    #[tokio::test]
    async fn failed_stream_publishes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let key = CacheKey::archive("foo", "1.0.0").unwrap();

        let broken = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(FetchError::UpstreamTimeout),
        ]);
        let err = store.put(&key, broken, gzip_meta()).await.unwrap_err();
        assert_eq!(err, FetchError::UpstreamTimeout);

        assert!(store.lookup(&key).await.is_none());
        assert!(files_under(tmp.path()).is_empty());
        assert!(store.index().is_empty());
    }

    #[tokio::test]
    async fn truncated_body_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let key = CacheKey::archive("foo", "1.0.0").unwrap();

        let meta = EntryMetadata {
            expected_len: Some(100),
            ..gzip_meta()
        };
        let err = store.put(&key, body(&[b"short"]), meta).await.unwrap_err();
        assert!(matches!(err, FetchError::UpstreamUnreachable(_)));
        assert!(store.lookup(&key).await.is_none());
    }

    #[tokio::test]
    async fn begin_put_reports_cache_write_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        // A plain file where the package directory should be.
        std::fs::write(tmp.path().join("foo"), b"not a dir").unwrap();

        let key = CacheKey::archive("foo", "1.0.0").unwrap();
        let err = store.begin_put(&key, gzip_meta()).await.unwrap_err();
        assert!(matches!(err, FetchError::CacheWrite(_)));
    }

    #[tokio::test]
    async fn failed_publish_hands_back_body_and_leaves_no_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let key = CacheKey::archive("foo", "1.0.0").unwrap();
        // A non-empty directory at the body path makes the final rename fail.
        let body_path = store.body_path(&key);
        std::fs::create_dir_all(body_path.join("x")).unwrap();

        let pending = store.begin_put(&key, gzip_meta()).await.unwrap();
        let mut stream = body(&[b"hello ", b"world"]);
        let failed = match store.write_or_salvage(pending, &mut stream).await {
            Err(WriteFailure::Disk(failed)) => failed,
            other => panic!("expected a disk failure, got {other:?}"),
        };

        assert!(matches!(failed.error, FetchError::CacheWrite(_)));
        assert!(failed.complete);
        assert!(failed.unwritten.is_none());
        assert_eq!(failed.written, 11);
        assert_eq!(std::fs::read(&failed.partial).unwrap(), b"hello world");
        assert!(!sidecar_path(&body_path).exists());
        assert!(store.index().is_empty());

        let partial = failed.partial.to_path_buf();
        drop(failed);
        assert!(!partial.exists());
        assert!(store.lookup(&key).await.is_none());
    }

    #[tokio::test]
    async fn failed_publish_through_write_stream_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let key = CacheKey::archive("foo", "1.0.0").unwrap();
        std::fs::create_dir_all(store.body_path(&key).join("x")).unwrap();

        let err = store.put(&key, body(&[b"abc"]), gzip_meta()).await.unwrap_err();
        assert!(matches!(err, FetchError::CacheWrite(_)));
        // Only the blocking directory is left: no temp body, no sidecar.
        assert!(files_under(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn put_recreates_pruned_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let key = CacheKey::from_request("/packages/foo-1.0.tar.gz", None).unwrap();

        store.put(&key, body(&[b"one"]), gzip_meta()).await.unwrap();
        assert!(store.evict(&key).await);
        assert!(!store.body_path(&key).parent().unwrap().exists());

        store.put(&key, body(&[b"two"]), gzip_meta()).await.unwrap();
        assert_eq!(read_all(store.lookup(&key).await.unwrap()).await, b"two");
    }

    #[tokio::test]
    async fn legacy_archives_are_indexed_and_served() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("http").join("1.2.0");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("http-1.2.0.tar.gz"), b"legacy").unwrap();
        std::fs::write(dir.join("http-1.2.0.tar.gz.part"), b"junk").unwrap();
        std::fs::write(tmp.path().join("README"), b"not an entry").unwrap();

        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        assert_eq!(store.index().len(), 1);
        assert_eq!(store.index().total_bytes(), 6);
        assert!(!dir.join("http-1.2.0.tar.gz.part").exists());

        let key = CacheKey::archive("http", "1.2.0").unwrap();
        let open = store.lookup(&key).await.unwrap();
        assert_eq!(open.entry.content_type, "application/gzip");
        assert_eq!(read_all(open).await, b"legacy");
    }

    #[tokio::test]
    async fn reopen_recovers_generic_entries_from_sidecars() {
        let tmp = tempfile::tempdir().unwrap();
        let key = CacheKey::from_request("/packages/foo-1.0.tar.gz", None).unwrap();
        {
            let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
            store.put(&key, body(&[b"B"]), gzip_meta()).await.unwrap();
        }

        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let snapshot = store.index().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, key);
    }

    #[tokio::test]
    async fn evict_and_evict_if() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let a = CacheKey::archive("foo", "1.0.0").unwrap();
        let b = CacheKey::archive("foo", "2.0.0").unwrap();
        let c = CacheKey::archive("bar", "1.0.0").unwrap();
        for key in [&a, &b, &c] {
            store.put(key, body(&[b"x"]), gzip_meta()).await.unwrap();
        }

        assert!(store.evict(&a).await);
        assert!(!store.evict(&a).await);
        assert!(store.lookup(&a).await.is_none());
        assert!(!tmp.path().join("foo").join("1.0.0").exists());

        let evicted = store
            .evict_if(|k| k.archive_ref().is_some_and(|r| r.name == "foo"))
            .await;
        assert_eq!(evicted, 1);
        assert!(!tmp.path().join("foo").exists());
        assert!(store.lookup(&c).await.is_some());
    }

    #[tokio::test]
    async fn enforce_limits_evicts_down_to_low_water() {
        let tmp = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            max_bytes: Some(100),
            high_water_mark: 0.9,
            low_water_mark: 0.5,
            ..storage(tmp.path())
        };
        let store = CacheStore::open(&config).await.unwrap();

        let chunk: &'static [u8] = &[0u8; 30];
        let keys: Vec<CacheKey> = (1..=4)
            .map(|v| CacheKey::archive("pkg", &format!("{v}.0.0")).unwrap())
            .collect();
        for key in &keys[..3] {
            store.put(key, body(&[chunk]), gzip_meta()).await.unwrap();
            // Distinct access times for LRU ordering.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!store.needs_eviction());

        let newest = store.put(&keys[3], body(&[chunk]), gzip_meta()).await.unwrap();
        assert!(store.needs_eviction());

        let evicted = store.enforce_limits(&newest.path).await;
        assert_eq!(evicted, 3);
        assert_eq!(store.index().total_bytes(), 30);
        assert!(store.lookup(&keys[3]).await.is_some());
    }

    #[tokio::test]
    async fn unbounded_store_never_evicts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&storage(tmp.path())).await.unwrap();
        let key = CacheKey::archive("foo", "1.0.0").unwrap();
        let entry = store.put(&key, body(&[b"abc"]), gzip_meta()).await.unwrap();
        assert_eq!(store.enforce_limits(&entry.path).await, 0);
        assert_eq!(store.usage_fraction(), 0.0);
    }
}
