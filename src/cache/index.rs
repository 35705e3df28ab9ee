//! In-memory accounting of published entries.
//!
//! The index tracks size, last access and hit count per body file so the
//! eviction policies can rank entries without walking the disk.  It is
//! rebuilt from the cache directory at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::key::CacheKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,
    /// Unix timestamp (milliseconds) of the last lookup or publish.
    pub last_access: i64,
    /// Lookups served since startup (or since the entry was published).
    pub hits: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<PathBuf, IndexEntry>,
    total_bytes: u64,
}

#[derive(Debug, Default)]
pub struct CacheIndex {
    inner: Mutex<Inner>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the entry stored at `entry.path`.
    pub fn insert(&self, entry: IndexEntry) {
        let mut inner = self.lock();
        let size = entry.size;
        if let Some(old) = inner.entries.insert(entry.path.clone(), entry) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.size);
        }
        inner.total_bytes += size;
    }

    /// Record a lookup hit.  Returns `false` if the path is not indexed.
    pub fn touch(&self, path: &Path, now_ms: i64) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(path) {
            Some(entry) => {
                entry.hits += 1;
                entry.last_access = now_ms;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, path: &Path) -> Option<IndexEntry> {
        let mut inner = self.lock();
        let removed = inner.entries.remove(path)?;
        inner.total_bytes = inner.total_bytes.saturating_sub(removed.size);
        Some(removed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all entries, for ranking outside the lock.
    pub fn snapshot(&self) -> Vec<IndexEntry> {
        self.lock().entries.values().cloned().collect()
    }
}
