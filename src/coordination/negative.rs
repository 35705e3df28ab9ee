//! Short-lived memory of keys upstream reported as missing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cache::CacheKey;

#[derive(Debug)]
pub struct NegativeCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, Instant>>,
}

impl NegativeCache {
    /// A TTL of zero disables negative caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: CacheKey) {
        if !self.is_enabled() {
            return;
        }
        let expires = Instant::now() + self.ttl;
        let mut entries = self.lock();
        entries.retain(|_, at| *at > Instant::now());
        debug!(%key, ttl_secs = self.ttl.as_secs(), "remembering upstream 404");
        entries.insert(key, expires);
    }

    /// Whether `key` is a remembered 404 that has not expired yet.
    pub fn contains(&self, key: &CacheKey) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut entries = self.lock();
        match entries.get(key) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &CacheKey) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
