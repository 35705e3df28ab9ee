//! Least Frequently Used (LFU) eviction policy.
//!
//! Each lookup hit bumps the entry's counter in the [`CacheIndex`].  When the
//! store needs to free space, this module ranks entries by ascending hit
//! count and returns the least-accessed ones first.
//!
//! [`CacheIndex`]: super::index::CacheIndex

use std::path::Path;

use tracing::debug;

use super::index::IndexEntry;

/// Return `entries` ordered least frequently used first, oldest access
/// breaking ties.  The entry at `protect` is excluded.
pub fn get_eviction_candidates(entries: Vec<IndexEntry>, protect: &Path) -> Vec<IndexEntry> {
    let mut candidates: Vec<IndexEntry> = entries
        .into_iter()
        .filter(|e| e.path != protect)
        .collect();

    candidates.sort_by_key(|e| (e.hits, e.last_access));

    debug!(
        candidate_count = candidates.len(),
        "selected LFU eviction candidates"
    );

    candidates
}
