//! Least Recently Used (LRU) eviction policy.
//!
//! Ranks entries by ascending `last_access`, so entries that were served
//! longest ago are evicted first.

use std::path::Path;

use tracing::debug;

use super::index::IndexEntry;

/// Return `entries` ordered least recently used first.
///
/// The entry stored at `protect` (usually the one just published) is never
/// returned as a candidate.
pub fn get_eviction_candidates(entries: Vec<IndexEntry>, protect: &Path) -> Vec<IndexEntry> {
    let mut candidates: Vec<IndexEntry> = entries
        .into_iter()
        .filter(|e| e.path != protect)
        .collect();

    // Oldest access first; ties broken by size so larger entries go first.
    candidates.sort_by(|a, b| {
        a.last_access
            .cmp(&b.last_access)
            .then_with(|| b.size.cmp(&a.size))
    });

    debug!(
        candidate_count = candidates.len(),
        "selected LRU eviction candidates"
    );

    candidates
}
