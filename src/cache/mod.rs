//! Local artifact cache.
//!
//! [`CacheStore`] owns the on-disk cache directory.  Keys are derived from
//! request paths in [`key`], entries carry a JSON sidecar described in
//! [`entry`], and [`lru`]/[`lfu`] rank entries when the store is over its
//! configured size limit.

pub mod entry;
pub mod index;
pub mod key;
pub mod lfu;
pub mod lru;
pub mod store;

pub use entry::{CacheEntry, EntryMetadata, OpenEntry};
pub use key::CacheKey;
pub use store::CacheStore;
