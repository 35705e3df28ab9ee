//! In-process fetch coordination.
//!
//! [`FetchCoordinator`] guarantees at most one upstream fetch per cache key
//! at a time and shares its outcome with every concurrent requester.
//! [`NegativeCache`] optionally remembers upstream 404s for a short TTL.
//! [`spool`] holds bodies the cache could not take.

pub mod inflight;
pub mod negative;
pub mod spool;

pub use inflight::{Artifact, FetchCoordinator};
pub use negative::NegativeCache;
pub use spool::{SpoolBody, Spooled};
