//! HTTP layer for the pub caching proxy.
//!
//! Archive downloads are served from the on-disk cache, filling it from
//! upstream on a miss.  Package metadata is proxied live with its
//! `archive_url`s pointed back at this server.

pub mod admin;
pub mod artifact;
pub mod handler;
pub mod metadata;
