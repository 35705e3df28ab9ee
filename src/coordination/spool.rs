//! Holding area for bodies that could not be written to the cache.
//!
//! When the store refuses a body, the fetch that downloaded it still owes
//! every waiter the content.  Whatever already reached the store's temp file
//! is reused: a body that was fully written but failed to publish is served
//! straight from that file, and a body that failed part way is gathered in
//! memory up to a fixed limit.

use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tempfile::TempPath;
use tokio::io::AsyncReadExt;

use crate::error::FetchError;

/// A fetched body that is not in the cache.
#[derive(Debug, Clone)]
pub struct Spooled {
    pub content_type: String,
    pub etag: Option<String>,
    pub size: u64,
    pub body: SpoolBody,
}

#[derive(Debug, Clone)]
pub enum SpoolBody {
    Memory(Bytes),
    /// Temp file removed once the last holder drops it.
    File(Arc<TempPath>),
}

/// In-memory body buffer that refuses to grow past `limit` bytes.
#[derive(Debug)]
pub struct MemorySpool {
    buf: BytesMut,
    limit: u64,
}

impl MemorySpool {
    pub fn new(limit: u64) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    pub fn buffered(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        self.reserve(chunk.len() as u64)?;
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Append the first `len` bytes of the file at `path`.
    pub async fn push_file_prefix(&mut self, path: &Path, len: u64) -> Result<(), FetchError> {
        self.reserve(len)?;
        let read_err = |e: std::io::Error| {
            FetchError::CacheWrite(format!("read back {}: {e}", path.display()))
        };

        let file = tokio::fs::File::open(path).await.map_err(read_err)?;
        let mut prefix = Vec::new();
        file.take(len)
            .read_to_end(&mut prefix)
            .await
            .map_err(read_err)?;
        if prefix.len() as u64 != len {
            return Err(FetchError::CacheWrite(format!(
                "read back {}: expected {len} bytes, found {}",
                path.display(),
                prefix.len()
            )));
        }
        self.buf.extend_from_slice(&prefix);
        Ok(())
    }

    /// Drain the rest of an upstream body into the buffer.
    pub async fn drain<S>(&mut self, body: &mut S) -> Result<(), FetchError>
    where
        S: Stream<Item = Result<Bytes, FetchError>> + Unpin,
    {
        while let Some(chunk) = body.next().await {
            self.push(&chunk?)?;
        }
        Ok(())
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    fn reserve(&self, additional: u64) -> Result<(), FetchError> {
        if self.buffered().saturating_add(additional) > self.limit {
            return Err(FetchError::CacheWrite(format!(
                "cache unavailable and body exceeds the {} byte spool limit",
                self.limit
            )));
        }
        Ok(())
    }
}
