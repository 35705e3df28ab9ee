//! Request-to-key derivation.
//!
//! A [`CacheKey`] is a pure function of the request path and query string.
//! Equivalent spellings of the same resource (duplicate slashes, `.`
//! segments, reordered query parameters) normalize to the same key; anything
//! that could escape the upstream path space is rejected up front.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::FetchError;

/// Normalized identity of an upstream resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    path: String,
    query: Option<String>,
    digest: String,
}

/// A pub archive reference extracted from a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveRef<'a> {
    pub name: &'a str,
    pub version: &'a str,
}

impl CacheKey {
    /// Derive a key from a raw request path and optional query string.
    pub fn from_request(path: &str, query: Option<&str>) -> Result<Self, FetchError> {
        let path = normalize_path(path)?;
        let query = query.and_then(normalize_query);
        Ok(Self::from_parts(path, query))
    }

    /// Key for the archive of `name` at `version`.
    pub fn archive(name: &str, version: &str) -> Result<Self, FetchError> {
        if !is_package_name(name) || !is_version(version) {
            return Err(FetchError::InvalidRequest(format!(
                "invalid package reference: {name} {version}"
            )));
        }
        Ok(Self::from_parts(
            format!("/packages/{name}/versions/{version}.tar.gz"),
            None,
        ))
    }

    /// Parse the string form produced by [`CacheKey::as_string`].
    pub fn parse(s: &str) -> Result<Self, FetchError> {
        match s.split_once('?') {
            Some((path, query)) => Self::from_request(path, Some(query)),
            None => Self::from_request(s, None),
        }
    }

    fn from_parts(path: String, query: Option<String>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        if let Some(ref q) = query {
            hasher.update(b"?");
            hasher.update(q.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Self {
            path,
            query,
            digest,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Hex SHA-256 of the normalized path and query.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Path and query to request from upstream.
    pub fn as_string(&self) -> String {
        match self.query {
            Some(ref q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// The pub archive this key names, if it is one.
    ///
    /// Only `/packages/{name}/versions/{version}.tar.gz` without a query
    /// qualifies, and only when both segments are filesystem-safe.
    pub fn archive_ref(&self) -> Option<ArchiveRef<'_>> {
        if self.query.is_some() {
            return None;
        }
        let rest = self.path.strip_prefix("/packages/")?;
        let (name, rest) = rest.split_once('/')?;
        let file = rest.strip_prefix("versions/")?;
        let version = file.strip_suffix(".tar.gz")?;
        if is_package_name(name) && is_version(version) {
            Some(ArchiveRef { name, version })
        } else {
            None
        }
    }

    /// File name extension used for content-type inference.
    pub fn extension(&self) -> Option<&str> {
        let last = self.path.rsplit('/').next()?;
        if last.ends_with(".tar.gz") {
            return Some(".tar.gz");
        }
        last.rfind('.').map(|idx| &last[idx..])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        if let Some(ref q) = self.query {
            write!(f, "?{q}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn normalize_path(raw: &str) -> Result<String, FetchError> {
    if !raw.starts_with('/') {
        return Err(FetchError::InvalidRequest(format!(
            "path must be absolute: {raw:?}"
        )));
    }
    if raw.contains('\0') || raw.contains('\\') {
        return Err(FetchError::InvalidRequest(format!(
            "invalid characters in path: {raw:?}"
        )));
    }

    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(FetchError::InvalidRequest(format!(
                    "path traversal in {raw:?}"
                )));
            }
            s => segments.push(s),
        }
    }

    Ok(format!("/{}", segments.join("/")))
}

fn normalize_query(raw: &str) -> Option<String> {
    let mut pairs: Vec<&str> = raw.split('&').filter(|p| !p.is_empty()).collect();
    if pairs.is_empty() {
        return None;
    }
    pairs.sort_unstable();
    Some(pairs.join("&"))
}

/// pub package names: ASCII letter first, then letters, digits or `_`.
pub(crate) fn is_package_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Semver-ish versions: alphanumeric first, then `[A-Za-z0-9.+-]`.
pub(crate) fn is_version(version: &str) -> bool {
    let mut chars = version.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'))
}
