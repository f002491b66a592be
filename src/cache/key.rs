//! Object-store key derivation.
//!
//! Keys are `<namespace>/<md5 hex of the request target>`.  The digest covers
//! the raw path and query exactly as received, with no salt, so objects stored
//! by a previous process remain addressable after a restart.

use std::fmt;

/// Location of a cached artifact inside the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the cache key for `path_and_query` under `namespace`.
///
/// Leading and trailing slashes on the namespace are ignored; an empty
/// namespace yields the bare digest.
pub fn derive_key(namespace: &str, path_and_query: &str) -> CacheKey {
    let digest = md5::compute(path_and_query.as_bytes());
    let namespace = namespace.trim_matches('/');
    if namespace.is_empty() {
        CacheKey(format!("{digest:x}"))
    } else {
        CacheKey(format!("{namespace}/{digest:x}"))
    }
}
