//! Cache-aside layer.
//!
//! [`key`] maps a namespace and request target to a stable object-store key;
//! [`engine`] decides per request whether to redirect to the cached copy,
//! relay the upstream response inline, or populate the store first.

pub mod engine;
pub mod key;

pub use key::{CacheKey, derive_key};
