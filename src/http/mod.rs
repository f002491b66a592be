//! HTTP layer.
//!
//! One axum router per mirror listener.  The protocol adapters classify each
//! request as cacheable (handed to the cache engine) or pass-through
//! (forwarded upstream, with protocol-specific rewriting where needed).

pub mod handler;
pub mod pypi;
pub mod registry;
