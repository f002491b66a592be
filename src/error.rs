//! Error kinds surfaced on the request path.
//!
//! Startup plumbing uses `anyhow`; everything a single mirrored request can
//! fail with is a [`MirrorError`] so the HTTP layer can pick a status code.

use axum::http::StatusCode;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// A mirror mapping or upstream URL could not be parsed.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// DNS, connect, TLS or timeout failure talking to the upstream.
    #[error("upstream {target} unreachable: {source}")]
    UpstreamUnreachable {
        target: Url,
        #[source]
        source: reqwest::Error,
    },

    /// The upstream answered with something that is not usable HTTP, or the
    /// body stream broke off.
    #[error("upstream {target} protocol error: {source}")]
    UpstreamProtocol {
        target: Url,
        #[source]
        source: reqwest::Error,
    },

    /// Stat, put or URL resolution against the object store failed.
    #[error("object store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),

    /// A simple-index page grew past the configured bound.
    #[error("index page exceeds {limit} bytes")]
    IndexTooLarge { limit: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl MirrorError {
    /// Classify a `reqwest` failure against `target`.
    pub fn upstream(target: &Url, source: reqwest::Error) -> Self {
        if source.is_connect() || source.is_timeout() {
            MirrorError::UpstreamUnreachable {
                target: target.clone(),
                source,
            }
        } else {
            MirrorError::UpstreamProtocol {
                target: target.clone(),
                source,
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            MirrorError::UpstreamUnreachable { .. }
            | MirrorError::UpstreamProtocol { .. }
            | MirrorError::IndexTooLarge { .. } => StatusCode::BAD_GATEWAY,
            MirrorError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            MirrorError::Configuration(_) | MirrorError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
