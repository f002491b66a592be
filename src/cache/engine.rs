//! Cache-aside decision engine.
//!
//! Per cacheable request:
//!
//! ```text
//! CHECK ──hit──▶ REDIRECT
//!   │
//!  miss
//!   ▼
//! FETCH ──304──────────────▶ relay headers, no body
//!   ├──non-200 / < 1 MiB───▶ relay inline, never stored
//!   └──≥ 1 MiB / unknown───▶ STORE ──▶ REDIRECT
//! ```
//!
//! There is no single-flight: concurrent misses for one key each fetch and
//! store the same bytes, and the last write wins.

use std::path::Path;

use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use futures::StreamExt;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::key::{CacheKey, derive_key};
use crate::error::MirrorError;
use crate::http::handler::MirrorState;
use crate::storage::ObjectStore;
use crate::upstream::{forward, relay};

/// Responses declaring fewer bytes than this are relayed inline.
pub const INLINE_THRESHOLD: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Inline,
    Store,
}

/// Choose between inline relay and store-then-redirect.
///
/// Only complete `200 OK` bodies are cached; partial content and error pages
/// would otherwise be served for every later request of the same key.  An
/// unknown length is treated as large so it is never held in memory.
fn plan(status: StatusCode, declared: Option<u64>) -> Plan {
    if status != StatusCode::OK {
        return Plan::Inline;
    }
    match declared {
        Some(len) if len < INLINE_THRESHOLD => Plan::Inline,
        _ => Plan::Store,
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Serve a cacheable request through the object store.
#[instrument(skip_all, fields(key = tracing::field::Empty))]
pub async fn serve_cached(state: &MirrorState, request: Request) -> Result<Response, MirrorError> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let key = derive_key(&state.mapping.namespace, path_and_query);
    tracing::Span::current().record("key", tracing::field::display(&key));

    let metrics = &state.app.metrics.metrics;
    let labels = state.labels();
    let store = state.app.store.as_ref();

    // ---------- CHECK ----------
    match store.exists(&key).await {
        Ok(true) => {
            info!("cache hit");
            metrics.cache_hits.get_or_create(labels).inc();
            return redirect(store, &key).await;
        }
        Ok(false) => debug!("cache miss"),
        Err(e) => warn!(error = %format!("{e:#}"), "stat failed, treating as cache miss"),
    }
    metrics.cache_misses.get_or_create(labels).inc();

    // ---------- FETCH ----------
    let upstream = forward(&state.app.http_client, &state.mapping.upstream, request)
        .await
        .inspect_err(|_| {
            metrics.upstream_errors.get_or_create(labels).inc();
        })?;

    let status = upstream.status();
    if status == StatusCode::NOT_MODIFIED {
        debug!("upstream not modified");
        return Ok(relay(upstream, false));
    }

    let declared = declared_length(upstream.headers());
    if plan(status, declared) == Plan::Inline {
        info!(%status, ?declared, "relaying inline");
        metrics.inline_responses.get_or_create(labels).inc();
        return Ok(relay(upstream, true));
    }

    // ---------- STORE ----------
    let (spool, length) = spool_body(upstream, &state.app.spool_dir)
        .await
        .inspect_err(|_| {
            metrics.upstream_errors.get_or_create(labels).inc();
        })?;

    store
        .put(&key, &spool, length)
        .await
        .map_err(MirrorError::StoreUnavailable)?;
    drop(spool);

    info!(length, "object stored");
    metrics.objects_stored.get_or_create(labels).inc();
    metrics.stored_bytes.get_or_create(labels).inc_by(length);

    redirect(store, &key).await
}

/// `307 Temporary Redirect` to the store's download address for `key`.
async fn redirect(store: &dyn ObjectStore, key: &CacheKey) -> Result<Response, MirrorError> {
    let url = store
        .download_url(key)
        .await
        .map_err(MirrorError::StoreUnavailable)?;
    Ok(Redirect::temporary(&url).into_response())
}

/// Stream the upstream body into a temp file under `dir`.
///
/// The file is removed when the returned [`TempPath`] drops, on success and
/// on every error path.  hyper fails the body stream when a length-delimited
/// body ends short, so a broken transfer surfaces here as an upstream error
/// and never reaches the store.
async fn spool_body(
    upstream: reqwest::Response,
    dir: &Path,
) -> Result<(TempPath, u64), MirrorError> {
    let target = upstream.url().clone();
    let (file, path) = tempfile::Builder::new()
        .prefix(".blob-")
        .suffix(".part")
        .tempfile_in(dir)?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut received: u64 = 0;
    let mut stream = upstream.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| MirrorError::upstream(&target, e))?;
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    debug!(path = %path.display(), received, "upstream body spooled");
    Ok((path, received))
}
