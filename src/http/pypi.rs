//! Python package-index (PEP 503) adapter.
//!
//! - `/packages/…` downloads are cacheable and go through the cache engine.
//! - `/simple/…` index pages are always fetched fresh and rewritten so that
//!   absolute links to the canonical PyPI hosts become mirror-relative.
//! - Bare `/simple` and `/packages` redirect to their trailing-slash form.
//!
//! `Accept-Encoding` is stripped on both routes so upstream sends identity
//! bodies whose length is meaningful and whose text can be rewritten.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, info, instrument};
use url::Url;

use super::handler::{AppError, MirrorState};
use crate::cache::engine::serve_cached;
use crate::error::MirrorError;
use crate::metrics::Route;
use crate::upstream::{copy_response_headers, forward, relay};

/// Absolute URL prefixes removed from simple-index pages.
const CANONICAL_HOSTS: &[&str] = &["https://files.pythonhosted.org", "https://pypi.org"];

pub fn router(state: Arc<MirrorState>) -> Router {
    Router::new()
        .route("/packages", any(add_trailing_slash))
        .route("/packages/{*rest}", any(handle_package))
        .route("/simple", any(add_trailing_slash))
        .route("/simple/", any(handle_simple))
        .route("/simple/{*rest}", any(handle_simple))
        .with_state(state)
}

#[instrument(
    skip_all,
    fields(mirror = %state.mapping.listen, method = %request.method(), path = %request.uri())
)]
async fn handle_package(
    State(state): State<Arc<MirrorState>>,
    mut request: Request,
) -> Result<Response, AppError> {
    request.headers_mut().remove(header::ACCEPT_ENCODING);

    if request.method() != Method::GET {
        info!(upstream = %state.mapping.upstream, "package proxy");
        state.record_route(Route::Passthrough);
        let upstream = forward(&state.app.http_client, &state.mapping.upstream, request).await?;
        return Ok(relay(upstream, false));
    }

    info!(upstream = %state.mapping.upstream, "package cache");
    state.record_route(Route::Packages);
    Ok(serve_cached(&state, request).await?)
}

#[instrument(
    skip_all,
    fields(mirror = %state.mapping.listen, method = %request.method(), path = %request.uri())
)]
async fn handle_simple(
    State(state): State<Arc<MirrorState>>,
    mut request: Request,
) -> Result<Response, AppError> {
    info!(upstream = %state.mapping.upstream, "simple proxy");
    state.record_route(Route::Simple);
    request.headers_mut().remove(header::ACCEPT_ENCODING);

    let upstream = forward(&state.app.http_client, &state.mapping.upstream, request).await?;
    let status = upstream.status();
    let mut headers = HeaderMap::new();
    copy_response_headers(upstream.headers(), &mut headers, true);

    if status == StatusCode::NOT_MODIFIED {
        return Ok((status, headers).into_response());
    }

    let body = read_bounded(upstream, state.app.index.max_index_bytes).await?;
    let rewritten = rewrite_index(&body, &rewrite_prefixes(&state.mapping.upstream));
    debug!(
        original = body.len(),
        rewritten = rewritten.len(),
        "index page rewritten"
    );

    Ok((status, headers, rewritten).into_response())
}

/// `301` from a bare subtree root to its trailing-slash form, keeping the query.
async fn add_trailing_slash(uri: Uri) -> Response {
    let location = match uri.query() {
        Some(query) => format!("{}/?{query}", uri.path()),
        None => format!("{}/", uri.path()),
    };
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
}

/// Prefixes to strip for a mirror of `upstream`: the canonical PyPI hosts
/// plus the upstream's own origin.
fn rewrite_prefixes(upstream: &Url) -> Vec<String> {
    let mut prefixes: Vec<String> = CANONICAL_HOSTS.iter().map(|h| h.to_string()).collect();
    let origin = upstream.origin().ascii_serialization();
    if !prefixes.contains(&origin) {
        prefixes.push(origin);
    }
    prefixes
}

/// Read the whole upstream body, failing once it exceeds `limit` bytes.
async fn read_bounded(upstream: reqwest::Response, limit: usize) -> Result<Bytes, MirrorError> {
    let target = upstream.url().clone();
    if upstream
        .content_length()
        .is_some_and(|len| len > limit as u64)
    {
        return Err(MirrorError::IndexTooLarge { limit });
    }

    let mut body = BytesMut::new();
    let mut stream = upstream.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| MirrorError::upstream(&target, e))?;
        if body.len() + chunk.len() > limit {
            return Err(MirrorError::IndexTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// Remove every occurrence of each prefix from `body`, in order.
fn rewrite_index(body: &[u8], prefixes: &[String]) -> Bytes {
    let mut out = body.to_vec();
    for prefix in prefixes {
        out = strip_all(&out, prefix.as_bytes());
    }
    Bytes::from(out)
}

fn strip_all(haystack: &[u8], needle: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.windows(needle.len()).position(|w| w == needle) {
        out.extend_from_slice(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}
