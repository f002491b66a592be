//! Image-registry (OCI / Docker v2) adapter.
//!
//! `GET …/blobs/<algorithm>:<digest>` goes through the cache engine; every
//! other request (manifests, tag lists, the `/v2/` probe, uploads) is passed
//! straight through to the upstream registry.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::response::Response;
use tracing::{info, instrument};

use super::handler::{AppError, MirrorState};
use crate::cache::engine::serve_cached;
use crate::metrics::Route;
use crate::upstream::{forward, relay};

pub fn router(state: Arc<MirrorState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

#[instrument(
    skip_all,
    fields(mirror = %state.mapping.listen, method = %request.method(), path = %request.uri())
)]
async fn handle(
    State(state): State<Arc<MirrorState>>,
    request: Request,
) -> Result<Response, AppError> {
    if request.method() == Method::GET && is_blob_path(request.uri().path()) {
        info!(upstream = %state.mapping.upstream, "blob cache");
        state.record_route(Route::Blob);
        return Ok(serve_cached(&state, request).await?);
    }

    info!(upstream = %state.mapping.upstream, "proxy");
    state.record_route(Route::Passthrough);
    let upstream = forward(&state.app.http_client, &state.mapping.upstream, request).await?;
    Ok(relay(upstream, false))
}

/// Whether `path` addresses a content-addressed layer blob, i.e. contains a
/// `/blobs/<algorithm>:<digest>` segment.
///
/// `/blobs/uploads/…` (push sessions) carries no digest and is not a blob.
pub fn is_blob_path(path: &str) -> bool {
    path.match_indices("/blobs/").any(|(idx, marker)| {
        let segment = path[idx + marker.len()..].split('/').next().unwrap_or("");
        match segment.split_once(':') {
            Some((algorithm, digest)) => {
                !algorithm.is_empty()
                    && !digest.is_empty()
                    && algorithm
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '_' | '-'))
            }
            None => false,
        }
    })
}
