//! Per-mirror router assembly and the HTTP error type.
//!
//! Each listener gets its own [`MirrorState`] (shared handles plus the
//! mapping it serves) and the router of its protocol adapter.

use std::sync::Arc;

use axum::Router;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::AppState;
use crate::config::{MirrorMapping, Protocol};
use crate::error::MirrorError;
use crate::metrics::{MirrorLabels, Route, RouteLabels};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Everything a request handler on one listener needs.
pub struct MirrorState {
    pub app: AppState,
    pub mapping: MirrorMapping,
    labels: MirrorLabels,
}

impl MirrorState {
    pub fn new(app: AppState, mapping: MirrorMapping) -> Self {
        let labels = MirrorLabels {
            mirror: mapping.listen.to_string(),
        };
        Self {
            app,
            mapping,
            labels,
        }
    }

    pub fn labels(&self) -> &MirrorLabels {
        &self.labels
    }

    /// Count a request against `route`.
    pub fn record_route(&self, route: Route) {
        self.app
            .metrics
            .metrics
            .requests_total
            .get_or_create(&RouteLabels {
                mirror: self.labels.mirror.clone(),
                route,
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the router for `state`'s protocol.
pub fn create_router(state: Arc<MirrorState>) -> Router {
    match state.mapping.protocol {
        Protocol::ImageRegistry => super::registry::router(state),
        Protocol::PackageIndex => super::pypi::router(state),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Request failure rendered as a plain-text 5xx.
///
/// Handlers run inside an `#[instrument]` span carrying the mirror and path,
/// so the log line emitted here is correlated with the request.
#[derive(Debug)]
pub struct AppError(pub MirrorError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        error!(error = %self.0, %status, "request failed");
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.0.to_string(),
        )
            .into_response()
    }
}

impl From<MirrorError> for AppError {
    fn from(err: MirrorError) -> Self {
        AppError(err)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;
    use crate::testutil::body_bytes;

    #[tokio::test]
    async fn app_error_renders_plain_text_5xx() {
        let resp = AppError(MirrorError::IndexTooLarge { limit: 3 }).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = body_bytes(resp).await;
        assert_eq!(&body[..], b"index page exceeds 3 bytes");
    }
}
