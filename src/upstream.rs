//! Upstream forwarder.
//!
//! Re-targets an inbound request at a mirror's upstream origin and relays the
//! upstream response back to the client without buffering.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, HttpBody as _};
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::MirrorError;

/// Headers that describe a single hop and never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Build the upstream URL for an inbound request target.
///
/// Only the origin's scheme, host and port are used; the inbound path and
/// query replace whatever path the origin carried.
pub fn upstream_url(origin: &Url, path_and_query: &str) -> Result<Url, MirrorError> {
    let target = format!("{}{}", origin.origin().ascii_serialization(), path_and_query);
    Url::parse(&target)
        .map_err(|e| MirrorError::Configuration(format!("bad upstream target {target}: {e}")))
}

/// Forward `request` to `origin` and return once response headers arrive.
///
/// The returned body is a lazy stream; dropping the response releases the
/// upstream connection.
#[instrument(skip(client, request), fields(method = %request.method(), uri = %request.uri()))]
pub async fn forward(
    client: &reqwest::Client,
    origin: &Url,
    request: Request,
) -> Result<reqwest::Response, MirrorError> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = upstream_url(origin, path_and_query)?;

    let mut builder = client
        .request(parts.method, url.clone())
        .headers(forwardable_headers(&parts.headers));

    if body.size_hint().exact() != Some(0) {
        builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    debug!(%url, "forwarding to upstream");
    builder
        .send()
        .await
        .map_err(|e| MirrorError::upstream(&url, e))
}

/// Copy request headers minus `Host` and hop-by-hop headers, including any
/// header the `Connection` header nominates.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let nominated = connection_tokens(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if name == header::HOST
            || HOP_BY_HOP.contains(&lower)
            || nominated.iter().any(|n| n == lower)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Copy upstream response headers into `dst`, skipping hop-by-hop headers and,
/// when `drop_length` is set, `Content-Length`.
pub fn copy_response_headers(src: &HeaderMap, dst: &mut HeaderMap, drop_length: bool) {
    for (name, value) in src {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if drop_length && name == header::CONTENT_LENGTH {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Relay an upstream response to the client.
///
/// A `304 Not Modified` is emitted with headers only.  Otherwise the body is
/// streamed through; a client that goes away mid-body is logged and has no
/// other effect.
pub fn relay(upstream: reqwest::Response, drop_length: bool) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::new();
    copy_response_headers(upstream.headers(), &mut headers, drop_length);

    if status == StatusCode::NOT_MODIFIED {
        return (status, headers).into_response();
    }

    let target = upstream.url().clone();
    let expected = upstream.content_length();
    let body = Delivery {
        inner: upstream
            .bytes_stream()
            .inspect_err(|e| warn!(error = %e, "upstream body read failed"))
            .boxed(),
        target,
        expected,
        sent: 0,
        complete: expected == Some(0),
    };

    (status, headers, Body::from_stream(body)).into_response()
}

/// Relayed body that logs when it is dropped before reaching its end.
///
/// hyper drops a length-delimited body as soon as the last byte is written,
/// without polling it to the end, so reaching the upstream's declared length
/// also counts as complete.
struct Delivery {
    inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    target: Url,
    expected: Option<u64>,
    sent: u64,
    complete: bool,
}

impl Stream for Delivery {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                self.sent += chunk.len() as u64;
                let sent = self.sent;
                if self.expected.is_some_and(|n| sent >= n) {
                    self.complete = true;
                }
            }
            Poll::Ready(None) => self.complete = true,
            _ => {}
        }
        polled
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.complete {
            warn!(
                upstream = %self.target,
                sent = self.sent,
                "response body not fully delivered to client"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::http::HeaderValue;
    use axum::routing::get;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::registry::Registry;

    use super::*;
    use crate::config::Protocol;
    use crate::http::handler::create_router;
    use crate::storage::memory::MemoryStore;
    use crate::testutil::{CapturedWarnings, mirror_state, spawn_upstream};

    const UNDELIVERED: &str = "response body not fully delivered to client";

    /// A registry mirror served over a real socket in front of `upstream`.
    async fn spawn_mirror(upstream: Router) -> Url {
        let origin = spawn_upstream(upstream).await;
        let state = mirror_state(
            Protocol::ImageRegistry,
            origin,
            Arc::new(MemoryStore::default()),
        );
        spawn_upstream(create_router(state)).await
    }

    #[tokio::test]
    async fn complete_deliveries_are_not_reported() {
        let warnings = CapturedWarnings::default();
        let _guard = tracing::subscriber::set_default(Registry::default().with(warnings.clone()));

        let upstream = Router::new()
            .route("/v2/x/manifests/latest", get(|| async { "{\"manifest\":1}" }))
            .route("/v2/x/blobs/{digest}", get(|| async { vec![3u8; 4096] }));
        let mirror = spawn_mirror(upstream).await;
        let client = reqwest::Client::new();

        // Length-delimited passthrough, then a chunked inline relay.
        for (path, len) in [("/v2/x/manifests/latest", 14), ("/v2/x/blobs/sha256:abcd", 4096)] {
            for _ in 0..3 {
                let body = client
                    .get(mirror.join(path).unwrap())
                    .send()
                    .await
                    .unwrap()
                    .bytes()
                    .await
                    .unwrap();
                assert_eq!(body.len(), len);
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(warnings.count(UNDELIVERED), 0);
    }

    #[tokio::test]
    async fn client_leaving_mid_body_is_reported_once() {
        let warnings = CapturedWarnings::default();
        let _guard = tracing::subscriber::set_default(Registry::default().with(warnings.clone()));

        let upstream = Router::new().route(
            "/v2/x/manifests/huge",
            get(|| async { vec![0u8; 32 * 1024 * 1024] }),
        );
        let mirror = spawn_mirror(upstream).await;

        let client = reqwest::Client::new();
        let mut resp = client
            .get(mirror.join("/v2/x/manifests/huge").unwrap())
            .send()
            .await
            .unwrap();
        assert!(resp.chunk().await.unwrap().is_some());
        drop(resp);
        drop(client);

        for _ in 0..250 {
            if warnings.count(UNDELIVERED) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(warnings.count(UNDELIVERED), 1);
    }

    #[test]
    fn upstream_url_replaces_scheme_and_host() {
        let origin = Url::parse("https://registry-1.docker.io").unwrap();
        let url = upstream_url(&origin, "/v2/library/ubuntu/manifests/latest?x=1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://registry-1.docker.io/v2/library/ubuntu/manifests/latest?x=1"
        );
    }

    #[test]
    fn upstream_url_keeps_explicit_port_and_drops_origin_path() {
        let origin = Url::parse("http://127.0.0.1:5000/ignored/").unwrap();
        let url = upstream_url(&origin, "/simple/requests/").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:5000/simple/requests/");
    }

    #[test]
    fn upstream_url_cannot_change_host() {
        let origin = Url::parse("https://pypi.org").unwrap();
        let url = upstream_url(&origin, "//evil.example/x").unwrap();
        assert_eq!(url.host_str(), Some("pypi.org"));
    }

    #[test]
    fn forwardable_headers_strip_host_and_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:1234"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let out = forwardable_headers(&headers);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("x-trace").is_none());
        assert_eq!(out.get(header::AUTHORIZATION).unwrap(), "Bearer t");
        assert_eq!(out.get(header::ACCEPT).unwrap(), "*/*");
    }

    #[test]
    fn copy_response_headers_can_drop_length() {
        let mut src = HeaderMap::new();
        src.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        src.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        src.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        src.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        src.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let mut kept = HeaderMap::new();
        copy_response_headers(&src, &mut kept, false);
        assert_eq!(kept.get(header::CONTENT_LENGTH).unwrap(), "12");
        assert!(kept.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(kept.get_all(header::SET_COOKIE).iter().count(), 2);

        let mut dropped = HeaderMap::new();
        copy_response_headers(&src, &mut dropped, true);
        assert!(dropped.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(dropped.get(header::CONTENT_TYPE).unwrap(), "text/html");
    }
}
