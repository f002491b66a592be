//! Shared fixtures for handler and engine tests: a local axum "upstream" and
//! mirror state backed by an in-memory object store.

use std::fmt;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::response::Response;
use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use url::Url;

use crate::AppState;
use crate::config::{IndexConfig, MirrorMapping, Protocol};
use crate::http::handler::MirrorState;
use crate::metrics::MetricsRegistry;
use crate::storage::memory::MemoryStore;

/// Serve `router` on an ephemeral local port and return its origin.
pub async fn spawn_upstream(router: Router) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{addr}")).unwrap()
}

/// An origin nothing listens on.
pub async fn closed_origin() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{addr}")).unwrap()
}

pub fn app_state(store: Arc<MemoryStore>, max_index_bytes: usize) -> AppState {
    AppState {
        http_client: reqwest::Client::new(),
        store,
        metrics: MetricsRegistry::new(),
        spool_dir: std::env::temp_dir(),
        index: IndexConfig { max_index_bytes },
    }
}

pub fn mirror_state(
    protocol: Protocol,
    upstream: Url,
    store: Arc<MemoryStore>,
) -> Arc<MirrorState> {
    mirror_state_with(protocol, upstream, store, IndexConfig::default().max_index_bytes)
}

pub fn mirror_state_with(
    protocol: Protocol,
    upstream: Url,
    store: Arc<MemoryStore>,
    max_index_bytes: usize,
) -> Arc<MirrorState> {
    let mapping = MirrorMapping {
        listen: "127.0.0.1:0".parse().unwrap(),
        upstream,
        protocol,
        namespace: protocol.default_namespace().to_string(),
    };
    Arc::new(MirrorState::new(app_state(store, max_index_bytes), mapping))
}

pub async fn body_bytes(resp: Response) -> Bytes {
    axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap()
}

/// Tracing layer that keeps the message of every `WARN` or `ERROR` event.
///
/// Install with `tracing::subscriber::set_default` on a current-thread
/// runtime so tasks spawned by the test are captured too.
#[derive(Clone, Default)]
pub struct CapturedWarnings(Arc<Mutex<Vec<String>>>);

impl CapturedWarnings {
    pub fn count(&self, message: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|m| *m == message).count()
    }
}

impl<S: Subscriber> Layer<S> for CapturedWarnings {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.0.lock().unwrap().push(message);
        }
    }
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}
