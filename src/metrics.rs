use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Route {
    Blob,
    Passthrough,
    Packages,
    Simple,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub mirror: String,
    pub route: Route,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MirrorLabels {
    pub mirror: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the mirror.
pub struct Metrics {
    pub requests_total: Family<RouteLabels, Counter>,
    pub cache_hits: Family<MirrorLabels, Counter>,
    pub cache_misses: Family<MirrorLabels, Counter>,
    pub inline_responses: Family<MirrorLabels, Counter>,
    pub objects_stored: Family<MirrorLabels, Counter>,
    pub stored_bytes: Family<MirrorLabels, Counter>,
    pub upstream_errors: Family<MirrorLabels, Counter>,
}

impl Metrics {
    /// Create every metric and register it with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "blobmirror_requests",
            "Requests received by mirror and route",
            requests_total.clone(),
        );

        let cache_hits = Family::<MirrorLabels, Counter>::default();
        registry.register(
            "blobmirror_cache_hits",
            "Cacheable requests answered by redirect to an existing object",
            cache_hits.clone(),
        );

        let cache_misses = Family::<MirrorLabels, Counter>::default();
        registry.register(
            "blobmirror_cache_misses",
            "Cacheable requests that had to contact upstream",
            cache_misses.clone(),
        );

        let inline_responses = Family::<MirrorLabels, Counter>::default();
        registry.register(
            "blobmirror_inline_responses",
            "Cache misses relayed inline without storing",
            inline_responses.clone(),
        );

        let objects_stored = Family::<MirrorLabels, Counter>::default();
        registry.register(
            "blobmirror_objects_stored",
            "Objects written to the object store",
            objects_stored.clone(),
        );

        let stored_bytes = Family::<MirrorLabels, Counter>::default();
        registry.register(
            "blobmirror_stored_bytes",
            "Bytes written to the object store",
            stored_bytes.clone(),
        );

        let upstream_errors = Family::<MirrorLabels, Counter>::default();
        registry.register(
            "blobmirror_upstream_errors",
            "Requests that failed talking to upstream",
            upstream_errors.clone(),
        );

        Self {
            requests_total,
            cache_hits,
            cache_misses,
            inline_responses,
            objects_stored,
            stored_bytes,
            upstream_errors,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the registry and its metrics, carried in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
