mod cache;
mod config;
mod error;
mod health;
mod http;
mod metrics;
mod storage;
mod supervisor;
mod upstream;

#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, IndexConfig, MirrorConfig};
use crate::http::handler::{MirrorState, create_router};
use crate::metrics::MetricsRegistry;
use crate::storage::ObjectStore;
use crate::storage::s3::S3Store;
use crate::supervisor::Listener;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "blobmirror",
    about = "Cache-aside redirecting mirror for container registries and Python indexes"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/blobmirror/config.yaml")]
    config: String,

    /// Additional mirror, e.g. `:1234=docker:https://registry-1.docker.io`.
    /// May be repeated.
    #[arg(long = "mirror", value_name = "LISTEN=PROTOCOL:URL")]
    mirrors: Vec<MirrorConfig>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Process-wide handles, built once at startup and read-only afterwards.
#[derive(Clone)]
pub struct AppState {
    pub http_client: reqwest::Client,
    pub store: Arc<dyn ObjectStore>,
    pub metrics: MetricsRegistry,
    /// Where cache misses are spooled before upload.
    pub spool_dir: PathBuf,
    pub index: IndexConfig,
}

// ---------------------------------------------------------------------------
// S3 client setup
// ---------------------------------------------------------------------------

async fn build_s3_store(config: &Config) -> Result<S3Store> {
    let s3 = &config.storage.s3;
    let aws_config = aws_config::from_env()
        .region(aws_config::Region::new(s3.region.clone()))
        .load()
        .await;

    let mut builder =
        aws_sdk_s3::config::Builder::from(&aws_config).force_path_style(s3.force_path_style);
    if let Some(endpoint) = &s3.endpoint {
        builder = builder.endpoint_url(endpoint);
    }

    let client = aws_sdk_s3::Client::from_conf(builder.build());
    tracing::info!(
        bucket = %s3.bucket,
        region = %s3.region,
        endpoint = ?s3.endpoint,
        public_base_url = ?s3.public_base_url,
        "S3 client initialised"
    );

    Ok(S3Store {
        client,
        bucket: s3.bucket.clone(),
        presigned_url_ttl: Duration::from_secs(s3.presigned_url_ttl),
        public_base_url: s3.public_base_url.clone(),
        checksum: s3.checksum,
    })
}

fn build_http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(&config.upstream.user_agent)
        .connect_timeout(Duration::from_secs(config.upstream.connect_timeout))
        .read_timeout(Duration::from_secs(config.upstream.read_timeout))
        .build()
        .context("failed to build reqwest client")
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = config::load_config(&cli.config)?;
    config.mirrors.extend(cli.mirrors);
    let mappings = config::validate_config(&config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, mirrors = mappings.len(), "starting blobmirror");

    // ---- Spool directory ----
    let spool_dir = config.storage.spool_dir();
    tokio::fs::create_dir_all(&spool_dir)
        .await
        .with_context(|| format!("failed to create spool dir: {}", spool_dir.display()))?;

    // ---- Infrastructure clients ----
    let store = build_s3_store(&config).await?;
    let http_client = build_http_client(&config)?;

    // ---- App state ----
    let state = AppState {
        http_client,
        store: Arc::new(store),
        metrics: MetricsRegistry::new(),
        spool_dir,
        index: config.index.clone(),
    };

    // ---- Listeners ----
    let mut listeners: Vec<Listener> = mappings
        .into_iter()
        .map(|mapping| {
            let name = format!(
                "{} => {} ({:?})",
                mapping.listen, mapping.upstream, mapping.protocol
            );
            tracing::info!(mirror = %name, namespace = %mapping.namespace, "mirror configured");
            Listener {
                name,
                addr: mapping.listen,
                router: create_router(Arc::new(MirrorState::new(state.clone(), mapping))),
            }
        })
        .collect();

    if let Some(admin) = &config.admin_listen {
        listeners.push(Listener {
            name: "admin".to_string(),
            addr: config::parse_listen(admin)?,
            router: health::admin_router(state.clone()),
        });
    }

    // ---- Run until a listener dies or a signal arrives ----
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                () = shutdown_signal() => shutdown.cancel(),
                () = shutdown.cancelled() => {}
            }
        }
    });

    supervisor::run(listeners, shutdown).await?;

    tracing::info!("blobmirror shut down cleanly");
    Ok(())
}
