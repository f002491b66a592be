use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::error::MirrorError;

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub index: IndexConfig,
    /// Optional listener for `/healthz` and `/metrics`.
    #[serde(default)]
    pub admin_listen: Option<String>,
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
}

// ---------------------------------------------------------------------------
// Storage (S3 + local spool)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub s3: S3StorageConfig,
    /// Directory for spooling artifacts before upload.  Defaults to the OS
    /// temp directory.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Endpoint override for S3-compatible stores (e.g. `http://minio:9000`).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "bool_true")]
    pub force_path_style: bool,
    /// TTL (seconds) for pre-signed download URLs.
    #[serde(default = "default_presigned_url_ttl")]
    pub presigned_url_ttl: u64,
    /// Fixed public base URL; when set, redirects use it instead of
    /// pre-signed URLs.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Send a CRC32C checksum with every upload.
    #[serde(default = "bool_true")]
    pub checksum: bool,
}

fn bool_true() -> bool {
    true
}

fn default_presigned_url_ttl() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Upstream HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Per-read timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    300
}

fn default_user_agent() -> String {
    concat!("blobmirror/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Package index pages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Upper bound on a buffered simple-index page.
    #[serde(default = "default_max_index_bytes")]
    pub max_index_bytes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_index_bytes: default_max_index_bytes(),
        }
    }
}

fn default_max_index_bytes() -> usize {
    32 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Mirrors
// ---------------------------------------------------------------------------

/// Which upstream ecosystem a mirror speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// OCI / Docker registry v2.
    #[serde(alias = "docker", alias = "oci")]
    ImageRegistry,
    /// PEP 503 simple index plus `/packages/` downloads.
    #[serde(alias = "pip", alias = "pypi")]
    PackageIndex,
}

impl Protocol {
    pub fn default_namespace(self) -> &'static str {
        match self {
            Protocol::ImageRegistry => "docker",
            Protocol::PackageIndex => "pip",
        }
    }
}

impl FromStr for Protocol {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image-registry" | "docker" | "oci" => Ok(Protocol::ImageRegistry),
            "package-index" | "pip" | "pypi" => Ok(Protocol::PackageIndex),
            other => Err(MirrorError::Configuration(format!(
                "unknown mirror protocol: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MirrorConfig {
    /// Listen address; `:1234` means all interfaces.
    pub listen: String,
    /// Upstream origin, e.g. `https://registry-1.docker.io`.
    pub upstream: String,
    pub protocol: Protocol,
    /// Cache namespace; defaults per protocol.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl FromStr for MirrorConfig {
    type Err = MirrorError;

    /// Parse the `<listen>=<protocol>:<upstream>` shorthand, e.g.
    /// `:1234=docker:https://registry-1.docker.io`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (listen, rest) = s.split_once('=').ok_or_else(|| {
            MirrorError::Configuration(format!("mirror {s:?} must look like <listen>=<protocol>:<url>"))
        })?;
        let (protocol, upstream) = rest.split_once(':').ok_or_else(|| {
            MirrorError::Configuration(format!("mirror {s:?} is missing a protocol"))
        })?;
        Ok(MirrorConfig {
            listen: listen.trim().to_string(),
            upstream: upstream.trim().to_string(),
            protocol: protocol.trim().parse()?,
            namespace: None,
        })
    }
}

/// A validated mirror: one listener, one upstream, one cache namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorMapping {
    pub listen: SocketAddr,
    pub upstream: Url,
    pub protocol: Protocol,
    pub namespace: String,
}

impl MirrorConfig {
    pub fn to_mapping(&self) -> Result<MirrorMapping, MirrorError> {
        let listen = parse_listen(&self.listen)?;

        let upstream = Url::parse(&self.upstream).map_err(|e| {
            MirrorError::Configuration(format!("invalid upstream {:?}: {e}", self.upstream))
        })?;
        if !matches!(upstream.scheme(), "http" | "https") || upstream.host_str().is_none() {
            return Err(MirrorError::Configuration(format!(
                "upstream {:?} must be an http(s) URL with a host",
                self.upstream
            )));
        }

        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| self.protocol.default_namespace().to_string());

        Ok(MirrorMapping {
            listen,
            upstream,
            protocol: self.protocol,
            namespace,
        })
    }
}

/// Parse a listen address, treating a bare `:port` as `0.0.0.0:port`.
pub fn parse_listen(listen: &str) -> Result<SocketAddr, MirrorError> {
    let normalised = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };
    normalised
        .parse()
        .map_err(|e| MirrorError::Configuration(format!("invalid listen address {listen:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Validate `config` and resolve its mirrors into [`MirrorMapping`]s.
pub fn validate_config(config: &Config) -> Result<Vec<MirrorMapping>> {
    anyhow::ensure!(!config.mirrors.is_empty(), "no mirrors configured");
    anyhow::ensure!(
        !config.storage.s3.bucket.is_empty(),
        "storage.s3.bucket must not be empty"
    );
    anyhow::ensure!(
        config.storage.s3.presigned_url_ttl > 0,
        "storage.s3.presigned_url_ttl must be positive"
    );
    anyhow::ensure!(
        config.index.max_index_bytes > 0,
        "index.max_index_bytes must be positive"
    );

    let mut mappings: Vec<MirrorMapping> = Vec::with_capacity(config.mirrors.len());
    for mirror in &config.mirrors {
        let mapping = mirror
            .to_mapping()
            .with_context(|| format!("mirror {} => {}", mirror.listen, mirror.upstream))?;
        anyhow::ensure!(
            mappings.iter().all(|m| m.listen != mapping.listen),
            "listen address {} is used by more than one mirror",
            mapping.listen
        );
        mappings.push(mapping);
    }

    if let Some(admin) = &config.admin_listen {
        let admin = parse_listen(admin)?;
        anyhow::ensure!(
            mappings.iter().all(|m| m.listen != admin),
            "admin_listen {admin} collides with a mirror listener"
        );
    }

    Ok(mappings)
}
