use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ChecksumAlgorithm;
use tracing::{debug, instrument};

use super::ObjectStore;
use crate::cache::CacheKey;

/// Content type recorded on every cached artifact.
const OBJECT_CONTENT_TYPE: &str = "application/octet-stream";

/// S3-compatible bucket holding mirrored artifacts.
pub struct S3Store {
    pub client: Client,
    pub bucket: String,
    pub presigned_url_ttl: Duration,
    /// When set, redirects point at `{public_base_url}/{key}` instead of a
    /// pre-signed URL.
    pub public_base_url: Option<String>,
    /// Ask the store to verify a CRC32C checksum of the upload.
    pub checksum: bool,
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self), fields(bucket = %self.bucket, %key))]
    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(_) => {
                debug!("object exists");
                Ok(true)
            }
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    debug!("object does not exist");
                    Ok(false)
                } else {
                    Err(err).context("S3 HeadObject")
                }
            }
        }
    }

    #[instrument(skip(self, spool), fields(bucket = %self.bucket, %key))]
    async fn put(&self, key: &CacheKey, spool: &Path, length: u64) -> Result<()> {
        let body = ByteStream::from_path(spool)
            .await
            .with_context(|| format!("open spooled object: {}", spool.display()))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(OBJECT_CONTENT_TYPE)
            .content_length(i64::try_from(length).context("object too large")?)
            .body(body);

        if self.checksum {
            request = request.checksum_algorithm(ChecksumAlgorithm::Crc32C);
        }

        request.send().await.context("S3 PutObject")?;

        debug!("object uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, %key))]
    async fn download_url(&self, key: &CacheKey) -> Result<String> {
        if let Some(base) = &self.public_base_url {
            return Ok(public_url(base, key));
        }

        let presigning = PresigningConfig::builder()
            .expires_in(self.presigned_url_ttl)
            .build()
            .context("build PresigningConfig")?;

        let req = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .presigned(presigning)
            .await
            .context("generate presigned URL")?;

        Ok(req.uri().to_string())
    }

    async fn probe(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .context("S3 HeadBucket")?;
        Ok(())
    }
}

/// Join a public base URL and an object key.
fn public_url(base: &str, key: &CacheKey) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key)
}
