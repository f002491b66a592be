//! In-memory [`ObjectStore`] for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use bytes::Bytes;

use super::ObjectStore;
use crate::cache::CacheKey;

pub const MEMORY_STORE_BASE: &str = "http://store.test/mirror";

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Bytes>>,
    pub puts: AtomicUsize,
    /// Make `exists` fail, as an unreachable bucket would.
    pub fail_stat: AtomicBool,
    /// Make `put` fail.
    pub fail_put: AtomicBool,
}

impl MemoryStore {
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        if self.fail_stat.load(Ordering::SeqCst) {
            bail!("stat refused");
        }
        Ok(self.objects.lock().unwrap().contains_key(key.as_str()))
    }

    async fn put(&self, key: &CacheKey, spool: &Path, length: u64) -> Result<()> {
        if self.fail_put.load(Ordering::SeqCst) {
            bail!("put refused");
        }
        let data = tokio::fs::read(spool).await?;
        assert_eq!(data.len() as u64, length, "spooled length mismatch");
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .insert(key.as_str().to_owned(), Bytes::from(data));
        Ok(())
    }

    async fn download_url(&self, key: &CacheKey) -> Result<String> {
        Ok(format!("{MEMORY_STORE_BASE}/{key}"))
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}
