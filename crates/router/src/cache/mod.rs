//! Certificate blob cache used by the automated certificate manager

use crate::common::error::{Result, RouterError};
use crate::server::config::CacheKind;
use std::sync::Arc;
use tracing::info;

mod memory;

pub use memory::MemoryCache;

/// Key/value cache for certificates and ACME account credentials
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    /// Fetch the blob stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `data` under `key`, replacing any previous value
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Remove the blob stored under `key`; missing keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Create the cache variant selected by configuration
pub fn create_cache(kind: &CacheKind) -> Result<Arc<dyn Cache>> {
    match kind {
        CacheKind::Memory => {
            info!("Using in-memory certificate cache");
            Ok(Arc::new(MemoryCache::new()))
        }
        other => Err(RouterError::Config(format!(
            "cache backend {other} is not available in this build"
        ))),
    }
}
