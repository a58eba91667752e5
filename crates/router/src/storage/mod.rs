//! Routing table persistence
//!
//! The router depends only on the [`Storage`] capability. Concrete variants are
//! selected from configuration by [`create_storage`].

use crate::common::error::{Result, RouterError};
use crate::server::config::StorageKind;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

mod memory;

pub use memory::MemoryStorage;

/// Persistent routing table: host → targets, plus per-target activity
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Record the start of a request to `target`
    async fn request_begin(&self, target: &str) -> Result<()>;

    /// Record the end of a request to `target`
    async fn request_end(&self, target: &str) -> Result<()>;

    /// Add `target` to `host`, recording whether the target may be idled
    async fn target_add(&self, host: &str, target: &str, idles: bool) -> Result<()>;

    /// List the targets of `host` (exact match only)
    async fn target_list(&self, host: &str) -> Result<Vec<String>>;

    /// Remove `target` from `host`
    async fn target_remove(&self, host: &str, target: &str) -> Result<()>;

    /// Idle-eligible targets with no activity since `before`
    async fn stale(&self, before: DateTime<Utc>) -> Result<Vec<String>>;
}

/// Create the storage variant selected by configuration
pub fn create_storage(kind: &StorageKind) -> Result<Arc<dyn Storage>> {
    match kind {
        StorageKind::Memory => {
            info!("Using in-memory routing storage");
            Ok(Arc::new(MemoryStorage::new()))
        }
        other => Err(RouterError::Config(format!(
            "storage backend {other} is not available in this build"
        ))),
    }
}
