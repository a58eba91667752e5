//! Orchestration backend contract
//!
//! The backend owns idle state and the certificate authority; the router only
//! reads and writes them through [`Backend`].

use crate::common::error::{Result, RouterError};
use crate::common::types::CaMaterial;
use crate::server::config::{BackendKind, RouterConfig};
use std::sync::Arc;
use tracing::info;

mod local;

pub use local::LocalBackend;

/// Control plane of the orchestration platform the router sits in front of
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Start background work the backend needs before traffic flows
    async fn start(&self) -> Result<()>;

    /// Address of the router as seen from inside the cluster
    fn internal_ip(&self) -> String;

    /// Address of the router as seen from outside the cluster
    fn external_ip(&self) -> String;

    /// Whether `target` is currently idled
    async fn idle_get(&self, target: &str) -> Result<bool>;

    /// Idle or wake `target`
    async fn idle_set(&self, target: &str, idle: bool) -> Result<()>;

    /// Root CA used for ad-hoc certificate issuance
    async fn ca(&self) -> Result<CaMaterial>;
}

/// Create the backend selected by configuration
pub fn create_backend(config: &RouterConfig) -> Result<Arc<dyn Backend>> {
    match config.backend {
        BackendKind::Local => {
            info!(
                internal_ip = %config.local.internal_ip,
                external_ip = %config.local.external_ip,
                "Using local backend"
            );
            Ok(Arc::new(LocalBackend::new(
                config.local.internal_ip.clone(),
                config.local.external_ip.clone(),
            )?))
        }
        ref other => Err(RouterError::Config(format!(
            "backend {other} is not available in this build"
        ))),
    }
}
