//! Backend for running the router outside an orchestration platform
//!
//! Router addresses come from configuration, idle state lives in process and
//! the certificate authority is generated when the backend is created.

use super::Backend;
use crate::certs::authority::generate_authority;
use crate::common::error::Result;
use crate::common::types::{CaMaterial, parse_target};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Organisation name of the generated certificate authority
const CA_NAME: &str = "Ingress Router Local CA";

/// Standalone backend with in-process idle state
#[derive(Clone)]
pub struct LocalBackend {
    internal_ip: String,
    external_ip: String,
    /// Key: `app/service` for internal service targets, the target otherwise
    idle: Arc<DashMap<String, bool>>,
    ca: CaMaterial,
}

impl LocalBackend {
    /// Create a local backend with a freshly generated CA
    pub fn new(internal_ip: String, external_ip: String) -> Result<Self> {
        let ca = generate_authority(CA_NAME)?;

        Ok(Self {
            internal_ip,
            external_ip,
            idle: Arc::new(DashMap::new()),
            ca,
        })
    }

    /// Targets of the same service share one idle state, like a deployment
    /// scaled as a whole.
    fn idle_key(target: &str) -> String {
        match parse_target(target) {
            Some((service, app)) => format!("{app}/{service}"),
            None => target.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Backend for LocalBackend {
    async fn start(&self) -> Result<()> {
        info!("Local backend started");
        Ok(())
    }

    fn internal_ip(&self) -> String {
        self.internal_ip.clone()
    }

    fn external_ip(&self) -> String {
        self.external_ip.clone()
    }

    async fn idle_get(&self, target: &str) -> Result<bool> {
        let key = Self::idle_key(target);
        Ok(self.idle.get(&key).is_some_and(|idle| *idle))
    }

    async fn idle_set(&self, target: &str, idle: bool) -> Result<()> {
        let key = Self::idle_key(target);
        debug!("Setting idle={} for {}", idle, key);
        self.idle.insert(key, idle);
        Ok(())
    }

    async fn ca(&self) -> Result<CaMaterial> {
        Ok(self.ca.clone())
    }
}
