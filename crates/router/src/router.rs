//! Route resolution, target management and idle hooks
//!
//! [`Router`] is the context object shared by every listener. It owns the
//! routing storage, the orchestration backend and the certificate provisioner.

use crate::backend::{Backend, create_backend};
use crate::cache::create_cache;
use crate::certs::{CertificateProvisioner, create_provisioner};
use crate::common::error::{Result, RouterError};
use crate::idle::IdleSweeper;
use crate::server::config::{BackendKind, RouterConfig, StaticRoute};
use crate::storage::{Storage, create_storage};
use rand::seq::SliceRandom;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Port appended to the system resolver's nameserver
const UPSTREAM_DNS_PORT: u16 = 53;

/// Routing context shared by the DNS, HTTP and HTTPS listeners
pub struct Router {
    storage: Arc<dyn Storage>,
    backend: Arc<dyn Backend>,
    provisioner: Arc<dyn CertificateProvisioner>,
    /// Overrides the system resolver configuration
    upstream: Option<String>,
    /// Loaded by [`Router::start`]
    routes: Vec<StaticRoute>,
}

impl Router {
    /// Build the router and its collaborators from configuration
    pub fn new(config: &RouterConfig) -> Result<Self> {
        let storage = create_storage(&config.storage)?;
        let cache = create_cache(&config.cache)?;
        let backend = create_backend(config)?;
        let provisioner = create_provisioner(config, backend.clone(), cache)?;

        let router = Self::from_parts(storage, backend, provisioner, config.upstream.clone());

        Ok(if config.backend == BackendKind::Local {
            router.with_routes(config.local.routes.clone())
        } else {
            router
        })
    }

    /// Assemble a router from already constructed collaborators
    pub fn from_parts(
        storage: Arc<dyn Storage>,
        backend: Arc<dyn Backend>,
        provisioner: Arc<dyn CertificateProvisioner>,
        upstream: Option<String>,
    ) -> Self {
        Self {
            storage,
            backend,
            provisioner,
            upstream,
            routes: Vec::new(),
        }
    }

    /// Routes to add when the router starts
    pub fn with_routes(mut self, routes: Vec<StaticRoute>) -> Self {
        self.routes = routes;
        self
    }

    /// Start the backend and load static routes before any listener accepts traffic
    pub async fn start(&self) -> Result<()> {
        info!("Starting backend");
        self.backend.start().await?;

        for route in &self.routes {
            self.target_add(&route.host, &route.target, route.idles)
                .await?;
        }
        if !self.routes.is_empty() {
            info!("Loaded {} static routes", self.routes.len());
        }

        Ok(())
    }

    pub fn provisioner(&self) -> Arc<dyn CertificateProvisioner> {
        self.provisioner.clone()
    }

    /// Idle sweeper over this router's storage and backend
    pub fn sweeper(&self) -> IdleSweeper {
        IdleSweeper::new(self.storage.clone(), self.backend.clone())
    }

    #[instrument(skip(self))]
    pub async fn target_add(&self, host: &str, target: &str, idles: bool) -> Result<()> {
        info!("Adding target");
        self.storage
            .target_add(&normalize_host(host), target, idles)
            .await
    }

    #[instrument(skip(self))]
    pub async fn target_remove(&self, host: &str, target: &str) -> Result<()> {
        info!("Removing target");
        self.storage
            .target_remove(&normalize_host(host), target)
            .await
    }

    /// Targets registered for exactly `host`
    pub async fn target_list(&self, host: &str) -> Result<Vec<String>> {
        debug!(host, "Listing targets");
        self.storage.target_list(&normalize_host(host)).await
    }

    /// Resolve `host` to one of its targets, descending through wildcards
    pub async fn route(&self, host: &str) -> Result<String> {
        debug!(host, "Resolving route");

        for candidate in route_candidates(host) {
            let targets = self.target_list(&candidate).await.map_err(|e| {
                warn!(host, candidate = %candidate, "Failed to list targets: {}", e);
                RouterError::BackendUnreachable
            })?;

            let chosen = targets.choose(&mut rand::thread_rng()).cloned();
            if let Some(target) = chosen {
                debug!(host, candidate = %candidate, target = %target, "Route resolved");
                return Ok(target);
            }
        }

        Err(RouterError::NoBackends)
    }

    /// Record the start of a request and wake the target if it is idle
    #[instrument(skip(self))]
    pub async fn request_begin(&self, target: &str) -> Result<()> {
        self.storage.request_begin(target).await?;

        let idle = self
            .backend
            .idle_get(target)
            .await
            .map_err(|e| RouterError::IdleStatus(e.to_string()))?;

        if idle {
            info!("Waking idle target");
            self.backend
                .idle_set(target, false)
                .await
                .map_err(|e| RouterError::Unidle(e.to_string()))?;
        }

        Ok(())
    }

    /// Record the end of a request
    #[instrument(skip(self))]
    pub async fn request_end(&self, target: &str) -> Result<()> {
        self.storage.request_end(target).await
    }

    /// Address of the router for the internal or external view
    pub fn router_ip(&self, internal: bool) -> String {
        if internal {
            self.backend.internal_ip()
        } else {
            self.backend.external_ip()
        }
    }

    /// Upstream DNS resolver used for names the router does not serve
    pub fn upstream(&self) -> Result<SocketAddr> {
        if let Some(upstream) = &self.upstream {
            return upstream
                .parse()
                .map_err(|e| RouterError::Dns(format!("invalid upstream {upstream}: {e}")));
        }

        let (config, _opts) = trust_dns_resolver::system_conf::read_system_conf()
            .map_err(|e| RouterError::Dns(format!("could not read resolver config: {e}")))?;

        config
            .name_servers()
            .first()
            .map(|ns| SocketAddr::new(ns.socket_addr.ip(), UPSTREAM_DNS_PORT))
            .ok_or(RouterError::NoUpstream)
    }
}

/// Routing table key for `host`: lower-cased, without the root dot
fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Hostnames consulted for `host`, most specific first.
///
/// `app.example.com` yields `app.example.com`, `*.example.com`, `*.com`.
/// A literal IP address is its only candidate.
pub fn route_candidates(host: &str) -> Vec<String> {
    let host = normalize_host(host);

    if host.is_empty() {
        return Vec::new();
    }

    if host.parse::<IpAddr>().is_ok() {
        return vec![host];
    }

    let labels: Vec<&str> = host.split('.').collect();
    let mut candidates = Vec::with_capacity(labels.len());
    candidates.push(host.clone());

    for i in 1..labels.len() {
        candidates.push(format!("*.{}", labels[i..].join(".")));
    }

    candidates
}
