//! Router configuration

use crate::common::validation::{ValidateConfig, validators};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Environment variable prefix, e.g. `ROUTER_ACME__CONTACT`
const ENV_PREFIX: &str = "ROUTER";

/// Ingress router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Orchestration backend
    #[serde(default)]
    pub backend: BackendKind,
    /// Certificate cache variant
    #[serde(default)]
    pub cache: CacheKind,
    /// Routing table storage variant
    #[serde(default)]
    pub storage: StorageKind,
    /// Obtain public certificates over ACME instead of the backend CA
    #[serde(default)]
    pub autocert: bool,
    /// ACME settings, used when `autocert` is set
    #[serde(default)]
    pub acme: AcmeConfig,
    /// Local backend settings
    #[serde(default)]
    pub local: LocalConfig,
    /// Upstream DNS server (`host:port`); the system resolver when unset
    #[serde(default)]
    pub upstream: Option<String>,
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Orchestration backend selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Kubernetes,
}

/// Certificate cache selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Memory,
    Redis,
    Dynamodb,
}

/// Routing table storage selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Redis,
    Dynamodb,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKind::Memory => write!(f, "memory"),
            CacheKind::Redis => write!(f, "redis"),
            CacheKind::Dynamodb => write!(f, "dynamodb"),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Memory => write!(f, "memory"),
            StorageKind::Redis => write!(f, "redis"),
            StorageKind::Dynamodb => write!(f, "dynamodb"),
        }
    }
}

/// ACME configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// ACME directory URL
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    /// Account contact e-mail
    #[serde(default)]
    pub contact: Option<String>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: default_directory_url(),
            contact: None,
        }
    }
}

/// Local backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Router address answered on the internal DNS view
    #[serde(default = "default_ip")]
    pub internal_ip: String,
    /// Router address answered on the external DNS view
    #[serde(default = "default_ip")]
    pub external_ip: String,
    /// Routes loaded into the routing table at start-up
    #[serde(default)]
    pub routes: Vec<StaticRoute>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            internal_ip: default_ip(),
            external_ip: default_ip(),
            routes: Vec::new(),
        }
    }
}

/// A fixed `host` → `target` mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    /// Hostname or wildcard such as `*.example.com`
    pub host: String,
    /// Target URL, e.g. `http://10.0.0.5:8080`
    pub target: String,
    /// Whether the idle sweep may idle the target
    #[serde(default = "default_idles")]
    pub idles: bool,
}

fn default_idles() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_directory_url() -> String {
    LETS_ENCRYPT_DIRECTORY.to_string()
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            cache: CacheKind::default(),
            storage: StorageKind::default(),
            autocert: false,
            acme: AcmeConfig::default(),
            local: LocalConfig::default(),
            upstream: None,
            log_level: default_log_level(),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl RouterConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = builder.add_source(Config::try_from(&RouterConfig::default())?);

        let config_paths = [
            "router.toml",
            "config/router.toml",
            "/etc/ingress-router/router.toml",
        ];

        for path in &config_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(environment());

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from a specific config file
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Start with defaults
        builder = builder.add_source(Config::try_from(&RouterConfig::default())?);

        builder = builder.add_source(File::with_name(path));

        // Environment variables override file settings
        builder = builder.add_source(environment());

        let config = builder.build()?;
        config.try_deserialize()
    }
}

impl ValidateConfig for RouterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Message(format!(
                "log_level must be one of: {valid_log_levels:?}"
            )));
        }

        if self.backend == BackendKind::Local {
            validators::validate_ip(&self.local.internal_ip, "local.internal_ip")?;
            validators::validate_ip(&self.local.external_ip, "local.external_ip")?;

            for route in &self.local.routes {
                validators::validate_not_empty(&route.host, "local.routes.host")?;
                validators::validate_url(&route.target, "local.routes.target")?;
            }
        }

        if let Some(upstream) = &self.upstream {
            validators::validate_socket_addr(upstream, "upstream")?;
        }

        if self.autocert {
            validators::validate_url(&self.acme.directory_url, "acme.directory_url")?;

            let url = self.acme.directory_url.as_str();
            if !(url.starts_with("https://") || url.starts_with("http://localhost")) {
                return Err(ConfigError::Message(
                    "acme.directory_url must use https".to_string(),
                ));
            }

            if let Some(contact) = &self.acme.contact {
                validators::validate_email(contact, "acme.contact")?;
            }
        }

        Ok(())
    }
}
