//! Error types for the ingress router

use thiserror::Error;

/// Result type alias for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors that can occur while routing, proxying or answering DNS
#[derive(Debug, Error)]
pub enum RouterError {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No target matched any wildcard candidate
    #[error("no backends available")]
    NoBackends,

    /// The routing table could not be read while resolving a host
    #[error("error reaching backend")]
    BackendUnreachable,

    /// Storage collaborator rejected or failed an operation
    #[error("storage error: {0}")]
    Storage(String),

    /// Cache collaborator failed an operation
    #[error("cache error: {0}")]
    Cache(String),

    /// Orchestration backend failed an operation
    #[error("backend error: {0}")]
    Backend(String),

    /// Reading idle state from the backend failed
    #[error("could not fetch idle status: {0}")]
    IdleStatus(String),

    /// Waking an idle target failed
    #[error("could not unidle: {0}")]
    Unidle(String),

    /// No upstream DNS resolver is configured
    #[error("no upstream dns")]
    NoUpstream,

    /// DNS codec or resolver configuration error
    #[error("DNS error: {0}")]
    Dns(String),

    /// Certificate generation or parsing error
    #[error("certificate error: {0}")]
    Certificate(String),

    /// ACME protocol error
    #[error("ACME error: {0}")]
    Acme(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// Upstream proxy error
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rcgen::Error> for RouterError {
    fn from(e: rcgen::Error) -> Self {
        RouterError::Certificate(e.to_string())
    }
}

impl From<rustls::Error> for RouterError {
    fn from(e: rustls::Error) -> Self {
        RouterError::Tls(e.to_string())
    }
}

impl From<instant_acme::Error> for RouterError {
    fn from(e: instant_acme::Error) -> Self {
        RouterError::Acme(e.to_string())
    }
}

impl From<trust_dns_resolver::proto::error::ProtoError> for RouterError {
    fn from(e: trust_dns_resolver::proto::error::ProtoError) -> Self {
        RouterError::Dns(e.to_string())
    }
}

impl From<config::ConfigError> for RouterError {
    fn from(e: config::ConfigError) -> Self {
        RouterError::Config(e.to_string())
    }
}
