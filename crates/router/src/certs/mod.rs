//! TLS certificate provisioning
//!
//! Two interchangeable strategies pick the certificate for each TLS handshake:
//! - [`AcmeProvisioner`]: public certificates from an ACME CA, stored in the cache
//! - [`AdHocProvisioner`]: leaf certificates signed on demand by the backend's CA

use crate::backend::Backend;
use crate::cache::Cache;
use crate::common::error::Result;
use crate::server::config::RouterConfig;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use tracing::info;

pub mod acme;
pub mod adhoc;
pub mod authority;
pub mod selfsigned;

pub use acme::AcmeProvisioner;
pub use adhoc::AdHocProvisioner;

/// Identity of the router's own fallback certificate
pub const ROUTER_IDENTITY: &str = "ingress-router";

/// Source of the certificate presented for a TLS handshake
#[async_trait::async_trait]
pub trait CertificateProvisioner: Send + Sync {
    /// Certificate for the SNI name of a handshake; `None` for bare-IP clients
    async fn certificate(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>>;

    /// Whether ACME HTTP-01 challenges are answered on the plain HTTP listener
    fn serves_challenges(&self) -> bool {
        false
    }

    /// Key authorization for a pending HTTP-01 challenge token
    fn challenge_response(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Create the provisioner selected by configuration
pub fn create_provisioner(
    config: &RouterConfig,
    backend: Arc<dyn Backend>,
    cache: Arc<dyn Cache>,
) -> Result<Arc<dyn CertificateProvisioner>> {
    let fallback = selfsigned::router_certificate(ROUTER_IDENTITY)?;

    if config.autocert {
        info!(
            directory = %config.acme.directory_url,
            "Using automated ACME certificates"
        );
        Ok(Arc::new(AcmeProvisioner::new(
            cache,
            config.acme.directory_url.clone(),
            config.acme.contact.clone(),
            fallback,
        )))
    } else {
        info!("Using ad-hoc certificates from the backend CA");
        Ok(Arc::new(AdHocProvisioner::new(backend, fallback)))
    }
}

/// Pair a DER certificate chain with its private key for rustls
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Resolver presenting one certificate chosen before the handshake continues
#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Build the per-connection TLS configuration presenting `key`
pub fn server_config(key: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertResolver(key)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_advertises_h2_and_http1() {
        let key = selfsigned::router_certificate(ROUTER_IDENTITY).unwrap();
        let config = server_config(key).unwrap();

        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }
}
