//! Ad-hoc certificates signed by the backend's certificate authority
//!
//! Leaf certificates are issued on the first handshake for a hostname and
//! memoized for the life of the process. Concurrent first handshakes for the
//! same hostname may each issue one; the last insert wins.

use super::CertificateProvisioner;
use super::authority::issue_leaf;
use crate::backend::Backend;
use crate::common::error::Result;
use dashmap::DashMap;
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Provisioner issuing leaf certificates from the backend CA
pub struct AdHocProvisioner {
    backend: Arc<dyn Backend>,
    /// Key: lowercase hostname
    certs: DashMap<String, Arc<CertifiedKey>>,
    /// Presented when the client sends no SNI
    fallback: Arc<CertifiedKey>,
}

impl AdHocProvisioner {
    pub fn new(backend: Arc<dyn Backend>, fallback: Arc<CertifiedKey>) -> Self {
        Self {
            backend,
            certs: DashMap::new(),
            fallback,
        }
    }

    /// Number of memoized certificates
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

#[async_trait::async_trait]
impl CertificateProvisioner for AdHocProvisioner {
    #[instrument(name = "adhoc_certificate", skip(self))]
    async fn certificate(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>> {
        let Some(host) = server_name.filter(|name| !name.is_empty()) else {
            return Ok(self.fallback.clone());
        };
        let host = host.to_ascii_lowercase();

        if let Some(cert) = self.certs.get(&host) {
            debug!("Using memoized certificate for {}", host);
            return Ok(cert.value().clone());
        }

        let ca = self.backend.ca().await?;
        let cert = issue_leaf(&host, &ca)?;

        info!("Issued certificate for {} from backend CA", host);
        self.certs.insert(host, cert.clone());

        Ok(cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::certs::authority::generate_authority;
    use crate::certs::selfsigned::router_certificate;
    use crate::common::error::RouterError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use x509_parser::prelude::*;

    fn leaf_names(key: &CertifiedKey) -> Vec<String> {
        let (_, cert) = X509Certificate::from_der(key.cert[0].as_ref()).unwrap();
        cert.subject_alternative_name()
            .unwrap()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some((*dns).to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_first_handshakes_then_cached() {
        let ca = generate_authority("Test CA").unwrap();

        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();

        let mut backend = MockBackend::new();
        backend.expect_ca().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ca.clone())
        });

        let provisioner = Arc::new(AdHocProvisioner::new(
            Arc::new(backend),
            router_certificate("ingress-router").unwrap(),
        ));

        let handshakes = (0..4).map(|_| {
            let provisioner = provisioner.clone();
            tokio::spawn(async move { provisioner.certificate(Some("new.example.com")).await })
        });

        for cert in futures::future::join_all(handshakes).await {
            let cert = cert.unwrap().unwrap();
            assert_eq!(leaf_names(&cert), vec!["new.example.com".to_string()]);
        }

        let concurrent_fetches = fetches.load(Ordering::SeqCst);
        assert!((1..=4).contains(&concurrent_fetches));

        // served from the table without another CA fetch
        let later = provisioner
            .certificate(Some("new.example.com"))
            .await
            .unwrap();
        assert_eq!(leaf_names(&later), vec!["new.example.com".to_string()]);
        assert_eq!(fetches.load(Ordering::SeqCst), concurrent_fetches);
        assert_eq!(provisioner.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_sni_uses_fallback() {
        let mut backend = MockBackend::new();
        backend.expect_ca().never();

        let fallback = router_certificate("ingress-router").unwrap();
        let provisioner = AdHocProvisioner::new(Arc::new(backend), fallback.clone());

        let cert = provisioner.certificate(None).await.unwrap();
        assert!(Arc::ptr_eq(&cert, &fallback));

        let cert = provisioner.certificate(Some("")).await.unwrap();
        assert!(Arc::ptr_eq(&cert, &fallback));
        assert!(provisioner.is_empty());
    }

    #[tokio::test]
    async fn test_ca_failure_is_returned() {
        let mut backend = MockBackend::new();
        backend
            .expect_ca()
            .times(1)
            .returning(|| Err(RouterError::Backend("secret not found".into())));

        let provisioner = AdHocProvisioner::new(
            Arc::new(backend),
            router_certificate("ingress-router").unwrap(),
        );

        let err = provisioner
            .certificate(Some("app.example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Backend(_)));
        assert!(provisioner.is_empty());
    }
}
