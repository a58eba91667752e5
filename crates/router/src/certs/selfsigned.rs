//! Self-signed certificate for the router's own identity
//!
//! Presented to clients that connect without SNI, typically by bare IP.

use super::certified_key;
use crate::common::error::Result;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::PrivateKeyDer;
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::info;

/// Generate a self-signed certificate for `identity`
pub fn router_certificate(identity: &str) -> Result<Arc<CertifiedKey>> {
    info!("Generating self-signed TLS certificate for {}", identity);

    let mut params = CertificateParams::new(vec![identity.to_string()])?;

    // Set certificate validity period (1 year)
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(60);
    params.not_after = now + Duration::days(365);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, identity);
    distinguished_name.push(DnType::OrganizationName, "Ingress Router");
    params.distinguished_name = distinguished_name;

    params.subject_alt_names = vec![
        SanType::DnsName(identity.to_string().try_into()?),
        SanType::DnsName("localhost".to_string().try_into()?),
    ];

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let key_der = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
    certified_key(vec![cert.der().clone()], &key_der)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[test]
    fn test_certificate_generation() {
        let key = router_certificate("ingress-router").expect("Failed to generate certificate");

        assert_eq!(key.cert.len(), 1);

        let (_, cert) = X509Certificate::from_der(key.cert[0].as_ref()).unwrap();
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(common_name, Some("ingress-router"));
    }
}
