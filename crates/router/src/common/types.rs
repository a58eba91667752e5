//! Common types shared by the router, its collaborators and the listeners

use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix of orchestration-internal service names
const CLUSTER_SUFFIX: &str = ".svc.cluster.local";

/// Certificate authority material used to sign leaf certificates on demand
#[derive(Clone, Serialize, Deserialize)]
pub struct CaMaterial {
    /// CA certificate in PEM format
    pub cert_pem: String,
    /// CA private key in PEM format
    pub key_pem: String,
}

impl fmt::Debug for CaMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaMaterial")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Which DNS view a listener answers for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsView {
    /// Public application domains
    External,
    /// Orchestration-internal service names
    Internal,
}

impl DnsView {
    pub fn is_internal(self) -> bool {
        matches!(self, DnsView::Internal)
    }
}

impl fmt::Display for DnsView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsView::External => write!(f, "external"),
            DnsView::Internal => write!(f, "internal"),
        }
    }
}

/// Split a `<service>.<app>.svc.cluster.local` hostname into `(service, app)`.
///
/// Any other number of labels is rejected.
pub fn parse_service_host(host: &str) -> Option<(String, String)> {
    let host = host.trim_end_matches('.');
    let prefix = host.strip_suffix(CLUSTER_SUFFIX)?;
    let (service, app) = prefix.split_once('.')?;

    if service.is_empty() || app.is_empty() || app.contains('.') {
        return None;
    }

    Some((service.to_string(), app.to_string()))
}

/// Split a target URL whose host is an internal service name into `(service, app)`
pub fn parse_target(target: &str) -> Option<(String, String)> {
    let url = url::Url::parse(target).ok()?;
    parse_service_host(url.host_str()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_host() {
        let test_cases = vec![
            ("web.myapp.svc.cluster.local", Some(("web", "myapp"))),
            ("web.myapp.svc.cluster.local.", Some(("web", "myapp"))),
            ("myapp.svc.cluster.local", None),
            ("a.web.myapp.svc.cluster.local", None),
            (".myapp.svc.cluster.local", None),
            ("web.myapp.example.com", None),
            ("", None),
        ];

        for (host, expected) in test_cases {
            let parsed = parse_service_host(host);
            let expected = expected.map(|(s, a)| (s.to_string(), a.to_string()));
            assert_eq!(parsed, expected, "Failed for host: {host}");
        }
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("https://web.myapp.svc.cluster.local:5000"),
            Some(("web".to_string(), "myapp".to_string()))
        );
        assert_eq!(parse_target("http://10.0.0.5:8080"), None);
        assert_eq!(parse_target("not a url"), None);
    }

    #[test]
    fn test_ca_material_debug_redacts_key() {
        let ca = CaMaterial {
            cert_pem: "cert".into(),
            key_pem: "secret".into(),
        };
        let debug = format!("{ca:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<redacted>"));
    }
}
