//! Reverse proxy from an incoming request to the routed target
//!
//! Every proxied request is bracketed by [`Router::request_begin`] and
//! [`Router::request_end`]; the end is recorded when the response body is
//! finished or dropped, or when the upstream call fails.

use crate::common::error::{Result, RouterError};
use crate::router::Router;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Body type of every response the listeners produce
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Client used to reach targets
pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Incoming>;

/// Headers that only apply to a single connection
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Certificate verifier that accepts any target certificate.
///
/// Internal targets present cluster-issued certificates the router cannot
/// validate against public roots.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Create the client used to reach `http://` and `https://` targets
pub fn create_http_client() -> Result<HttpClient> {
    let mut http_connector = HttpConnector::new();
    http_connector.enforce_http(false);

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    Ok(Client::builder(TokioExecutor::new()).build(https_connector))
}

/// Records the end of a request when dropped
struct RequestGuard {
    router: Arc<Router>,
    target: String,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let router = self.router.clone();
        let target = std::mem::take(&mut self.target);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = router.request_end(&target).await {
                    warn!(target = %target, "Failed to record request end: {}", e);
                }
            });
        }
    }
}

/// Reverse proxy over the router's routing table
pub struct ReverseProxy {
    router: Arc<Router>,
    client: HttpClient,
}

impl ReverseProxy {
    pub fn new(router: Arc<Router>) -> Result<Self> {
        Ok(Self {
            router,
            client: create_http_client()?,
        })
    }

    /// Proxy `req` to its routed target, answering 502 on any failure
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        scheme: &'static str,
    ) -> Response<ProxyBody> {
        match self.forward(req, peer, scheme).await {
            Ok(response) => response,
            Err(e) => {
                warn!(peer = %peer, "Proxy request failed: {}", e);
                text_response(StatusCode::BAD_GATEWAY, e.to_string())
            }
        }
    }

    /// Record the start of a request to `target`.
    ///
    /// The returned guard records the end. A failed wake still records the
    /// end, since storage already counted the request; a storage failure
    /// does not.
    async fn begin(&self, target: &str) -> Result<RequestGuard> {
        let guard = || RequestGuard {
            router: self.router.clone(),
            target: target.to_string(),
        };

        match self.router.request_begin(target).await {
            Ok(()) => Ok(guard()),
            Err(e @ (RouterError::IdleStatus(_) | RouterError::Unidle(_))) => {
                drop(guard());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn forward(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        scheme: &'static str,
    ) -> Result<Response<ProxyBody>> {
        let host = request_host(&req).unwrap_or_default();
        let target = self.router.route(&host).await?;

        let guard = self.begin(&target).await?;

        debug!(host = %host, target = %target, "Proxying request");

        *req.uri_mut() = upstream_uri(&target, req.uri())?;
        *req.version_mut() = Version::HTTP_11;
        prepare_request_headers(req.headers_mut(), &host, peer, scheme);

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| RouterError::Proxy(format!("upstream request failed: {e}")))?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        // the guard lives as long as the body
        let body = body
            .map_frame(move |frame| {
                let _ = &guard;
                frame
            })
            .boxed();

        Ok(Response::from_parts(parts, body))
    }
}

/// Hostname the request was addressed to, without port
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let authority = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    Some(strip_port(&authority).to_string())
}

fn strip_port(authority: &str) -> &str {
    // bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Target scheme and authority with the request's path and query
fn upstream_uri(target: &str, original: &Uri) -> Result<Uri> {
    let target: Uri = target
        .parse()
        .map_err(|e| RouterError::Proxy(format!("invalid target {target}: {e}")))?;

    let scheme = target
        .scheme()
        .cloned()
        .ok_or_else(|| RouterError::Proxy(format!("target {target} has no scheme")))?;
    let authority = target
        .authority()
        .cloned()
        .ok_or_else(|| RouterError::Proxy(format!("target {target} has no authority")))?;
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Ok(Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()?)
}

fn prepare_request_headers(
    headers: &mut HeaderMap,
    host: &str,
    peer: SocketAddr,
    scheme: &'static str,
) {
    strip_hop_by_hop(headers);

    let forwarded_for = match headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
    {
        Some(existing) => format!("{existing}, {}", peer.ip()),
        None => peer.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme));

    if let Ok(value) = HeaderValue::from_str(host) {
        if !headers.contains_key(header::HOST) {
            headers.insert(header::HOST, value.clone());
        }
        headers.insert(X_FORWARDED_HOST, value);
    }
}

/// Remove connection-scoped headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in named.iter().map(String::as_str).chain(HOP_BY_HOP) {
        headers.remove(name);
    }
}

/// Plain-text response with `status`
pub fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<ProxyBody> {
    let body = Full::new(text.into())
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
