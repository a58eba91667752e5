//! Plain HTTP listener
//!
//! Redirects to HTTPS unless a load balancer in front already terminated TLS
//! (`X-Forwarded-Proto: https`), in which case the request is proxied like an
//! HTTPS request. ACME HTTP-01 challenges are answered first.

use super::proxy::{ProxyBody, ReverseProxy, request_host, text_response};
use super::{accept_backoff, serve_connection};
use crate::certs::CertificateProvisioner;
use crate::common::error::Result;
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

/// Path prefix of ACME HTTP-01 challenge requests
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Plain HTTP listener
pub struct HttpServer {
    provisioner: Arc<dyn CertificateProvisioner>,
    proxy: Arc<ReverseProxy>,
}

impl HttpServer {
    pub fn new(provisioner: Arc<dyn CertificateProvisioner>, proxy: Arc<ReverseProxy>) -> Self {
        Self { provisioner, proxy }
    }

    /// Accept connections on `listener` until cancelled, then drain them
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!("HTTP server listening on {}", listener.local_addr()?);

        let tracker = TaskTracker::new();

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(accept_backoff(&e)).await;
                        continue;
                    }
                },
            };

            let server = self.clone();
            let cancel = cancel.clone();

            tracker.spawn(
                async move {
                    debug!("New connection from {}", peer_addr);

                    let service = service_fn(move |req| {
                        let server = server.clone();
                        async move { Ok::<_, Infallible>(server.handle(req, peer_addr).await) }
                    });

                    serve_connection(TokioIo::new(stream), service, cancel).await;
                }
                .instrument(info_span!("http_connection", %peer_addr)),
            );
        }

        tracker.close();
        tracker.wait().await;
        debug!("HTTP server stopped");

        Ok(())
    }

    /// Answer one plain HTTP request
    pub async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        if self.provisioner.serves_challenges()
            && let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX)
        {
            return self.challenge(token);
        }

        if is_forwarded_https(&req) {
            return self.proxy.handle(req, peer, "https").await;
        }

        redirect_https(&req)
    }

    fn challenge(&self, token: &str) -> Response<ProxyBody> {
        match self.provisioner.challenge_response(token) {
            Some(key_authorization) => {
                debug!(token, "Serving ACME challenge");
                text_response(StatusCode::OK, key_authorization)
            }
            None => text_response(StatusCode::NOT_FOUND, "unknown challenge token"),
        }
    }
}

/// Whether a load balancer already terminated TLS for this request
fn is_forwarded_https<B>(req: &Request<B>) -> bool {
    req.headers()
        .get("x-forwarded-proto")
        .is_some_and(|proto| proto.as_bytes().eq_ignore_ascii_case(b"https"))
}

/// Permanent redirect to the same host, path and query over HTTPS
pub fn redirect_https<B>(req: &Request<B>) -> Response<ProxyBody> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request_host(req));

    let Some(host) = host.filter(|host| !host.is_empty()) else {
        return text_response(StatusCode::BAD_REQUEST, "missing host");
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{host}{path_and_query}");

    let Ok(location) = HeaderValue::from_str(&location) else {
        return text_response(StatusCode::BAD_REQUEST, "invalid host");
    };

    let mut response = text_response(StatusCode::MOVED_PERMANENTLY, "");
    response.headers_mut().insert(header::LOCATION, location);
    response
}
