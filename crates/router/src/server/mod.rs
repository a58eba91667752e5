//! Network listeners and their supervisor
//!
//! [`RouterServer`] binds the two DNS views, the plain HTTP listener and the
//! HTTPS proxy, runs them alongside the idle sweeper and shuts them all down
//! together.

pub mod config;
pub mod dns;
pub mod http;
pub mod https_proxy;
pub mod proxy;

use crate::common::error::{Result, RouterError};
use crate::common::types::DnsView;
use crate::router::Router;
use ::http::{Request, Response};
use dns::DnsServer;
use self::http::HttpServer;
use https_proxy::HttpsProxy;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper_util::rt::TokioExecutor;
use hyper_util::server::conn::auto;
use proxy::{ProxyBody, ReverseProxy};
use std::convert::Infallible;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Port of the external DNS view
pub const DNS_EXTERNAL_PORT: u16 = 5453;
/// Port of the internal DNS view
pub const DNS_INTERNAL_PORT: u16 = 5454;
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

/// Pause before accepting again after a resource error such as `EMFILE`
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Addresses the listeners bind to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddrs {
    pub dns_external: SocketAddr,
    pub dns_internal: SocketAddr,
    pub http: SocketAddr,
    pub https: SocketAddr,
}

impl Default for ListenAddrs {
    fn default() -> Self {
        Self::on(Ipv4Addr::UNSPECIFIED.into())
    }
}

impl ListenAddrs {
    /// The fixed router ports on `ip`
    pub fn on(ip: std::net::IpAddr) -> Self {
        Self {
            dns_external: SocketAddr::new(ip, DNS_EXTERNAL_PORT),
            dns_internal: SocketAddr::new(ip, DNS_INTERNAL_PORT),
            http: SocketAddr::new(ip, HTTP_PORT),
            https: SocketAddr::new(ip, HTTPS_PORT),
        }
    }

    /// Ephemeral ports on `ip`
    pub fn ephemeral(ip: std::net::IpAddr) -> Self {
        let addr = SocketAddr::new(ip, 0);
        Self {
            dns_external: addr,
            dns_internal: addr,
            http: addr,
            https: addr,
        }
    }
}

struct Listeners {
    dns_external: UdpSocket,
    dns_internal: UdpSocket,
    http: TcpListener,
    https: TcpListener,
}

/// Supervisor of the router's listeners and idle sweeper
pub struct RouterServer {
    router: Arc<Router>,
    listeners: Mutex<Option<Listeners>>,
    local_addrs: ListenAddrs,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RouterServer {
    /// Bind every listener; any bind failure is fatal
    pub async fn bind(router: Arc<Router>, addrs: ListenAddrs) -> Result<Self> {
        let dns_external = DnsServer::bind(addrs.dns_external).await?;
        let dns_internal = DnsServer::bind(addrs.dns_internal).await?;
        let http = TcpListener::bind(addrs.http).await?;
        let https = TcpListener::bind(addrs.https).await?;

        let local_addrs = ListenAddrs {
            dns_external: dns_external.local_addr()?,
            dns_internal: dns_internal.local_addr()?,
            http: http.local_addr()?,
            https: https.local_addr()?,
        };

        Ok(Self {
            router,
            listeners: Mutex::new(Some(Listeners {
                dns_external,
                dns_internal,
                http,
                https,
            })),
            local_addrs,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Addresses actually bound
    pub fn local_addrs(&self) -> ListenAddrs {
        self.local_addrs
    }

    /// Run all listeners and the idle sweeper.
    ///
    /// Returns the first listener failure, or `Ok` once shut down.
    pub async fn serve(&self) -> Result<()> {
        let listeners = self
            .listeners
            .lock()
            .await
            .take()
            .ok_or_else(|| RouterError::Config("router server is already serving".into()))?;

        let proxy = Arc::new(ReverseProxy::new(self.router.clone())?);
        let provisioner = self.router.provisioner();
        let (err_tx, mut err_rx) = mpsc::channel::<RouterError>(4);

        let dns_external = Arc::new(DnsServer::new(self.router.clone(), DnsView::External));
        self.spawn_listener(
            "dns-external",
            dns_external.serve(listeners.dns_external, self.cancel.clone()),
            err_tx.clone(),
        );

        let dns_internal = Arc::new(DnsServer::new(self.router.clone(), DnsView::Internal));
        self.spawn_listener(
            "dns-internal",
            dns_internal.serve(listeners.dns_internal, self.cancel.clone()),
            err_tx.clone(),
        );

        let http = Arc::new(HttpServer::new(provisioner.clone(), proxy.clone()));
        self.spawn_listener(
            "http",
            http.serve(listeners.http, self.cancel.clone()),
            err_tx.clone(),
        );

        let https = Arc::new(HttpsProxy::new(provisioner, proxy));
        self.spawn_listener(
            "https",
            https.serve(listeners.https, self.cancel.clone()),
            err_tx,
        );

        self.tracker
            .spawn(self.router.sweeper().run(self.cancel.clone()));

        info!(addrs = ?self.local_addrs, "Router serving");

        tokio::select! {
            Some(e) = err_rx.recv() => {
                error!("Listener failed: {}", e);
                self.cancel.cancel();
                Err(e)
            }
            _ = self.cancel.cancelled() => Ok(()),
        }
    }

    fn spawn_listener<F>(&self, name: &'static str, listener: F, err_tx: mpsc::Sender<RouterError>)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tracker.spawn(async move {
            if let Err(e) = listener.await {
                error!(listener = name, "Listener stopped: {}", e);
                let _ = err_tx.send(e).await;
            }
        });
    }

    /// Stop accepting, drain in-flight work and wait up to `deadline`
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        info!("Shutting down router");

        self.cancel.cancel();
        self.tracker.close();

        tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .map_err(|_| RouterError::Timeout("router shutdown".into()))?;

        info!("Router stopped");
        Ok(())
    }
}

/// How long a listener waits after a failed `accept`/`recv_from`.
///
/// Errors tied to a single peer are retried at once. Anything else, typically
/// descriptor or buffer exhaustion, backs off briefly; the listener keeps
/// running either way.
pub(crate) fn accept_backoff(e: &std::io::Error) -> Duration {
    use std::io::ErrorKind;

    match e.kind() {
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock => Duration::ZERO,
        _ => ACCEPT_BACKOFF,
    }
}

/// Serve HTTP/1 or HTTP/2 on `io`, shutting down gracefully on cancellation
pub(crate) async fn serve_connection<I, S>(io: I, service: S, cancel: CancellationToken)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = Infallible>
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    if let Err(e) = tokio::select! {
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
        r = &mut conn => r,
    } {
        debug!("Connection error: {:?}", e);
    }
}
