//! HTTPS listener terminating TLS in front of the reverse proxy

use super::proxy::ReverseProxy;
use super::{accept_backoff, serve_connection};
use crate::certs::{self, CertificateProvisioner};
use crate::common::error::{Result, RouterError};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, field, info, info_span, instrument, warn};

/// Time allowed for a client to complete the TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTPS listener choosing a certificate per connection from the SNI name
pub struct HttpsProxy {
    provisioner: Arc<dyn CertificateProvisioner>,
    proxy: Arc<ReverseProxy>,
}

impl HttpsProxy {
    pub fn new(provisioner: Arc<dyn CertificateProvisioner>, proxy: Arc<ReverseProxy>) -> Self {
        Self { provisioner, proxy }
    }

    /// Accept connections on `listener` until cancelled, then drain them
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!("HTTPS proxy listening on {}", listener.local_addr()?);

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

            let proxy = self.clone();
            let cancel = cancel.clone();

            tracker.spawn(
                async move {
                    debug!("New connection from {}", peer_addr);

                    if let Err(e) = proxy.handle_connection(stream, peer_addr, cancel).await
                        && !matches!(e, RouterError::Io(_))
                    {
                        warn!("Error handling connection from {}: {}", peer_addr, e);
                    }
                }
                .instrument(info_span!("https_connection", %peer_addr)),
            );
        }

        tracker.close();
        tracker.wait().await;
        debug!("HTTPS proxy stopped");

        Ok(())
    }

    /// Handle a single HTTPS connection
    #[instrument(
        name = "handle_https_connection",
        skip(self, stream, cancel),
        fields(hostname = field::Empty)
    )]
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = timeout(HANDSHAKE_TIMEOUT, acceptor)
            .await
            .map_err(|_| RouterError::Timeout("TLS ClientHello".into()))??;

        let server_name = start.client_hello().server_name().map(str::to_string);
        if let Some(name) = &server_name {
            tracing::Span::current().record("hostname", name.as_str());
        }
        debug!("SNI hostname: {:?}", server_name);

        let key = self.provisioner.certificate(server_name.as_deref()).await?;
        let config = certs::server_config(key)?;

        let tls_stream = timeout(HANDSHAKE_TIMEOUT, start.into_stream(config))
            .await
            .map_err(|_| RouterError::Timeout("TLS handshake".into()))??;

        let proxy = self.proxy.clone();
        let service = service_fn(move |req| {
            let proxy = proxy.clone();
            async move { Ok::<_, Infallible>(proxy.handle(req, peer_addr, "https").await) }
        });

        serve_connection(TokioIo::new(tls_stream), service, cancel).await;
        Ok(())
    }
}
