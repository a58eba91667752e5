//! DNS responder for routed hostnames
//!
//! Each listener answers for one [`DnsView`]. Routed names resolve to the
//! router's own address so traffic passes through it; everything else is
//! relayed to the upstream resolver.

use crate::common::error::{Result, RouterError};
use crate::common::types::{DnsView, parse_service_host};
use super::accept_backoff;
use crate::router::Router;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, field, info, info_span, warn};
use trust_dns_resolver::proto::op::{Message, MessageType, ResponseCode};
use trust_dns_resolver::proto::rr::rdata::{A, AAAA};
use trust_dns_resolver::proto::rr::{RData, Record, RecordType};

/// TTL of locally answered records
const ANSWER_TTL: u32 = 30;

/// Largest datagram accepted from clients and upstream
const MAX_PACKET_SIZE: usize = 4096;

/// Time allowed for the upstream resolver to answer
const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// UDP DNS listener for one view
pub struct DnsServer {
    router: Arc<Router>,
    view: DnsView,
    forward_timeout: Duration,
}

impl DnsServer {
    pub fn new(router: Arc<Router>, view: DnsView) -> Self {
        Self {
            router,
            view,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
        }
    }

    /// Override how long to wait for the upstream resolver
    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    /// Bind the listener socket
    pub async fn bind(addr: SocketAddr) -> Result<UdpSocket> {
        Ok(UdpSocket::bind(addr).await?)
    }

    /// Answer queries on `socket` until cancelled
    pub async fn serve(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) -> Result<()> {
        let socket = Arc::new(socket);
        let tracker = TaskTracker::new();

        info!(view = %self.view, addr = ?socket.local_addr().ok(), "DNS server listening");

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    // ICMP unreachable from a previous reply surfaces here on some platforms
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        warn!(view = %self.view, "Failed to receive DNS query: {}", e);
                        tokio::time::sleep(accept_backoff(&e)).await;
                        continue;
                    }
                },
            };

            let packet = buf[..len].to_vec();
            let server = self.clone();
            let socket = socket.clone();
            let span = info_span!(
                "dns_query",
                view = %self.view,
                peer = %peer,
                service = field::Empty,
                app = field::Empty,
            );

            tracker.spawn(
                async move {
                    if let Some(response) = server.handle_query(&packet).await
                        && let Err(e) = socket.send_to(&response, peer).await
                    {
                        warn!("Failed to send DNS response: {}", e);
                    }
                }
                .instrument(span),
            );
        }

        tracker.close();
        tracker.wait().await;
        debug!(view = %self.view, "DNS server stopped");

        Ok(())
    }

    /// Build the response for one raw query; `None` drops the packet
    pub async fn handle_query(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping unparseable DNS packet: {}", e);
                return None;
            }
        };

        if request.message_type() != MessageType::Query {
            debug!("Dropping DNS packet that is not a query");
            return None;
        }

        if let Some(response) = self.answer_locally(&request).await {
            return Some(response);
        }

        match self.forward(packet).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("DNS forward failed: {}", e);
                error_response(&request, ResponseCode::ServFail)
            }
        }
    }

    /// Answer address queries for routed names
    async fn answer_locally(&self, request: &Message) -> Option<Vec<u8>> {
        let query = request.queries().first()?;
        let record_type = query.query_type();
        if !matches!(record_type, RecordType::A | RecordType::AAAA) {
            return None;
        }

        let name = query.name().to_utf8();
        let host = name.trim_end_matches('.');

        if self.view.is_internal()
            && let Some((service, app)) = parse_service_host(host)
        {
            let span = Span::current();
            span.record("service", service.as_str());
            span.record("app", app.as_str());
        }

        if let Err(e) = self.router.route(host).await {
            debug!(host, "Not routed locally ({}), forwarding", e);
            return None;
        }

        let router_ip = self.router.router_ip(self.view.is_internal());
        let ip = match router_ip.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(router_ip = %router_ip, "Router address is not an IP, forwarding");
                return None;
            }
        };

        let mut response = response_for(request, ResponseCode::NoError);
        response.set_authoritative(true);

        let rdata = match (record_type, ip) {
            (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A::from(v4))),
            (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA::from(v6))),
            _ => None,
        };
        if let Some(rdata) = rdata {
            response.add_answer(Record::from_rdata(query.name().clone(), ANSWER_TTL, rdata));
        }

        debug!(host, ip = %ip, "Answered routed name");

        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode DNS answer: {}", e);
                error_response(request, ResponseCode::ServFail)
            }
        }
    }

    /// Relay the raw query to the upstream resolver and return its answer
    async fn forward(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let upstream = self.router.upstream()?;

        let bind_addr = if upstream.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(upstream).await?;
        socket.send(packet).await?;

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let len = tokio::time::timeout(self.forward_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| RouterError::Timeout(format!("upstream dns {upstream}")))??;
        buf.truncate(len);

        debug!(upstream = %upstream, "Relayed upstream answer");
        Ok(buf)
    }
}

/// Response header and question copied from `request`
fn response_for(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_response_code(code);
    response.add_queries(request.queries().to_vec());
    response
}

fn error_response(request: &Message, code: ResponseCode) -> Option<Vec<u8>> {
    response_for(request, code).to_vec().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MockBackend};
    use crate::certs::AdHocProvisioner;
    use crate::certs::selfsigned::router_certificate;
    use crate::storage::MemoryStorage;
    use trust_dns_resolver::proto::op::Query;
    use trust_dns_resolver::proto::rr::Name;

    async fn router(upstream: Option<SocketAddr>) -> Arc<Router> {
        let mut backend = MockBackend::new();
        backend
            .expect_internal_ip()
            .return_const("10.1.0.1".to_string());
        backend
            .expect_external_ip()
            .return_const("203.0.113.1".to_string());
        let backend: Arc<dyn Backend> = Arc::new(backend);

        let provisioner = Arc::new(AdHocProvisioner::new(
            backend.clone(),
            router_certificate("ingress-router").unwrap(),
        ));

        let router = Router::from_parts(
            Arc::new(MemoryStorage::new()),
            backend,
            provisioner,
            upstream.map(|addr| addr.to_string()),
        );
        router
            .target_add("app.example.com", "http://10.0.0.5:8080", true)
            .await
            .unwrap();
        router
            .target_add(
                "web.myapp.svc.cluster.local",
                "http://10.0.0.7:3000",
                true,
            )
            .await
            .unwrap();

        Arc::new(router)
    }

    fn query(name: &str, record_type: RecordType) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(0x1234);
        message.set_message_type(MessageType::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));
        message.to_vec().unwrap()
    }

    /// Upstream that answers one query with a fixed A record
    async fn fake_upstream(answer: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();

            let mut response = response_for(&request, ResponseCode::NoError);
            let name = request.queries()[0].name().clone();
            response.add_answer(Record::from_rdata(name, 300, RData::A(A::from(answer))));
            socket
                .send_to(&response.to_vec().unwrap(), peer)
                .await
                .unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_routed_name_answers_router_ip() {
        let server = DnsServer::new(router(None).await, DnsView::External);

        let bytes = server
            .handle_query(&query("app.example.com.", RecordType::A))
            .await
            .unwrap();
        let response = Message::from_vec(&bytes).unwrap();

        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.authoritative());
        assert!(response.recursion_desired());
        assert_eq!(response.queries().len(), 1);
        assert_eq!(response.answers().len(), 1);

        let answer = &response.answers()[0];
        assert_eq!(answer.ttl(), ANSWER_TTL);
        assert_eq!(
            answer.data(),
            Some(&RData::A(A::from(Ipv4Addr::new(203, 0, 113, 1))))
        );
    }

    #[tokio::test]
    async fn test_internal_view_answers_internal_ip() {
        let server = DnsServer::new(router(None).await, DnsView::Internal);

        let bytes = server
            .handle_query(&query("web.myapp.svc.cluster.local.", RecordType::A))
            .await
            .unwrap();
        let response = Message::from_vec(&bytes).unwrap();

        assert_eq!(
            response.answers()[0].data(),
            Some(&RData::A(A::from(Ipv4Addr::new(10, 1, 0, 1))))
        );
    }

    #[tokio::test]
    async fn test_address_family_mismatch_is_empty_answer() {
        let server = DnsServer::new(router(None).await, DnsView::External);

        let bytes = server
            .handle_query(&query("app.example.com.", RecordType::AAAA))
            .await
            .unwrap();
        let response = Message::from_vec(&bytes).unwrap();

        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_name_is_relayed() {
        let upstream = fake_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
        let server = DnsServer::new(router(Some(upstream)).await, DnsView::External);

        let bytes = server
            .handle_query(&query("example.org.", RecordType::A))
            .await
            .unwrap();
        let response = Message::from_vec(&bytes).unwrap();

        assert_eq!(response.id(), 0x1234);
        assert!(!response.authoritative());
        assert_eq!(
            response.answers()[0].data(),
            Some(&RData::A(A::from(Ipv4Addr::new(93, 184, 216, 34))))
        );
    }

    #[tokio::test]
    async fn test_other_record_types_are_relayed() {
        let upstream = fake_upstream(Ipv4Addr::new(192, 0, 2, 10)).await;
        let server = DnsServer::new(router(Some(upstream)).await, DnsView::External);

        let bytes = server
            .handle_query(&query("app.example.com.", RecordType::MX))
            .await
            .unwrap();
        let response = Message::from_vec(&bytes).unwrap();

        assert_eq!(
            response.answers()[0].data(),
            Some(&RData::A(A::from(Ipv4Addr::new(192, 0, 2, 10))))
        );
    }

    #[tokio::test]
    async fn test_silent_upstream_is_servfail() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = silent.local_addr().unwrap();

        let server = DnsServer::new(router(Some(upstream)).await, DnsView::External)
            .with_forward_timeout(Duration::from_millis(200));

        let bytes = server
            .handle_query(&query("example.org.", RecordType::A))
            .await
            .unwrap();
        let response = Message::from_vec(&bytes).unwrap();

        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        drop(silent);
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let server = DnsServer::new(router(None).await, DnsView::External);
        assert!(server.handle_query(b"\x01\x02").await.is_none());
    }
}
