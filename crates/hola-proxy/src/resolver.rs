//! DNS resolver for hostnames the tunnel refuses to resolve itself.
//!
//! One upstream, chosen by URL scheme:
//!
//! - `https://host[:port]/path` - DNS over HTTPS (RFC 8484, POST)
//! - `tls://host[:port]` - DNS over TLS (RFC 7858), default port 853
//! - `tcp://ip[:port]` - DNS over TCP, default port 53
//! - `udp://ip[:port]` or `ip[:port]` - DNS over UDP, default port 53
//!
//! Every lookup goes to the upstream: there is no cache and no retry.

use crate::config::ResolverConfig;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

const DEFAULT_DNS_PORT: u16 = 53;
const DEFAULT_DOT_PORT: u16 = 853;

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Something that turns a hostname into addresses.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Parsed resolver upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Doh { url: String },
    Dot { hostname: String, port: u16 },
    Tcp { addr: SocketAddr },
    Udp { addr: SocketAddr },
}

impl FromStr for Upstream {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if s.starts_with("https://") {
            url::Url::parse(s)
                .map_err(|e| ProxyError::Config(format!("invalid DoH URL '{}': {}", s, e)))?;
            return Ok(Upstream::Doh { url: s.to_string() });
        }

        if let Some(rest) = s.strip_prefix("tls://") {
            let (hostname, port) = split_host_port(rest, DEFAULT_DOT_PORT);
            if hostname.is_empty() {
                return Err(ProxyError::Config("empty hostname in DoT URL".to_string()));
            }
            return Ok(Upstream::Dot { hostname, port });
        }

        if let Some(rest) = s.strip_prefix("tcp://") {
            return Ok(Upstream::Tcp {
                addr: parse_socket_addr(rest)?,
            });
        }

        if let Some(rest) = s.strip_prefix("udp://") {
            return Ok(Upstream::Udp {
                addr: parse_socket_addr(rest)?,
            });
        }

        if let Some((scheme, _)) = s.split_once("://") {
            return Err(ProxyError::Config(format!(
                "unsupported resolver scheme '{}', expected https, tls, tcp or udp",
                scheme
            )));
        }

        Ok(Upstream::Udp {
            addr: parse_socket_addr(s)?,
        })
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Upstream::Doh { url } => write!(f, "{}", url),
            Upstream::Dot { hostname, port } => write!(f, "tls://{}:{}", hostname, port),
            Upstream::Tcp { addr } => write!(f, "tcp://{}", addr),
            Upstream::Udp { addr } => write!(f, "udp://{}", addr),
        }
    }
}

/// Split `host[:port]`, keeping bracketed IPv6 literals intact.
fn split_host_port(s: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (s.to_string(), default_port),
        },
        _ => (s.to_string(), default_port),
    }
}

/// Parse `ip[:port]` for plain DNS upstreams.
fn parse_socket_addr(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }
    let (host, port) = split_host_port(s, DEFAULT_DNS_PORT);
    let ip = host
        .parse::<IpAddr>()
        .map_err(|e| ProxyError::Config(format!("invalid DNS server address '{}': {}", s, e)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Resolver bound to one upstream.
#[derive(Debug, Clone)]
pub struct Resolver {
    upstream: Upstream,
    timeout: Duration,
    http_client: reqwest::Client,
    tls_config: Arc<rustls::ClientConfig>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Result<Self> {
        let upstream = config.upstream.parse::<Upstream>()?;
        Self::with_upstream(upstream, config.timeout)
    }

    pub(crate) fn with_upstream(upstream: Upstream, timeout: Duration) -> Result<Self> {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(format!("failed to create TLS config: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Self::with_tls_config(upstream, timeout, tls_config)
    }

    /// Resolver whose DoT connections use the given TLS client configuration.
    pub(crate) fn with_tls_config(
        upstream: Upstream,
        timeout: Duration,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to create HTTP client: {}", e)))?;

        debug!(upstream = %upstream, "resolver configured");
        Ok(Self {
            upstream,
            timeout,
            http_client,
            tls_config: Arc::new(tls_config),
        })
    }

    /// `A` first; `AAAA` only when there is no IPv4 answer.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let v4 = self.query(host, RecordType::A).await;
        if matches!(&v4, Ok(addrs) if !addrs.is_empty()) {
            return v4;
        }

        match self.query(host, RecordType::AAAA).await {
            Ok(addrs) if !addrs.is_empty() => Ok(addrs),
            Ok(_) => match v4 {
                Err(e) => Err(e),
                Ok(_) => Err(resolve_error(host, "no address records in answer")),
            },
            Err(e) => Err(v4.err().unwrap_or(e)),
        }
    }

    async fn query(&self, host: &str, rtype: RecordType) -> Result<Vec<IpAddr>> {
        let (id, request) = build_query(host, rtype)?;
        let response = match &self.upstream {
            Upstream::Doh { url } => self.exchange_doh(host, url, &request).await?,
            Upstream::Dot { hostname, port } => {
                self.exchange_dot(host, hostname, *port, &request).await?
            }
            Upstream::Tcp { addr } => {
                let mut stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| resolve_error(host, format!("TCP connect to {} failed: {}", addr, e)))?;
                exchange_stream(host, &mut stream, &request).await?
            }
            Upstream::Udp { addr } => exchange_udp(host, *addr, &request).await?,
        };
        parse_response(host, id, &response)
    }

    async fn exchange_doh(&self, host: &str, url: &str, request: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .http_client
            .post(url)
            .header("Content-Type", DNS_MESSAGE_CONTENT_TYPE)
            .header("Accept", DNS_MESSAGE_CONTENT_TYPE)
            .body(request.to_vec())
            .send()
            .await
            .map_err(|e| resolve_error(host, format!("DoH request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(resolve_error(
                host,
                format!("DoH server returned {}", response.status()),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| resolve_error(host, format!("failed to read DoH response: {}", e)))?;
        Ok(body.to_vec())
    }

    async fn exchange_dot(
        &self,
        host: &str,
        hostname: &str,
        port: u16,
        request: &[u8],
    ) -> Result<Vec<u8>> {
        let tcp = TcpStream::connect((hostname, port))
            .await
            .map_err(|e| resolve_error(host, format!("DoT connect to {} failed: {}", hostname, e)))?;

        let server_name = rustls::pki_types::ServerName::try_from(hostname.to_string())
            .map_err(|e| resolve_error(host, format!("invalid DoT hostname: {}", e)))?;
        let connector = tokio_rustls::TlsConnector::from(Arc::clone(&self.tls_config));
        let mut tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| resolve_error(host, format!("DoT TLS handshake failed: {}", e)))?;

        exchange_stream(host, &mut tls, request).await
    }
}

#[async_trait]
impl NameResolver for Resolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = tokio::time::timeout(self.timeout, self.lookup(host))
            .await
            .map_err(|_| resolve_error(host, format!("timed out after {:?}", self.timeout)))??;
        debug!(host, upstream = %self.upstream, answers = addrs.len(), "resolved");
        Ok(addrs)
    }
}

fn resolve_error(host: &str, reason: impl Into<String>) -> ProxyError {
    ProxyError::Resolve {
        host: host.to_string(),
        reason: reason.into(),
    }
}

/// Encode a recursive query for `host`. Returns the transaction id with it.
fn build_query(host: &str, rtype: RecordType) -> Result<(u16, Vec<u8>)> {
    let fqdn = format!("{}.", host.trim_end_matches('.'));
    let name = Name::from_str(&fqdn)
        .map_err(|e| resolve_error(host, format!("invalid hostname: {}", e)))?;

    let id: u16 = rand::random();
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, rtype));

    let bytes = message
        .to_vec()
        .map_err(|e| resolve_error(host, format!("failed to encode query: {}", e)))?;
    Ok((id, bytes))
}

/// Decode an answer and pull out its address records.
fn parse_response(host: &str, id: u16, bytes: &[u8]) -> Result<Vec<IpAddr>> {
    let message = Message::from_vec(bytes)
        .map_err(|e| resolve_error(host, format!("malformed DNS response: {}", e)))?;

    if message.id() != id {
        return Err(resolve_error(
            host,
            format!("transaction id mismatch: sent {}, got {}", id, message.id()),
        ));
    }
    if message.response_code() != ResponseCode::NoError {
        return Err(resolve_error(
            host,
            format!("upstream answered {}", message.response_code()),
        ));
    }

    let addrs = message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();
    Ok(addrs)
}

async fn exchange_udp(host: &str, addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
    let bind: SocketAddr = if addr.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| resolve_error(host, format!("failed to bind UDP socket: {}", e)))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| resolve_error(host, format!("failed to reach {}: {}", addr, e)))?;
    socket
        .send(request)
        .await
        .map_err(|e| resolve_error(host, format!("failed to send DNS query: {}", e)))?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    let len = socket
        .recv(&mut buf)
        .await
        .map_err(|e| resolve_error(host, format!("failed to receive DNS response: {}", e)))?;
    buf.truncate(len);
    Ok(buf)
}

/// Length-prefixed exchange shared by TCP and DoT.
async fn exchange_stream<S>(host: &str, stream: &mut S, request: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(request.len())
        .map_err(|_| resolve_error(host, "DNS query too large"))?;
    let mut framed = Vec::with_capacity(2 + request.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(request);

    stream
        .write_all(&framed)
        .await
        .map_err(|e| resolve_error(host, format!("stream write failed: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| resolve_error(host, format!("stream write failed: {}", e)))?;

    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| resolve_error(host, format!("stream read failed: {}", e)))?;

    let mut response = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| resolve_error(host, format!("stream read failed: {}", e)))?;
    Ok(response)
}
