//! Tunnel dialer.
//!
//! Opens a stream to an arbitrary `host:port` through the selected tunnel
//! endpoint: TCP to the endpoint address, TLS verified against the
//! endpoint's certificate name, then the CONNECT handshake with the current
//! credentials. The returned stream carries raw payload to and from the
//! target.

use crate::credential::LiveCredentials;
use crate::endpoint::TunnelEndpoint;
use crate::error::{ProxyError, Result};
use crate::hola::handshake;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Timeout for the TCP connect to the tunnel endpoint.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Byte stream returned by a [`Dialer`].
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Something that can open a stream to `host:port`.
///
/// Deadlines are the caller's business: dropping the future cancels the dial.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, authority: &str) -> Result<BoxedStream>;
}

/// Dials through one tunnel endpoint.
pub struct TunnelDialer {
    endpoint: TunnelEndpoint,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    credentials: LiveCredentials,
}

impl TunnelDialer {
    /// Dialer trusting the bundled web PKI roots.
    pub fn new(endpoint: TunnelEndpoint, credentials: LiveCredentials) -> Result<Self> {
        // Use the ring provider explicitly to avoid ambiguity when multiple
        // crypto providers are in the dependency tree.
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Self::with_tls_config(endpoint, credentials, tls_config)
    }

    /// Dialer with a caller-provided TLS client configuration.
    ///
    /// SNI is always turned off: endpoints are dialed by IP and some of them
    /// refuse handshakes that name a host.
    pub fn with_tls_config(
        endpoint: TunnelEndpoint,
        credentials: LiveCredentials,
        mut tls_config: rustls::ClientConfig,
    ) -> Result<Self> {
        tls_config.enable_sni = false;
        let server_name = ServerName::try_from(endpoint.tls_name.clone()).map_err(|_| {
            ProxyError::Config(format!(
                "invalid TLS name for tunnel endpoint: {}",
                endpoint.tls_name
            ))
        })?;

        Ok(Self {
            endpoint,
            server_name,
            connector: TlsConnector::from(Arc::new(tls_config)),
            credentials,
        })
    }

    async fn connect_tcp(&self) -> Result<TcpStream> {
        let addr = self.endpoint.addr;
        match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
                host: addr.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ProxyError::UpstreamConnect {
                host: addr.to_string(),
                reason: "connection timed out".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial(&self, authority: &str) -> Result<BoxedStream> {
        let tcp = self.connect_tcp().await?;

        let mut tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| ProxyError::Tls {
                server_name: self.endpoint.tls_name.clone(),
                reason: e.to_string(),
            })?;

        let credentials = self.credentials.current();
        let authorization = credentials.proxy_authorization();
        handshake::perform(&mut tls, authority, &authorization).await?;

        debug!(
            target_authority = authority,
            endpoint = %self.endpoint.addr,
            login = %credentials.login(),
            "tunnel established"
        );
        Ok(Box::new(tls))
    }
}

impl std::fmt::Debug for TunnelDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelDialer")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::credential::Credentials;
    use crate::endpoint::PortClass;
    use crate::identity::Identity;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;
    use zeroize::Zeroizing;

    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    /// Self-signed certificate for `name`.
    fn certificate(name: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        (
            cert.der().clone(),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        )
    }

    fn client_config(trusted: &CertificateDer<'static>) -> rustls::ClientConfig {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(trusted.clone()).unwrap();
        rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }

    /// TLS tunnel endpoint that answers every CONNECT with `status_line`,
    /// then echoes. Reports the received handshake and SNI.
    async fn spawn_tunnel(
        cert: CertificateDer<'static>,
        key: PrivateKeyDer<'static>,
        status_line: &'static str,
    ) -> (SocketAddr, tokio::sync::mpsc::Receiver<(String, Option<String>)>) {
        let server_config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let sni = tls.get_ref().1.server_name().map(str::to_string);
                    let head = handshake::read_response_head(&mut tls).await.unwrap();
                    let _ = tx
                        .send((String::from_utf8_lossy(&head).to_string(), sni))
                        .await;
                    tls.write_all(status_line.as_bytes()).await.unwrap();
                    tls.flush().await.unwrap();
                    let mut buf = [0u8; 1024];
                    loop {
                        match tls.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tls.write_all(&buf[..n]).await.is_err()
                                    || tls.flush().await.is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        (addr, rx)
    }

    fn endpoint(addr: SocketAddr, tls_name: &str) -> TunnelEndpoint {
        TunnelEndpoint {
            addr,
            tls_name: tls_name.to_string(),
            class: PortClass::Direct,
            trial: false,
            port_field: "direct".to_string(),
        }
    }

    fn live() -> LiveCredentials {
        LiveCredentials::new(Credentials::new(
            Identity::generate().unwrap(),
            Zeroizing::new("agent-key".to_string()),
        ))
    }

    #[tokio::test]
    async fn test_dial_performs_handshake_without_sni() {
        let (cert, key) = certificate("zagent.test");
        let config = client_config(&cert);
        let (addr, mut seen) = spawn_tunnel(cert, key, "HTTP/1.1 200 OK\r\n\r\n").await;

        let credentials = live();
        let dialer =
            TunnelDialer::with_tls_config(endpoint(addr, "zagent.test"), credentials.clone(), config)
                .unwrap();
        let mut stream = dialer.dial("example.com:443").await.unwrap();

        let (head, sni) = seen.recv().await.unwrap();
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com:443\r\n"));
        let expected = credentials.current().proxy_authorization();
        assert!(head.contains(&format!("Proxy-Authorization: {}\r\n", &*expected)));
        assert_eq!(sni, None);

        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_dial_rejects_certificate_for_unrelated_name() {
        let (cert, key) = certificate("unrelated.test");
        let config = client_config(&cert);
        let (addr, _seen) = spawn_tunnel(cert, key, "HTTP/1.1 200 OK\r\n\r\n").await;

        let dialer =
            TunnelDialer::with_tls_config(endpoint(addr, "zagent.test"), live(), config).unwrap();
        let err = dialer.dial("example.com:443").await.err().unwrap();
        assert!(matches!(err, ProxyError::Tls { ref server_name, .. } if server_name == "zagent.test"));
    }

    #[tokio::test]
    async fn test_dial_reports_rejection() {
        let (cert, key) = certificate("zagent.test");
        let config = client_config(&cert);
        let (addr, _seen) = spawn_tunnel(
            cert,
            key,
            "HTTP/1.1 403 Forbidden\r\nX-Hola-Error: Forbidden Host\r\n\r\n",
        )
        .await;

        let dialer =
            TunnelDialer::with_tls_config(endpoint(addr, "zagent.test"), live(), config).unwrap();
        let err = dialer.dial("example.com:80").await.err().unwrap();
        assert!(err.is_forbidden_host());
    }

    #[tokio::test]
    async fn test_dial_tcp_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (cert, _) = certificate("zagent.test");
        let dialer =
            TunnelDialer::with_tls_config(endpoint(addr, "zagent.test"), live(), client_config(&cert))
                .unwrap();
        let err = dialer.dial("example.com:443").await.err().unwrap();
        assert!(matches!(err, ProxyError::UpstreamConnect { .. }));
    }

    #[test]
    fn test_new_rejects_invalid_tls_name() {
        let addr: SocketAddr = "192.0.2.1:443".parse().unwrap();
        assert!(TunnelDialer::new(endpoint(addr, "not a name"), live()).is_err());
        assert!(TunnelDialer::new(endpoint(addr, "zagent.hola.org"), live()).is_ok());
    }
}
