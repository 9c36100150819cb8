//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! The server binds to the configured address, accepts TCP connections,
//! reads the request head and dispatches on the method:
//!
//! CONNECT method -> [`connect`] handler (raw tunnel)
//! Other methods  -> [`forward`] handler (absolute-URI plain HTTP)

use crate::config::ProxyConfig;
use crate::connect;
use crate::dialer::{BoxedStream, Dialer};
use crate::error::{ProxyError, Result};
use crate::forward;
use crate::resolver::NameResolver;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Maximum total size of HTTP headers (64 KiB). Prevents OOM from
/// malicious clients sending unbounded header data.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Request line and headers as read off the client connection.
enum Head {
    /// Client disconnected before sending anything.
    Closed,
    /// Request line plus headers exceeded [`MAX_HEADER_SIZE`].
    TooLarge,
    Complete {
        first_line: String,
        header_bytes: Vec<u8>,
        /// Bytes read past the header block: request body for plain HTTP,
        /// early payload for CONNECT.
        buffered: Vec<u8>,
    },
}

/// Read the request head, never buffering more than [`MAX_HEADER_SIZE`]
/// bytes of it, request line included.
async fn read_head<S>(stream: &mut S) -> std::io::Result<Head>
where
    S: AsyncRead + Unpin,
{
    // The BufReader may read ahead into the body, so whatever it holds
    // once the blank line is seen is handed back as `buffered`.
    let mut reader = BufReader::new(stream);
    let mut total = 0usize;
    let mut line = Vec::new();

    let limit = MAX_HEADER_SIZE as u64 + 1;
    let n = (&mut reader).take(limit).read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(Head::Closed);
    }
    total += n;
    if total > MAX_HEADER_SIZE {
        return Ok(Head::TooLarge);
    }
    let first_line = String::from_utf8_lossy(&line).into_owned();

    let mut header_bytes = Vec::new();
    loop {
        line.clear();
        let limit = (MAX_HEADER_SIZE - total) as u64 + 1;
        let n = (&mut reader).take(limit).read_until(b'\n', &mut line).await?;
        total += n;
        if total > MAX_HEADER_SIZE {
            return Ok(Head::TooLarge);
        }
        if n == 0 || line.iter().all(u8::is_ascii_whitespace) {
            break;
        }
        header_bytes.extend_from_slice(&line);
    }

    Ok(Head::Complete {
        first_line,
        header_bytes,
        buffered: reader.buffer().to_vec(),
    })
}

/// Handle returned when the proxy server starts.
///
/// Call [`shutdown`](Self::shutdown) or drop the handle to stop accepting.
pub struct ProxyHandle {
    /// Address the listener is bound to
    pub local_addr: SocketAddr,
    /// Send `true` to trigger graceful shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyHandle {
    /// Signal the proxy to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Per-connection request handling, shared by all connections.
///
/// Holds the dialing and resolution capabilities; nothing in it is
/// mutated after construction.
#[derive(Clone)]
pub struct ProxyHandler {
    dialer: Arc<dyn Dialer>,
    resolver: Arc<dyn NameResolver>,
    timeout: Duration,
}

impl ProxyHandler {
    /// `timeout` bounds the dial (and any fallback resolution) of each session.
    pub fn new(dialer: Arc<dyn Dialer>, resolver: Arc<dyn NameResolver>, timeout: Duration) -> Self {
        Self {
            dialer,
            resolver,
            timeout,
        }
    }

    /// Serve one client connection until its session ends.
    pub async fn handle<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (first_line, header_bytes, buffered) = match read_head(&mut stream).await? {
            Head::Closed => return Ok(()),
            Head::TooLarge => {
                send_response(&mut stream, 431, "Request Header Fields Too Large").await?;
                return Err(ProxyError::HttpParse("request head too large".to_string()));
            }
            Head::Complete {
                first_line,
                header_bytes,
                buffered,
            } => (first_line, header_bytes, buffered),
        };

        let first_line = first_line.trim_end();

        if first_line.starts_with("CONNECT ") {
            connect::handle_connect(first_line, &mut stream, &buffered, self).await
        } else {
            forward::handle_forward(first_line, &mut stream, &header_bytes, &buffered, self).await
        }
    }

    /// Open a tunneled stream to `host:port`.
    ///
    /// When the tunnel refuses the hostname, resolve it locally and dial the
    /// first address once more. The whole operation is bounded by the
    /// handler timeout.
    pub(crate) async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let authority = authority(host, port);
        let attempt = async {
            match self.dialer.dial(&authority).await {
                Err(e) if e.is_forbidden_host() => {
                    debug!(host, "tunnel refused hostname, resolving locally");
                    let addrs = self.resolver.resolve(host).await?;
                    let ip = addrs.first().ok_or_else(|| ProxyError::Resolve {
                        host: host.to_string(),
                        reason: "no addresses".to_string(),
                    })?;
                    self.dialer
                        .dial(&SocketAddr::new(*ip, port).to_string())
                        .await
                }
                other => other,
            }
        };

        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| ProxyError::Timeout(format!("dialing {}", authority)))?
    }

    /// HTTP status reported to the client for a failed dial.
    pub(crate) fn error_status(err: &ProxyError) -> (u16, &'static str) {
        match err {
            ProxyError::Timeout(_) => (504, "Gateway Timeout"),
            _ => (502, "Bad Gateway"),
        }
    }
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// `host:port`, bracketing IPv6 literals.
fn authority(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{}:{}", host, port),
    }
}

/// Send a status-only HTTP response to the client.
pub(crate) async fn send_response<S>(stream: &mut S, status: u16, reason: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!("HTTP/1.1 {} {}\r\n\r\n", status, reason);
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Shared state for the proxy server.
struct ProxyState {
    handler: ProxyHandler,
    config: ProxyConfig,
    /// Active connection count for connection limiting.
    active_connections: AtomicUsize,
}

/// Start the proxy server.
///
/// Binds to `config.bind_addr` (port 0 = OS-assigned) and begins accepting
/// connections. The server runs until the handle is dropped or
/// `shutdown()` is called.
pub async fn start(config: ProxyConfig, handler: ProxyHandler) -> Result<ProxyHandle> {
    let bind_addr = config.bind_addr;
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;

    let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: bind_addr.to_string(),
        source: e,
    })?;

    info!("Proxy server listening on {}", local_addr);

    // Shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(ProxyState {
        handler,
        config,
        active_connections: AtomicUsize::new(0),
    });

    tokio::spawn(accept_loop(listener, state, shutdown_rx));

    Ok(ProxyHandle {
        local_addr,
        shutdown_tx,
    })
}

/// Accept loop: listen for connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        // Connection limit enforcement
                        let max = state.config.max_connections;
                        if max > 0 {
                            let current = state.active_connections.load(Ordering::Relaxed);
                            if current >= max {
                                warn!("Connection limit reached ({}/{}), rejecting {}", current, max, addr);
                                drop(stream);
                                continue;
                            }
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);

                        debug!("Accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            handle_connection(stream, &state).await;
                            state.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy server shutting down");
                    return;
                }
            }
        }
    }
}

/// Serve one accepted connection. Session errors end the task only.
async fn handle_connection(stream: TcpStream, state: &ProxyState) {
    let _ = stream.set_nodelay(true);
    if let Err(e) = state.handler.handle(stream).await {
        debug!("Connection handler error: {}", e);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every authority it is asked for. Successful dials echo.
    struct ScriptedDialer {
        calls: Mutex<Vec<String>>,
        refuse_hostnames: bool,
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self, authority: &str) -> Result<BoxedStream> {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(authority.to_string());
            let is_ip = authority.parse::<SocketAddr>().is_ok();
            if self.refuse_hostnames && !is_ip {
                return Err(ProxyError::HandshakeRejected {
                    target: authority.to_string(),
                    status: 403,
                    reason: crate::error::RejectReason::ForbiddenHost,
                });
            }
            let (near, mut far) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = far.read(&mut buf).await {
                    if n == 0 || far.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(near))
        }
    }

    struct FixedResolver(Vec<IpAddr>);

    #[async_trait]
    impl NameResolver for FixedResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            if self.0.is_empty() {
                return Err(ProxyError::Resolve {
                    host: host.to_string(),
                    reason: "no such host".to_string(),
                });
            }
            Ok(self.0.clone())
        }
    }

    fn handler(refuse_hostnames: bool, addrs: Vec<IpAddr>) -> (ProxyHandler, Arc<ScriptedDialer>) {
        let dialer = Arc::new(ScriptedDialer {
            calls: Mutex::new(Vec::new()),
            refuse_hostnames,
        });
        let handler = ProxyHandler::new(
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            Arc::new(FixedResolver(addrs)),
            Duration::from_secs(5),
        );
        (handler, dialer)
    }

    async fn roundtrip(handler: &ProxyHandler, request: &[u8]) -> String {
        let (mut client, server) = tokio::io::duplex(2 * 1024 * 1024);
        client.write_all(request).await.unwrap();
        let _ = handler.handle(server).await;
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[test]
    fn test_authority_brackets_ipv6() {
        assert_eq!(authority("example.com", 443), "example.com:443");
        assert_eq!(authority("192.0.2.1", 80), "192.0.2.1:80");
        assert_eq!(authority("2001:db8::1", 443), "[2001:db8::1]:443");
    }

    #[test]
    fn test_error_status() {
        let timeout = ProxyError::Timeout("x".to_string());
        assert_eq!(ProxyHandler::error_status(&timeout).0, 504);
        let refused = ProxyError::UpstreamConnect {
            host: "x".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(ProxyHandler::error_status(&refused).0, 502);
    }

    #[tokio::test]
    async fn test_forbidden_host_falls_back_to_resolved_ip() {
        let (handler, dialer) = handler(true, vec!["192.0.2.7".parse().unwrap()]);
        let stream = handler.dial("blocked.example", 443).await;
        assert!(stream.is_ok());
        let calls = dialer.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["blocked.example:443", "192.0.2.7:443"]);
    }

    #[tokio::test]
    async fn test_forbidden_host_with_failed_resolution() {
        let (handler, dialer) = handler(true, vec![]);
        let err = handler.dial("blocked.example", 443).await.err().unwrap();
        assert!(matches!(err, ProxyError::Resolve { .. }));
        assert_eq!(dialer.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_origin_form_request_is_rejected() {
        let (handler, dialer) = handler(false, vec![]);
        let response = roundtrip(&handler, b"GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 "));
        assert!(dialer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_https_absolute_form_is_rejected() {
        let (handler, _) = handler(false, vec![]);
        let response = roundtrip(&handler, b"GET https://example.com/ HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 "));
    }

    #[tokio::test]
    async fn test_oversized_headers_are_rejected() {
        let (handler, dialer) = handler(false, vec![]);
        let mut request = b"CONNECT example.com:443 HTTP/1.1\r\n".to_vec();
        let filler = format!("X-Filler: {}\r\n", "a".repeat(1000));
        while request.len() < MAX_HEADER_SIZE + 2048 {
            request.extend_from_slice(filler.as_bytes());
        }
        request.extend_from_slice(b"\r\n");

        let response = roundtrip(&handler, &request).await;
        assert!(response.starts_with("HTTP/1.1 431 "));
        assert!(dialer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_request_line_is_rejected() {
        let (handler, dialer) = handler(false, vec![]);
        let request = format!(
            "GET http://example.com/{} HTTP/1.1\r\nHost: example.com\r\n\r\n",
            "a".repeat(1024 * 1024)
        );

        let response = roundtrip(&handler, request.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 431 "));
        assert!(dialer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unterminated_request_line_is_bounded() {
        let (handler, dialer) = handler(false, vec![]);
        let request = "a".repeat(MAX_HEADER_SIZE + 1);

        let response = roundtrip(&handler, request.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 431 "));
        assert!(dialer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_body_after_head_is_forwarded() {
        let (handler, _) = handler(false, vec![]);
        let (mut client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { handler.handle(server).await });
        client
            .write_all(
                b"POST http://example.com/submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
            )
            .await
            .unwrap();

        let expected = "POST /submit HTTP/1.1\r\nContent-Length: 5\r\nHost: example.com\r\n\
                        Connection: close\r\n\r\nhello";
        let mut echoed = vec![0u8; expected.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(String::from_utf8(echoed).unwrap(), expected);

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forward_rewrites_request() {
        let (handler, dialer) = handler(false, vec![]);
        let (mut client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { handler.handle(server).await });
        client
            .write_all(
                b"GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\n\
                  Proxy-Connection: keep-alive\r\n\r\n",
            )
            .await
            .unwrap();

        // The echoing dialer hands the rewritten request straight back.
        let expected = "GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n";
        let mut echoed = vec![0u8; expected.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(String::from_utf8(echoed).unwrap(), expected);

        drop(client);
        session.await.unwrap().unwrap();
        assert_eq!(*dialer.calls.lock().unwrap(), vec!["example.com:80"]);
    }

    #[tokio::test]
    async fn test_proxy_starts_and_shuts_down() {
        let (handler, _) = handler(false, vec![]);
        let config = ProxyConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let handle = start(config, handler).await.unwrap();
        assert!(handle.local_addr.port() > 0);
        assert!(TcpStream::connect(handle.local_addr).await.is_ok());

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(TcpStream::connect(handle.local_addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _) = handler(false, vec![]);
        let config = ProxyConfig {
            bind_addr: taken.local_addr().unwrap(),
            ..Default::default()
        };
        let err = start(config, handler).await.err().unwrap();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }
}
