//! Tunnel handshake.
//!
//! Once TLS is up, the client sends an HTTP/1.1 `CONNECT` for the target
//! authority carrying Basic credentials. A `200` turns the connection into a
//! raw pipe to the target. Anything else is a rejection; the tunnel marks
//! hostnames it will not resolve with `X-Hola-Error: Forbidden Host`.

use super::{ERROR_HEADER, FORBIDDEN_HOST};
use crate::error::{ProxyError, RejectReason, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

/// Upper bound on the tunnel's response head.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Parsed status line and headers of the tunnel's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// First header value with the given (case-insensitive) name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Map a non-200 answer to a rejection reason; `None` means accepted.
    #[must_use]
    pub fn rejection(&self) -> Option<RejectReason> {
        match self.status {
            200 => None,
            403 if self.header(ERROR_HEADER) == Some(FORBIDDEN_HOST) => {
                Some(RejectReason::ForbiddenHost)
            }
            403 => Some(RejectReason::Forbidden),
            407 => Some(RejectReason::AuthRequired),
            _ => Some(RejectReason::Other),
        }
    }
}

/// Build the `CONNECT` request. Kept in a zeroizing buffer since it carries
/// the tunnel password.
#[must_use]
pub fn connect_request(authority: &str, proxy_authorization: &str) -> Zeroizing<String> {
    Zeroizing::new(format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: {}\r\n\r\n",
        authority, authority, proxy_authorization
    ))
}

/// Run the handshake over an established TLS stream.
///
/// Returns once the tunnel accepted; the stream is then positioned at the
/// first byte of tunneled payload.
pub async fn perform<S>(stream: &mut S, authority: &str, proxy_authorization: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = connect_request(authority, proxy_authorization);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let raw = read_response_head(stream).await?;
    let head = parse_response_head(&raw)?;
    match head.rejection() {
        None => Ok(()),
        Some(reason) => Err(ProxyError::HandshakeRejected {
            target: authority.to_string(),
            status: head.status,
            reason,
        }),
    }
}

/// Read up to and including the blank line that ends the response head.
///
/// Reads one byte at a time: anything after the head already belongs to
/// the tunneled stream and must stay unread.
pub async fn read_response_head<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::HttpParse(
                "tunnel closed the connection during handshake".to_string(),
            ));
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(head);
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(ProxyError::HttpParse(
                "tunnel response head too large".to_string(),
            ));
        }
    }
}

/// Parse a raw response head.
pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ProxyError::HttpParse("tunnel response is not UTF-8".to_string()))?;
    let mut lines = text.lines();
    let status_line = lines.next().unwrap_or("");

    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::HttpParse(format!(
            "malformed tunnel status line: {}",
            status_line
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            ProxyError::HttpParse(format!("invalid status code in response: {}", status_line))
        })?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(ResponseHead { status, headers })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_format() {
        let req = connect_request("example.com:443", "Basic dXNlcjpwYXNz");
        assert_eq!(
            *req,
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\
             Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n"
        );
    }

    #[test]
    fn test_parse_response_head() {
        let head =
            parse_response_head(b"HTTP/1.1 200 Connection established\r\nX-Foo: bar\r\n\r\n")
                .unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.header("x-foo"), Some("bar"));
        assert_eq!(head.rejection(), None);
    }

    #[test]
    fn test_forbidden_host_rejection() {
        let head = parse_response_head(
            b"HTTP/1.1 403 Forbidden\r\nX-Hola-Error: Forbidden Host\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.rejection(), Some(RejectReason::ForbiddenHost));
    }

    #[test]
    fn test_other_rejections() {
        let head = parse_response_head(b"HTTP/1.1 403 Forbidden\r\n\r\n").unwrap();
        assert_eq!(head.rejection(), Some(RejectReason::Forbidden));
        let head =
            parse_response_head(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").unwrap();
        assert_eq!(head.rejection(), Some(RejectReason::AuthRequired));
        let head = parse_response_head(b"HTTP/1.0 502 Bad Gateway\r\n\r\n").unwrap();
        assert_eq!(head.rejection(), Some(RejectReason::Other));
    }

    #[test]
    fn test_parse_response_head_malformed() {
        assert!(parse_response_head(b"garbage\r\n\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 abc\r\n\r\n").is_err());
        assert!(parse_response_head(b"").is_err());
    }

    #[tokio::test]
    async fn test_read_response_head_leaves_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 200 OK\r\n\r\npayload")
            .await
            .unwrap();

        let head = read_response_head(&mut client).await.unwrap();
        assert_eq!(head, b"HTTP/1.1 200 OK\r\n\r\n");

        let mut rest = [0u8; 7];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn test_read_response_head_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        assert!(read_response_head(&mut client).await.is_err());
    }

    #[tokio::test]
    async fn test_perform_accepts_and_rejects() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let tunnel = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 403 Forbidden\r\nX-Hola-Error: Forbidden Host\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let err = perform(&mut client, "example.com:80", "Basic abc")
            .await
            .unwrap_err();
        assert!(err.is_forbidden_host());

        let request = tunnel.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:80 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic abc\r\n"));
    }
}
