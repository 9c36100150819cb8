//! HTTP CONNECT tunnel handler.
//!
//! Handles `CONNECT host:port HTTP/1.1` requests by:
//! 1. Dialing the target through the tunnel (resolving locally if the
//!    tunnel refuses the hostname)
//! 2. Returning `200 Connection established`
//! 3. Relaying bytes bidirectionally
//!
//! The proxy never terminates the client's TLS; it just passes bytes through.

use crate::audit;
use crate::error::{ProxyError, Result};
use crate::relay::relay;
use crate::server::{send_response, ProxyHandler};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Handle an HTTP CONNECT request.
///
/// `first_line` is the already-read CONNECT line (e.g. "CONNECT example.com:443 HTTP/1.1").
/// `buffered` holds any bytes the client sent after the request head.
pub async fn handle_connect<S>(
    first_line: &str,
    stream: &mut S,
    buffered: &[u8],
    handler: &ProxyHandler,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (host, port) = match parse_connect_target(first_line) {
        Ok(target) => target,
        Err(e) => {
            send_response(stream, 400, "Bad Request").await?;
            return Err(e);
        }
    };
    debug!("CONNECT request to {}:{}", host, port);

    let mut upstream = match handler.dial(&host, port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let (status, reason) = ProxyHandler::error_status(&e);
            audit::log_failed(audit::ProxyMode::Connect, &host, port, "CONNECT", status, &e.to_string());
            send_response(stream, status, reason).await?;
            return Err(e);
        }
    };

    send_response(stream, 200, "Connection established").await?;

    if !buffered.is_empty() {
        upstream.write_all(buffered).await?;
        upstream.flush().await?;
    }

    let mut stats = relay(&mut *stream, upstream).await;
    stats.sent = stats.sent.saturating_add(buffered.len() as u64);
    audit::log_session(audit::ProxyMode::Connect, &host, port, "CONNECT", stats);

    Ok(())
}

/// Parse the target host and port from a CONNECT request line.
///
/// Expected format: "CONNECT host:port HTTP/1.1". IPv6 literals come
/// bracketed and are returned without brackets.
pub(crate) fn parse_connect_target(line: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 || parts[0] != "CONNECT" {
        return Err(ProxyError::HttpParse(format!(
            "malformed CONNECT line: {}",
            line
        )));
    }

    let authority = parts[1];
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            ProxyError::HttpParse(format!("unterminated IPv6 literal in CONNECT: {}", authority))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, authority)?,
            None => 443,
        };
        return Ok((host.to_string(), port));
    }

    if let Some((host, port_str)) = authority.rsplit_once(':') {
        if host.is_empty() {
            return Err(ProxyError::HttpParse(format!(
                "missing host in CONNECT: {}",
                authority
            )));
        }
        Ok((host.to_string(), parse_port(port_str, authority)?))
    } else {
        // No port specified, default to 443 for CONNECT
        Ok((authority.to_string(), 443))
    }
}

fn parse_port(port: &str, authority: &str) -> Result<u16> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ProxyError::HttpParse(format!("invalid port in CONNECT: {}", authority)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_with_port() {
        let (host, port) = parse_connect_target("CONNECT api.example.com:443 HTTP/1.1").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_connect_without_port() {
        let (host, port) = parse_connect_target("CONNECT example.com HTTP/1.1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_connect_custom_port() {
        let (host, port) = parse_connect_target("CONNECT internal:8443 HTTP/1.1").unwrap();
        assert_eq!(host, "internal");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_connect_ipv6() {
        let (host, port) = parse_connect_target("CONNECT [2001:db8::1]:8443 HTTP/1.1").unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, 8443);
        let (host, port) = parse_connect_target("CONNECT [::1] HTTP/1.1").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_connect_malformed() {
        assert!(parse_connect_target("GET /").is_err());
        assert!(parse_connect_target("").is_err());
        assert!(parse_connect_target("CONNECT example.com:http HTTP/1.1").is_err());
        assert!(parse_connect_target("CONNECT example.com:0 HTTP/1.1").is_err());
        assert!(parse_connect_target("CONNECT :443 HTTP/1.1").is_err());
        assert!(parse_connect_target("CONNECT [::1 HTTP/1.1").is_err());
    }
}
