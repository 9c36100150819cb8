//! Plain HTTP forwarding.
//!
//! A request with an absolute `http://` target is sent through the tunnel
//! to its origin. The request head is rewritten to origin form, hop-by-hop
//! headers are stripped and `Connection: close` is added so the session
//! ends with the response. The response streams back untouched.

use crate::audit;
use crate::error::{ProxyError, Result};
use crate::relay::relay;
use crate::server::{send_response, ProxyHandler};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use url::Url;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

/// Parsed absolute-form request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ForwardTarget {
    pub host: String,
    pub port: u16,
    /// Path plus query, origin form
    pub path: String,
}

impl ForwardTarget {
    /// Value for a `Host` header: the port is omitted when it is the default.
    fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == 80 {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// Handle a non-CONNECT request.
///
/// `header_bytes` is the raw header block after the request line;
/// `buffered` holds any body bytes already read past it.
pub async fn handle_forward<S>(
    first_line: &str,
    stream: &mut S,
    header_bytes: &[u8],
    buffered: &[u8],
    handler: &ProxyHandler,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let parsed = parse_request_line(first_line).and_then(|(method, target, version)| {
        parse_target(&target).map(|target| (method, target, version))
    });
    let (method, target, version) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            send_response(stream, 400, "Bad Request").await?;
            return Err(e);
        }
    };
    debug!("Forwarding {} http://{}:{}{}", method, target.host, target.port, target.path);

    let mut upstream = match handler.dial(&target.host, target.port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let (status, reason) = ProxyHandler::error_status(&e);
            audit::log_failed(
                audit::ProxyMode::Forward,
                &target.host,
                target.port,
                &method,
                status,
                &e.to_string(),
            );
            send_response(stream, status, reason).await?;
            return Err(e);
        }
    };

    let head = build_request_head(&method, &target, &version, header_bytes);
    upstream.write_all(head.as_bytes()).await?;
    if !buffered.is_empty() {
        upstream.write_all(buffered).await?;
    }
    upstream.flush().await?;

    let mut stats = relay(&mut *stream, upstream).await;
    stats.sent = stats
        .sent
        .saturating_add((head.len() + buffered.len()) as u64);
    audit::log_session(
        audit::ProxyMode::Forward,
        &target.host,
        target.port,
        &method,
        stats,
    );

    Ok(())
}

/// Parse an HTTP request line into (method, target, version).
fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        )));
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parts[2].to_string(),
    ))
}

/// Accept only absolute `http://` targets.
pub(crate) fn parse_target(target: &str) -> Result<ForwardTarget> {
    let url = Url::parse(target)
        .map_err(|_| ProxyError::HttpParse(format!("request target is not absolute: {}", target)))?;

    if url.scheme() != "http" {
        return Err(ProxyError::HttpParse(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::HttpParse(format!("missing host in URL: {}", target)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port().unwrap_or(80);

    Ok(ForwardTarget {
        host,
        port,
        path: origin_form(target),
    })
}

/// Path and query exactly as the client sent them, fragment dropped.
///
/// Origins may treat dot segments and percent-escapes specially, so the
/// path is not normalized.
fn origin_form(target: &str) -> String {
    let rest = target.split_once("://").map_or(target, |(_, rest)| rest);
    let rest = rest.split('#').next().unwrap_or_default();
    match rest.find(|c: char| c == '/' || c == '?') {
        Some(i) if rest[i..].starts_with('/') => rest[i..].to_string(),
        Some(i) => format!("/{}", &rest[i..]),
        None => "/".to_string(),
    }
}

/// Re-serialize the request head for the origin.
fn build_request_head(
    method: &str,
    target: &ForwardTarget,
    version: &str,
    header_bytes: &[u8],
) -> String {
    let headers = parse_headers(header_bytes);

    // Connection may name further per-hop headers
    let listed: Vec<String> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut head = format!("{} {} {}\r\n", method, target.path, version);
    let mut has_host = false;
    for (name, value) in &headers {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || listed.contains(&lower) {
            continue;
        }
        if lower == "host" {
            has_host = true;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !has_host {
        head.push_str(&format!("Host: {}\r\n", target.host_header()));
    }
    head.push_str("Connection: close\r\n\r\n");
    head
}

fn parse_headers(header_bytes: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(header_bytes)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}
