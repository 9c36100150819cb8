//! Error types for the hola-proxy crate.

use thiserror::Error;

/// Why a tunnel endpoint refused the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The tunnel refuses to resolve or reach the requested hostname.
    /// Retrying with a pre-resolved IP address usually succeeds.
    ForbiddenHost,
    /// Credentials were missing, malformed or expired (407).
    AuthRequired,
    /// Target disallowed for another reason (403).
    Forbidden,
    /// Any other non-200 answer.
    Other,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::ForbiddenHost => write!(f, "forbidden host"),
            RejectReason::AuthRequired => write!(f, "authentication required"),
            RejectReason::Forbidden => write!(f, "forbidden"),
            RejectReason::Other => write!(f, "rejected"),
        }
    }
}

/// Errors that can occur in the tunnel client and the local proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Discovery rejected by control plane: {endpoint} returned HTTP {status}")]
    DiscoveryRejected { endpoint: String, status: u16 },

    #[error("Client identity is blocked by the control plane")]
    Blocked,

    #[error("No endpoint with port field {0}")]
    NoSuchPortField(String),

    #[error("No matching endpoint for proxy class {class} (trial ports: {trial})")]
    NoMatchingEndpoint { class: String, trial: bool },

    #[error("DNS resolution failed for {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("TLS handshake with {server_name} failed: {reason}")]
    Tls { server_name: String, reason: String },

    #[error("Tunnel rejected {target} with status {status}: {reason}")]
    HandshakeRejected {
        target: String,
        status: u16,
        reason: RejectReason,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether the tunnel asked for a pre-resolved address instead of a hostname.
    #[must_use]
    pub fn is_forbidden_host(&self) -> bool {
        matches!(
            self,
            ProxyError::HandshakeRejected {
                reason: RejectReason::ForbiddenHost,
                ..
            }
        )
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
