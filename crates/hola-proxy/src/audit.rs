//! Audit logging for proxy sessions.
//!
//! Logs every session outcome with structured fields via `tracing`.
//! Credentials and payload bytes are never included in audit logs.

use crate::relay::RelayStats;
use tracing::info;

/// How the client asked for the session.
#[derive(Debug, Clone, Copy)]
pub enum ProxyMode {
    /// CONNECT tunnel
    Connect,
    /// Absolute-URI plain HTTP request
    Forward,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Connect => write!(f, "connect"),
            ProxyMode::Forward => write!(f, "forward"),
        }
    }
}

/// Log a completed session with its traffic counters.
pub fn log_session(mode: ProxyMode, host: &str, port: u16, method: &str, stats: RelayStats) {
    info!(
        target: "hola_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        method = method,
        decision = "relayed",
        sent = stats.sent,
        received = stats.received,
        "proxy session closed"
    );
}

/// Log a session that never reached the relay stage.
pub fn log_failed(mode: ProxyMode, host: &str, port: u16, method: &str, status: u16, reason: &str) {
    info!(
        target: "hola_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        method = method,
        decision = "failed",
        status = status,
        reason = reason,
        "proxy session failed"
    );
}
