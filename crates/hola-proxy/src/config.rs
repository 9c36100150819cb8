//! Configuration types.
//!
//! Plain parameter structs consumed by the core. The CLI fills them from
//! flags; embedders can build them directly or deserialize them.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default DNS upstream used to resolve hosts the tunnel refuses.
pub const DEFAULT_RESOLVER: &str = "https://cloudflare-dns.com/dns-query";

/// Default timeout for network operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default identity rotation period.
pub const DEFAULT_ROTATION: Duration = Duration::from_secs(3600);

/// Default amount of agents requested from the control plane.
pub const DEFAULT_LIST_LIMIT: u32 = 3;

/// Proxy class requested from the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyClass {
    /// Datacenter agents (default)
    #[default]
    Direct,
    /// Residential peers
    Peer,
    /// Shared luminati pool
    Lum,
    /// Virtual pool
    Virt,
    /// Generic pool
    Pool,
    /// Country string passed through untouched; needs a forced port field
    Skip,
}

impl ProxyClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyClass::Direct => "direct",
            ProxyClass::Peer => "peer",
            ProxyClass::Lum => "lum",
            ProxyClass::Virt => "virt",
            ProxyClass::Pool => "pool",
            ProxyClass::Skip => "skip",
        }
    }
}

impl std::fmt::Display for ProxyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyClass {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(ProxyClass::Direct),
            "peer" => Ok(ProxyClass::Peer),
            "lum" => Ok(ProxyClass::Lum),
            "virt" => Ok(ProxyClass::Virt),
            "pool" => Ok(ProxyClass::Pool),
            "skip" => Ok(ProxyClass::Skip),
            _ => Err(ProxyError::Config(format!(
                "unknown proxy type '{}', expected direct, peer, lum, virt, pool or skip",
                s
            ))),
        }
    }
}

/// DNS resolver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Upstream URL (`https://`, `tls://`, `tcp://`, `udp://` or bare IP)
    #[serde(default = "default_resolver")]
    pub upstream: String,

    /// Per-lookup timeout
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            upstream: default_resolver(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Control-plane authentication and rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Identity rotation period
    #[serde(default = "default_rotation")]
    pub rotation_interval: Duration,

    /// Bound for each control-plane round trip
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    /// Two-letter country code (e.g. "us")
    #[serde(default = "default_country")]
    pub country: String,

    #[serde(default)]
    pub proxy_class: ProxyClass,

    /// Amount of agents requested
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Control-plane base URL; `None` uses the public service
    #[serde(default)]
    pub api_base: Option<String>,

    /// Extension version reported to the control plane; `None` uses the built-in one
    #[serde(default)]
    pub ext_ver: Option<String>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            rotation_interval: DEFAULT_ROTATION,
            timeout: DEFAULT_TIMEOUT,
            country: default_country(),
            proxy_class: ProxyClass::default(),
            limit: DEFAULT_LIST_LIMIT,
            api_base: None,
            ext_ver: None,
        }
    }
}

/// Endpoint selection flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub proxy_class: ProxyClass,

    /// Prefer trial ports over regular ones
    #[serde(default)]
    pub use_trial_ports: bool,

    /// Port number or port-field name that overrides class-based selection
    #[serde(default)]
    pub forced_port_field: Option<String>,
}

/// Configuration for the local proxy server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen address (default: 127.0.0.1:8080)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Deadline for dialing and resolution of each session
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    /// Maximum concurrent connections (0 = unlimited).
    #[serde(default)]
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            timeout: DEFAULT_TIMEOUT,
            max_connections: 256,
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_resolver() -> String {
    DEFAULT_RESOLVER.to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_rotation() -> Duration {
    DEFAULT_ROTATION
}

fn default_country() -> String {
    "us".to_string()
}

fn default_limit() -> u32 {
    DEFAULT_LIST_LIMIT
}
