//! Tunnel endpoints and the selection policy.
//!
//! Selection is a pure function over the discovered endpoint list: no I/O,
//! no randomness. Given the same list and policy it always returns the same
//! endpoint (or the same error).

use crate::config::{ProxyClass, SelectionPolicy};
use crate::error::{ProxyError, Result};
use std::net::SocketAddr;

/// Which family of tunnel ports an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortClass {
    /// Datacenter ports, also used by the lum, virt and pool classes
    Direct,
    /// Residential peer ports
    Peer,
    /// Ports reachable only through a forced port field
    Other,
}

impl PortClass {
    /// Port class serving a requested proxy class. `Skip` has none.
    #[must_use]
    pub fn for_proxy_class(class: ProxyClass) -> Option<Self> {
        match class {
            ProxyClass::Direct | ProxyClass::Lum | ProxyClass::Virt | ProxyClass::Pool => {
                Some(PortClass::Direct)
            }
            ProxyClass::Peer => Some(PortClass::Peer),
            ProxyClass::Skip => None,
        }
    }
}

/// A concrete tunnel access point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    /// Routable address to dial
    pub addr: SocketAddr,
    /// Name the endpoint's certificate must be valid for
    pub tls_name: String,
    pub class: PortClass,
    /// Reserved for trial use
    pub trial: bool,
    /// Port-map key this endpoint came from (e.g. "direct", "trial_peer")
    pub port_field: String,
}

impl TunnelEndpoint {
    /// Human-readable form, e.g. `https://zagent1.hola.org:22222`.
    #[must_use]
    pub fn url(&self) -> String {
        format!("https://{}:{}", self.tls_name, self.addr.port())
    }
}

/// Pick one endpoint according to `policy`.
///
/// 1. A non-empty forced port field wins: a number matches the endpoint
///    port, anything else matches the port-field key.
/// 2. Otherwise the first endpoint of the requested class with the
///    requested trial flag, in discovery order.
pub fn select(endpoints: &[TunnelEndpoint], policy: &SelectionPolicy) -> Result<TunnelEndpoint> {
    if let Some(forced) = policy
        .forced_port_field
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
    {
        let found = match forced.parse::<u16>() {
            Ok(port) => endpoints.iter().find(|e| e.addr.port() == port),
            Err(_) => endpoints.iter().find(|e| e.port_field == forced),
        };
        return found
            .cloned()
            .ok_or_else(|| ProxyError::NoSuchPortField(forced.to_string()));
    }

    let no_match = || ProxyError::NoMatchingEndpoint {
        class: policy.proxy_class.to_string(),
        trial: policy.use_trial_ports,
    };

    let class = PortClass::for_proxy_class(policy.proxy_class).ok_or_else(no_match)?;
    endpoints
        .iter()
        .find(|e| e.class == class && e.trial == policy.use_trial_ports)
        .cloned()
        .ok_or_else(no_match)
}
