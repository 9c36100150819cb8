//! Hola wire contract.
//!
//! Everything vendor-specific lives below this module: control-plane URLs,
//! request parameters and response schema ([`api`]), and the tunnel
//! handshake encoding ([`handshake`]). The rest of the crate only sees
//! [`TunnelEndpoint`](crate::endpoint::TunnelEndpoint)s and
//! [`Credentials`](crate::credential::Credentials).

pub mod api;
pub mod handshake;

use crate::config::ProxyClass;
use crate::endpoint::PortClass;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::Zeroizing;

/// Public control-plane base URL.
pub const CCGI_URL: &str = "https://client.hola.org/client_cgi/";

/// Extension version reported when none is configured.
pub const EXT_VER: &str = "1.186.729";

pub(crate) const EXT_BROWSER: &str = "chrome";
pub(crate) const PRODUCT: &str = "cws";

/// Prefix of the tunnel login; the identity follows it.
pub const LOGIN_PREFIX: &str = "user-uuid-";

/// Header a tunnel sets when it refuses to reach a hostname.
pub(crate) const ERROR_HEADER: &str = "x-hola-error";
pub(crate) const FORBIDDEN_HOST: &str = "Forbidden Host";

pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Country parameter for `zgettunnels`, mangled per proxy class.
#[must_use]
pub fn country_param(country: &str, class: ProxyClass) -> String {
    match class {
        ProxyClass::Lum => format!("{}.pool_lum_{}_shared", country, country),
        ProxyClass::Virt => format!("{}.pool_virt_pool_{}", country, country),
        ProxyClass::Peer => format!("{}.peer", country),
        ProxyClass::Pool => format!("{}.pool", country),
        ProxyClass::Direct | ProxyClass::Skip => country.to_string(),
    }
}

/// Tunnel login for an identity.
#[must_use]
pub fn login_for(identity: &str) -> String {
    format!("{}{}", LOGIN_PREFIX, identity)
}

/// `Proxy-Authorization` value for a login/password pair.
#[must_use]
pub fn basic_auth(login: &str, password: &str) -> Zeroizing<String> {
    let raw = Zeroizing::new(format!("{}:{}", login, password));
    Zeroizing::new(format!("Basic {}", STANDARD.encode(raw.as_bytes())))
}

/// Port class of a port-map key.
#[must_use]
pub fn port_class(field: &str) -> PortClass {
    match field {
        "direct" | "trial" => PortClass::Direct,
        "peer" | "trial_peer" => PortClass::Peer,
        _ => PortClass::Other,
    }
}

/// Whether a port-map key denotes a trial port.
#[must_use]
pub fn is_trial(field: &str) -> bool {
    field == "trial" || field.starts_with("trial_")
}
