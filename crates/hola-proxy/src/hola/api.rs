//! Control-plane client.
//!
//! Authentication is two round trips: `background_init` trades a client
//! identity for a session key, then `zgettunnels` trades the session key for
//! an agent key (the tunnel password) and the list of tunnel agents.
//!
//! The response schema is vendor-defined and unversioned, so every field is
//! validated here and a missing or malformed one is a discovery error.

use super::{country_param, is_trial, port_class, CCGI_URL, EXT_BROWSER, EXT_VER, PRODUCT, USER_AGENT};
use crate::config::ProxyClass;
use crate::endpoint::TunnelEndpoint;
use crate::error::{ProxyError, Result};
use crate::identity::Identity;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

const BG_INIT_PATH: &str = "background_init";
const ZGETTUNNELS_PATH: &str = "zgettunnels";
const VPN_COUNTRIES_PATH: &str = "vpn_countries.json";

#[derive(Debug, Deserialize)]
struct BgInitResponse {
    #[serde(default)]
    key: Option<i64>,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    permanent: bool,
}

#[derive(Debug, Deserialize)]
struct ZGetTunnelsResponse {
    #[serde(default)]
    agent_key: Option<String>,
    #[serde(default)]
    ip_list: Map<String, Value>,
    #[serde(default)]
    port: Map<String, Value>,
    #[serde(default)]
    vendor: Map<String, Value>,
}

/// A tunnel agent as listed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    /// Certificate name of the agent (e.g. "zagent123.hola.org")
    pub host: String,
    pub ip: IpAddr,
    pub vendor: Option<String>,
}

/// Validated `zgettunnels` answer.
#[derive(Debug)]
pub struct TunnelList {
    /// Tunnel password paired with the identity that requested it
    pub agent_key: Zeroizing<String>,
    /// Agents in response order
    pub agents: Vec<Agent>,
    /// Port map in response order; zero means "not offered"
    pub ports: Vec<(String, u16)>,
}

impl TunnelList {
    /// Port number for a port-map key, if offered.
    #[must_use]
    pub fn port(&self, field: &str) -> Option<u16> {
        self.ports
            .iter()
            .find(|(name, port)| name == field && *port != 0)
            .map(|(_, port)| *port)
    }

    /// Flatten agents and ports into tunnel endpoints, in discovery order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<TunnelEndpoint> {
        let mut endpoints = Vec::new();
        for agent in &self.agents {
            for (field, port) in &self.ports {
                if *port == 0 {
                    continue;
                }
                endpoints.push(TunnelEndpoint {
                    addr: SocketAddr::new(agent.ip, *port),
                    tls_name: agent.host.clone(),
                    class: port_class(field),
                    trial: is_trial(field),
                    port_field: field.clone(),
                });
            }
        }
        endpoints
    }
}

/// HTTP client for the control plane.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    client: reqwest::Client,
    base: Url,
    ext_ver: String,
}

impl ControlPlane {
    /// Create a client for `api_base` (default: the public service).
    pub fn new(api_base: Option<&str>, ext_ver: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut base = api_base.unwrap_or(CCGI_URL).to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .map_err(|e| ProxyError::Config(format!("invalid control plane URL '{}': {}", base, e)))?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base,
            ext_ver: ext_ver.unwrap_or(EXT_VER).to_string(),
        })
    }

    /// Full authentication: session key, then tunnels for `country`/`class`.
    pub async fn authenticate(
        &self,
        identity: &Identity,
        country: &str,
        class: ProxyClass,
        limit: u32,
    ) -> Result<TunnelList> {
        let session_key = self.background_init(identity).await?;
        self.zgettunnels(identity, session_key, country, class, limit)
            .await
    }

    /// Register an identity and obtain its session key.
    pub async fn background_init(&self, identity: &Identity) -> Result<i64> {
        let url = self.endpoint(BG_INIT_PATH)?;
        let response = self
            .client
            .post(url)
            .query(&[("uuid", identity.id())])
            .form(&[("login", "1"), ("ver", self.ext_ver.as_str())])
            .send()
            .await
            .map_err(|e| ProxyError::Discovery(format!("{} request failed: {}", BG_INIT_PATH, e)))?;

        let body = read_body(response, BG_INIT_PATH).await?;
        let parsed: BgInitResponse = serde_json::from_slice(&body).map_err(|e| {
            ProxyError::Discovery(format!("malformed {} response: {}", BG_INIT_PATH, e))
        })?;

        if parsed.blocked {
            debug!(permanent = parsed.permanent, "identity blocked by control plane");
            return Err(ProxyError::Blocked);
        }

        parsed.key.ok_or_else(|| {
            ProxyError::Discovery(format!("{} response has no session key", BG_INIT_PATH))
        })
    }

    /// Fetch the tunnel list for a registered identity.
    pub async fn zgettunnels(
        &self,
        identity: &Identity,
        session_key: i64,
        country: &str,
        class: ProxyClass,
        limit: u32,
    ) -> Result<TunnelList> {
        let url = self.endpoint(ZGETTUNNELS_PATH)?;
        let ping_id = rand::random::<f64>().to_string();
        let session_key = session_key.to_string();
        let limit = limit.to_string();
        let country = country_param(country, class);
        let params = [
            ("country", country.as_str()),
            ("limit", limit.as_str()),
            ("ping_id", ping_id.as_str()),
            ("ext_ver", self.ext_ver.as_str()),
            ("browser", EXT_BROWSER),
            ("product", PRODUCT),
            ("uuid", identity.id()),
            ("session_key", session_key.as_str()),
            ("is_premium", "0"),
        ];

        debug!(country = %country, limit = %limit, "requesting tunnels");
        let response = self
            .client
            .get(url)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                ProxyError::Discovery(format!("{} request failed: {}", ZGETTUNNELS_PATH, e))
            })?;

        let body = read_body(response, ZGETTUNNELS_PATH).await?;
        parse_tunnels(&body)
    }

    /// Country codes with available agents.
    pub async fn countries(&self) -> Result<Vec<String>> {
        let url = self.endpoint(VPN_COUNTRIES_PATH)?;
        let response = self.client.get(url).send().await.map_err(|e| {
            ProxyError::Discovery(format!("{} request failed: {}", VPN_COUNTRIES_PATH, e))
        })?;
        let body = read_body(response, VPN_COUNTRIES_PATH).await?;
        serde_json::from_slice(&body).map_err(|e| {
            ProxyError::Discovery(format!("malformed {} response: {}", VPN_COUNTRIES_PATH, e))
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| ProxyError::Config(format!("invalid control plane path '{}': {}", path, e)))
    }
}

/// Read a response body, turning a non-2xx status into a rejection.
async fn read_body(response: reqwest::Response, endpoint: &str) -> Result<Vec<u8>> {
    let status = response.status();
    if !status.is_success() {
        return Err(ProxyError::DiscoveryRejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| ProxyError::Discovery(format!("failed to read {} response: {}", endpoint, e)))?;
    Ok(body.to_vec())
}

/// Validate a `zgettunnels` body.
fn parse_tunnels(body: &[u8]) -> Result<TunnelList> {
    let raw: ZGetTunnelsResponse = serde_json::from_slice(body)
        .map_err(|e| ProxyError::Discovery(format!("malformed {} response: {}", ZGETTUNNELS_PATH, e)))?;

    let agent_key = match raw.agent_key {
        Some(key) if !key.is_empty() => Zeroizing::new(key),
        _ => return Err(ProxyError::Discovery("response has no agent key".to_string())),
    };

    if raw.ip_list.is_empty() {
        return Err(ProxyError::Discovery("no tunnels found in response".to_string()));
    }

    let mut agents = Vec::with_capacity(raw.ip_list.len());
    for (host, ip) in &raw.ip_list {
        let ip = ip
            .as_str()
            .and_then(|s| s.parse::<IpAddr>().ok())
            .ok_or_else(|| ProxyError::Discovery(format!("invalid IP for agent {}: {}", host, ip)))?;
        agents.push(Agent {
            host: host.clone(),
            ip,
            vendor: string_field(&raw.vendor, host),
        });
    }

    let mut ports = Vec::with_capacity(raw.port.len());
    for (field, port) in &raw.port {
        let port = port
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| ProxyError::Discovery(format!("invalid port for field {}: {}", field, port)))?;
        ports.push((field.clone(), port));
    }
    if ports.iter().all(|(_, port)| *port == 0) {
        return Err(ProxyError::Discovery("response has no usable ports".to_string()));
    }

    Ok(TunnelList {
        agent_key,
        agents,
        ports,
    })
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}
