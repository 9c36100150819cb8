//! CLI argument definitions for hola-proxy
//!
//! Uses clap for argument parsing. Flags map one-to-one onto the library's
//! config structs; [`Cli::validate`] covers the checks clap cannot express.

use clap::Parser;
use hola_proxy::config::{DEFAULT_LIST_LIMIT, DEFAULT_RESOLVER};
use hola_proxy::credential::MIN_ROTATION;
use hola_proxy::{CredentialConfig, ProxyClass, ProxyConfig, ResolverConfig, SelectionPolicy};
use std::net::SocketAddr;
use std::time::Duration;

/// hola-proxy - local HTTP proxy routed through the Hola network
///
/// Authenticates with the Hola control plane, picks a tunnel endpoint for
/// the requested country and proxy class, and serves CONNECT and plain HTTP
/// requests on a local port through that endpoint.
#[derive(Parser, Debug)]
#[command(name = "hola-proxy")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # Proxy through US datacenter agents on 127.0.0.1:8080
    hola-proxy

    # German residential peers, rotate identity every 30 minutes
    hola-proxy --country de --proxy-type peer --rotate 30m

    # Show available countries
    hola-proxy --list-countries

    # Show agents and credentials for a country
    hola-proxy --country gb --list-proxies --limit 5
")]
pub struct Cli {
    /// Desired proxy location (two-letter country code)
    #[arg(long, default_value = "us")]
    pub country: String,

    /// List available countries and exit
    #[arg(long, conflicts_with = "list_proxies")]
    pub list_countries: bool,

    /// Output proxy list and exit
    #[arg(long)]
    pub list_proxies: bool,

    /// Amount of proxies in retrieved list
    #[arg(long, default_value_t = DEFAULT_LIST_LIMIT, value_parser = clap::value_parser!(u32).range(1..))]
    pub limit: u32,

    /// HTTP proxy listen address
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub bind_address: SocketAddr,

    /// Logging verbosity (10 - debug, 20 - info, 30 - warning, 40 - error, 50 - critical)
    #[arg(long, default_value_t = 20)]
    pub verbosity: u8,

    /// Timeout for network operations
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Rotate user ID once per given period (0 disables rotation)
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    pub rotate: Duration,

    /// Proxy type: direct, peer, lum, virt, pool or skip
    #[arg(long, default_value = "direct", value_parser = parse_proxy_class)]
    pub proxy_type: ProxyClass,

    /// DNS upstream for hosts the tunnel refuses (https://, tls://, tcp://, udp:// or IP)
    #[arg(long, default_value = DEFAULT_RESOLVER)]
    pub resolver: String,

    /// Use the given port field (name or number) instead of selecting by proxy type
    #[arg(long)]
    pub force_port_field: Option<String>,

    /// Use regular ports instead of trial ports
    #[arg(long)]
    pub dont_use_trial: bool,
}

impl Cli {
    /// Checks that span several flags or depend on library limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.country.trim().is_empty() {
            return Err("--country must not be empty".to_string());
        }
        if self.timeout.is_zero() {
            return Err("--timeout must be positive".to_string());
        }
        if !self.rotate.is_zero() && self.rotate < MIN_ROTATION {
            return Err(format!(
                "--rotate must be 0 or at least {}s",
                MIN_ROTATION.as_secs()
            ));
        }
        if self.proxy_type == ProxyClass::Skip
            && self
                .force_port_field
                .as_deref()
                .map_or(true, |field| field.trim().is_empty())
        {
            return Err("--proxy-type skip requires --force-port-field".to_string());
        }
        Ok(())
    }

    pub fn credential_config(&self) -> CredentialConfig {
        CredentialConfig {
            rotation_interval: self.rotate,
            timeout: self.timeout,
            country: self.country.trim().to_lowercase(),
            proxy_class: self.proxy_type,
            limit: self.limit,
            ..Default::default()
        }
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            proxy_class: self.proxy_type,
            use_trial_ports: !self.dont_use_trial,
            forced_port_field: self.force_port_field.clone(),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            upstream: self.resolver.clone(),
            timeout: self.timeout,
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            bind_addr: self.bind_address,
            timeout: self.timeout,
            ..Default::default()
        }
    }

    /// `tracing` filter directive for `--verbosity`.
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0..=10 => "debug",
            11..=20 => "info",
            21..=30 => "warn",
            _ => "error",
        }
    }
}

fn parse_proxy_class(s: &str) -> Result<ProxyClass, String> {
    s.parse::<ProxyClass>().map_err(|e| e.to_string())
}

/// Parse a duration such as `10s`, `1h30m` or `250ms`.
///
/// A bare `0` is accepted; any other value needs a unit.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{}': {}", s, e))
}
