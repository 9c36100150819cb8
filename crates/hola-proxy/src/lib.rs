//! Local HTTP proxy that tunnels through the Hola network.
//!
//! `hola-proxy` is assembled from four parts:
//!
//! 1. **Credential service** (`credential`) - Generates a client identity,
//!    registers it with the Hola control plane, fetches the tunnel list and
//!    keeps the derived credentials fresh on a rotation interval.
//!
//! 2. **Endpoint selection** (`endpoint`) - Picks one tunnel endpoint from
//!    the discovered list by proxy class, trial-port preference or a forced
//!    port field.
//!
//! 3. **Tunnel dialer** (`dialer`) - Opens TLS to the selected endpoint
//!    (no SNI) and performs an authenticated HTTP CONNECT through it.
//!
//! 4. **Local proxy** (`server`) - Accepts CONNECT and absolute-URI plain
//!    HTTP requests and relays them over dialed tunnel streams. When the
//!    tunnel refuses a hostname the target is resolved locally through the
//!    configured DNS upstream (`resolver`) and dialed by address.

pub mod audit;
pub mod config;
pub mod connect;
pub mod credential;
pub mod dialer;
pub mod endpoint;
pub mod error;
pub mod forward;
pub mod hola;
pub mod identity;
pub mod relay;
pub mod resolver;
pub mod server;

pub use config::{CredentialConfig, ProxyClass, ProxyConfig, ResolverConfig, SelectionPolicy};
pub use credential::{CredentialService, Credentials, LiveCredentials};
pub use dialer::{BoxedStream, Dialer, TunnelDialer};
pub use endpoint::{select, TunnelEndpoint};
pub use error::{ProxyError, Result};
pub use resolver::{NameResolver, Resolver};
pub use server::{start, ProxyHandle, ProxyHandler};
