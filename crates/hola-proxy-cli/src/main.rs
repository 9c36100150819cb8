//! hola-proxy CLI - local HTTP proxy routed through the Hola network
//!
//! This is the CLI binary that wires the hola-proxy library together:
//! resolver, credential service, endpoint selection, tunnel dialer and the
//! local proxy server.

mod cli;
mod output;

use clap::Parser;
use cli::Cli;
use hola_proxy::hola::api::ControlPlane;
use hola_proxy::identity::Identity;
use hola_proxy::{
    select, server, CredentialService, Credentials, ProxyError, ProxyHandler, Resolver,
    TunnelDialer,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for arguments that parse but do not validate.
/// clap uses the same code for parse errors.
const EXIT_INVALID_ARGS: i32 = 2;
/// Exit code when the async runtime cannot be created.
const EXIT_RUNTIME: i32 = 1;

/// Startup phase that failed. Each phase has its own exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    List,
    Credentials,
    Selection,
    Resolver,
    Bind,
}

impl Phase {
    fn exit_code(self) -> i32 {
        match self {
            Phase::List => 3,
            Phase::Credentials => 4,
            Phase::Selection => 5,
            Phase::Resolver => 6,
            Phase::Bind => 7,
        }
    }
}

#[derive(Debug)]
struct StartupError {
    phase: Phase,
    source: ProxyError,
}

fn at(phase: Phase) -> impl FnOnce(ProxyError) -> StartupError {
    move |source| StartupError { phase, source }
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --verbosity
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = cli.validate() {
        eprintln!("hola-proxy: {}", e);
        std::process::exit(EXIT_INVALID_ARGS);
    }

    // Multi-thread runtime: the accept loop, connection handlers and the
    // rotation task all run on worker threads.
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("hola-proxy: failed to start runtime: {}", e);
            std::process::exit(EXIT_RUNTIME);
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        error!("{:?} failed: {}", e.phase, e.source);
        eprintln!("hola-proxy: {}", e.source);
        std::process::exit(e.phase.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    if cli.list_countries {
        return list_countries(&cli).await.map_err(at(Phase::List));
    }
    if cli.list_proxies {
        return list_proxies(&cli).await.map_err(at(Phase::List));
    }

    let resolver = Resolver::new(cli.resolver_config()).map_err(at(Phase::Resolver))?;

    info!("Initializing credential service...");
    let (service, endpoints) = CredentialService::start(cli.credential_config())
        .await
        .map_err(at(Phase::Credentials))?;

    let endpoint = select(&endpoints, &cli.selection_policy()).map_err(at(Phase::Selection))?;
    info!(
        addr = %endpoint.addr,
        port_field = %endpoint.port_field,
        "Endpoint: {}",
        endpoint.url()
    );

    let dialer = TunnelDialer::new(endpoint, service.live()).map_err(at(Phase::Selection))?;
    let handler = ProxyHandler::new(Arc::new(dialer), Arc::new(resolver), cli.timeout);

    let handle = server::start(cli.proxy_config(), handler)
        .await
        .map_err(at(Phase::Bind))?;
    info!("Starting proxy server on {}", handle.local_addr);

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
    handle.shutdown();
    service.shutdown();
    Ok(())
}

/// Print the countries with available agents.
async fn list_countries(cli: &Cli) -> hola_proxy::Result<()> {
    let plane = ControlPlane::new(None, None, cli.timeout)?;
    let countries = plane.countries().await?;
    output::write_countries(&mut std::io::stdout().lock(), &countries)?;
    Ok(())
}

/// Authenticate once and print the credentials and agent list.
async fn list_proxies(cli: &Cli) -> hola_proxy::Result<()> {
    let config = cli.credential_config();
    let plane = ControlPlane::new(None, None, cli.timeout)?;
    let identity = Identity::generate()?;
    let list = plane
        .authenticate(&identity, &config.country, config.proxy_class, config.limit)
        .await?;
    let credentials = Credentials::new(identity, list.agent_key.clone());
    output::write_proxy_list(&mut std::io::stdout().lock(), &credentials, &list)?;
    Ok(())
}
