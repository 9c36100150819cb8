//! Tunnel credentials and their rotation.
//!
//! The control plane pairs every client identity with an agent key; the
//! tunnel accepts `user-uuid-<identity>` / `<agent key>` as Basic proxy
//! credentials. [`CredentialService`] authenticates once at startup and then
//! keeps re-authenticating with a fresh identity on a fixed interval,
//! swapping the pair published through [`LiveCredentials`].
//!
//! A pair is always replaced as a whole `Arc`, so readers either see the
//! old login with the old password or the new login with the new password.

use crate::config::CredentialConfig;
use crate::endpoint::TunnelEndpoint;
use crate::error::{ProxyError, Result};
use crate::hola::api::ControlPlane;
use crate::hola::{basic_auth, login_for};
use crate::identity::Identity;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};
use zeroize::Zeroizing;

/// Shortest rotation period the CLI accepts. Zero disables rotation.
pub const MIN_ROTATION: Duration = Duration::from_secs(1);

/// A login/password pair accepted by the tunnel.
pub struct Credentials {
    identity: Identity,
    login: String,
    password: Zeroizing<String>,
}

impl Credentials {
    /// Pair an identity with the agent key issued for it.
    #[must_use]
    pub fn new(identity: Identity, agent_key: Zeroizing<String>) -> Self {
        let login = login_for(identity.id());
        Self {
            identity,
            login,
            password: agent_key,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn login(&self) -> &str {
        &self.login
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Value of the `Proxy-Authorization` header for the tunnel handshake.
    #[must_use]
    pub fn proxy_authorization(&self) -> Zeroizing<String> {
        basic_auth(&self.login, &self.password)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Shared read handle on the current credentials.
///
/// Cheap to clone; every clone observes the same rotation.
#[derive(Debug, Clone)]
pub struct LiveCredentials {
    inner: Arc<RwLock<Arc<Credentials>>>,
}

impl LiveCredentials {
    #[must_use]
    pub fn new(initial: Credentials) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Snapshot of the current pair. Never blocks on network I/O.
    #[must_use]
    pub fn current(&self) -> Arc<Credentials> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub(crate) fn replace(&self, next: Credentials) {
        let next = Arc::new(next);
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
    }
}

/// Owner of the rotation task.
///
/// Dropping the service stops rotation; handles obtained from
/// [`live`](Self::live) keep serving the last credentials.
#[derive(Debug)]
pub struct CredentialService {
    live: LiveCredentials,
    shutdown_tx: watch::Sender<bool>,
}

impl CredentialService {
    /// Authenticate with a fresh identity, then start rotating.
    ///
    /// Returns the service together with the endpoint set discovered by the
    /// initial round trip. The round trip must finish within
    /// `config.timeout`; any failure is fatal and nothing is spawned.
    pub async fn start(config: CredentialConfig) -> Result<(Self, Vec<TunnelEndpoint>)> {
        let plane = ControlPlane::new(
            config.api_base.as_deref(),
            config.ext_ver.as_deref(),
            config.timeout,
        )?;

        let (credentials, endpoints) = authenticate(&plane, &config)
            .instrument(info_span!("credential"))
            .await?;
        info!(
            login = %credentials.login(),
            endpoints = endpoints.len(),
            "authenticated with control plane"
        );

        let live = LiveCredentials::new(credentials);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if config.rotation_interval.is_zero() {
            debug!("credential rotation disabled");
        } else {
            tokio::spawn(
                rotate(plane, config, live.clone(), shutdown_rx)
                    .instrument(info_span!("credential")),
            );
        }

        Ok((Self { live, shutdown_tx }, endpoints))
    }

    /// Handle on the credentials this service keeps fresh.
    #[must_use]
    pub fn live(&self) -> LiveCredentials {
        self.live.clone()
    }

    /// Stop rotating. Equivalent to dropping the service.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// One authentication round trip with a newly generated identity.
async fn authenticate(
    plane: &ControlPlane,
    config: &CredentialConfig,
) -> Result<(Credentials, Vec<TunnelEndpoint>)> {
    let identity = Identity::generate()?;
    debug!(identity = %identity, country = %config.country, "authenticating");

    let round_trip = plane.authenticate(&identity, &config.country, config.proxy_class, config.limit);
    let list = tokio::time::timeout(config.timeout, round_trip)
        .await
        .map_err(|_| {
            ProxyError::Discovery(format!(
                "control plane did not answer within {:?}",
                config.timeout
            ))
        })??;

    let endpoints = list.endpoints();
    Ok((Credentials::new(identity, list.agent_key), endpoints))
}

/// Rotation loop. Exits when the shutdown flag is set or its sender is gone.
async fn rotate(
    plane: ControlPlane,
    config: CredentialConfig,
    live: LiveCredentials,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = config.rotation_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match authenticate(&plane, &config).await {
                    Ok((credentials, _)) => {
                        debug!(login = %credentials.login(), "rotated credentials");
                        live.replace(credentials);
                    }
                    Err(e) => {
                        warn!("credential rotation failed, keeping previous credentials: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("credential rotation stopped");
                    break;
                }
            }
        }
    }
}
