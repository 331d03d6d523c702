//! Process-level service: one supervisor per enabled provider, driven by the
//! configuration file and process signals.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{AuthMethod, Config, ProviderConnection, TuningConfig};
use crate::constants::SHUTDOWN_TIMEOUT_SECS;
use crate::credentials::{CredentialResolver, KeyringSecretStore, SecretKind, SecretStore};
use crate::listener::ListenerDeps;
use crate::mail::ImapConnector;
use crate::oauth2::OAuth2Client;
use crate::publish::EventPublisher;
use crate::store::Store;
use crate::supervisor::{OperatorAlert, SupervisorCommand, SupervisorHandle, SupervisorSettings, spawn_supervisor};

/// Supervisor of one provider and what it was started from
struct Supervised {
    handle: SupervisorHandle,
    provider: ProviderConnection,
    tuning: TuningConfig,
    fingerprint: String,
}

pub struct Service {
    config: Config,
    deps: ListenerDeps,
    secrets: Arc<dyn SecretStore>,
    supervisors: BTreeMap<String, Supervised>,
    alert_tx: mpsc::Sender<OperatorAlert>,
    alerts: mpsc::Receiver<OperatorAlert>,
    shutdown_timeout: Duration,
}

impl Service {
    /// Wire the production collaborators from `config`.
    pub async fn from_config(config: Config) -> Result<Self> {
        let db_path = config.database_path()?;
        let store = Store::open(&db_path)
            .await
            .with_context(|| format!("Failed to open state database {}", db_path.display()))?;

        let secrets: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::new());
        let refresher = OAuth2Client::new(config.tuning.connect_timeout())?;
        let credentials = Arc::new(CredentialResolver::new(Arc::clone(&secrets), Arc::new(refresher)));
        let publisher = EventPublisher::from_config(&config.publisher, config.tuning.publish_attempts)?;

        let deps = ListenerDeps {
            connector: Arc::new(ImapConnector::new()?),
            credentials,
            folder_states: Arc::new(store.clone()),
            leases: Arc::new(store),
            publisher: Arc::new(publisher),
            instance_id: config.instance_id(),
        };
        Ok(Self::new(config, deps, secrets))
    }

    pub fn new(config: Config, deps: ListenerDeps, secrets: Arc<dyn SecretStore>) -> Self {
        let (alert_tx, alerts) = mpsc::channel(64);
        Self {
            config,
            deps,
            secrets,
            supervisors: BTreeMap::new(),
            alert_tx,
            alerts,
            shutdown_timeout: Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
        }
    }

    /// Start every enabled provider and run until Ctrl-C or SIGTERM.
    /// SIGHUP reloads the configuration file.
    pub async fn run(mut self) -> Result<()> {
        let mut signals = Signals::new().context("Failed to install signal handlers")?;

        tracing::info!(
            instance = %self.deps.instance_id,
            providers = self.config.providers.len(),
            "Service starting"
        );
        let providers: Vec<ProviderConnection> = self.config.enabled_providers().cloned().collect();
        for provider in providers {
            self.start(provider);
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, shutting down");
                    break;
                }
                signal = signals.recv() => match signal {
                    Signal::Terminate => {
                        tracing::info!("SIGTERM received, shutting down");
                        break;
                    }
                    Signal::Reload => match Config::load() {
                        Ok(config) => {
                            tracing::info!("SIGHUP received, reloading configuration");
                            self.apply(config).await;
                        }
                        Err(e) => tracing::error!("Reload failed, keeping current configuration: {:#}", e),
                    },
                },
                Some(alert) = self.alerts.recv() => log_alert(&alert),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn start(&mut self, provider: ProviderConnection) {
        self.deps.credentials.register(&provider);
        let tuning = self.config.tuning.for_provider(&provider.tuning);
        let handle = spawn_supervisor(
            self.deps.clone(),
            Arc::new(provider.clone()),
            SupervisorSettings::from(&tuning),
            self.alert_tx.clone(),
        );
        let fingerprint = secret_fingerprint(self.secrets.as_ref(), &provider);
        self.supervisors.insert(
            provider.id.clone(),
            Supervised {
                handle,
                provider,
                tuning,
                fingerprint,
            },
        );
    }

    /// Bring the running supervisors in line with `config`.
    ///
    /// Removed or disabled providers are stopped, new ones started, changed
    /// ones restarted. Unchanged providers whose stored secrets changed get
    /// `CredentialsRotated`.
    pub async fn apply(&mut self, config: Config) {
        if config.publisher != self.config.publisher || config.database != self.config.database {
            tracing::warn!("Publisher and database changes take effect after a restart");
        }
        let wanted: BTreeMap<String, ProviderConnection> = config
            .enabled_providers()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();
        let global_tuning = config.tuning.clone();
        self.config = config;

        let running: Vec<String> = self.supervisors.keys().cloned().collect();
        for id in running {
            let Some(provider) = wanted.get(&id) else {
                if let Some(old) = self.supervisors.remove(&id) {
                    tracing::info!(provider = %id, "Provider removed or disabled");
                    old.handle.stop(SupervisorCommand::Disable, self.shutdown_timeout).await;
                }
                continue;
            };

            let tuning = global_tuning.for_provider(&provider.tuning);
            let Some(current) = self.supervisors.get_mut(&id) else {
                continue;
            };
            if current.provider != *provider || current.tuning != tuning {
                tracing::info!(provider = %id, "Provider configuration changed, restarting");
                if let Some(old) = self.supervisors.remove(&id) {
                    old.handle.shutdown(self.shutdown_timeout).await;
                }
                self.deps.credentials.invalidate(&id).await;
                self.start(provider.clone());
                continue;
            }

            let fingerprint = secret_fingerprint(self.secrets.as_ref(), provider);
            if fingerprint != current.fingerprint {
                tracing::info!(provider = %id, "Stored credentials changed");
                current.fingerprint = fingerprint;
                let _ = current.handle.send(SupervisorCommand::CredentialsRotated).await;
            }
        }

        for (id, provider) in wanted {
            if !self.supervisors.contains_key(&id) {
                tracing::info!(provider = %id, "Provider added");
                self.start(provider);
            }
        }
    }

    pub async fn shutdown(mut self) {
        let supervisors = std::mem::take(&mut self.supervisors);
        let stops = supervisors
            .into_values()
            .map(|s| s.handle.shutdown(self.shutdown_timeout));
        futures::future::join_all(stops).await;

        while let Ok(alert) = self.alerts.try_recv() {
            log_alert(&alert);
        }
        tracing::info!("Service stopped");
    }
}

fn log_alert(alert: &OperatorAlert) {
    tracing::error!(
        tenant = %alert.tenant,
        provider = %alert.provider,
        folder = %alert.folder,
        state = "suspended",
        at = %alert.at,
        "Operator attention required: {}",
        alert.reason
    );
}

/// Digest of the long-lived secrets a provider authenticates with.
///
/// Access tokens are excluded; the resolver rewrites them itself.
fn secret_fingerprint(secrets: &dyn SecretStore, provider: &ProviderConnection) -> String {
    let kinds: &[SecretKind] = match provider.auth {
        AuthMethod::Password => &[SecretKind::Password],
        AuthMethod::OAuth2 { .. } => &[SecretKind::RefreshToken, SecretKind::OAuthClientSecret],
    };

    let mut hasher = Sha256::new();
    for kind in kinds {
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0]);
        if let Ok(Some(value)) = secrets.get(&provider.id, *kind) {
            hasher.update(value.as_bytes());
        }
        hasher.update([0]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

enum Signal {
    Terminate,
    Reload,
}

#[cfg(unix)]
struct Signals {
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.terminate.recv() => Signal::Terminate,
            _ = self.hangup.recv() => Signal::Reload,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Signal {
        std::future::pending().await
    }
}
