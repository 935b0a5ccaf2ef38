//! # Sync Pipeline
//!
//! Keeps the credential cache consistent with the cluster.
//!
//! The pipeline is snapshot-then-watch: [`snapshot::load`] builds a
//! fresh mapping and the resume version, [`session::WatchSession`]
//! applies incremental events from there. The [`SyncController`] owns
//! the single live session and re-runs the whole pipeline whenever the
//! configuration changes or the session reports an expired resume
//! point.
//!
//! Pipeline states: Initializing → Snapshotting → Watching →
//! {Resyncing → Snapshotting | Stopped}.

pub mod session;
pub mod snapshot;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use kube::Client;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info};

use crate::cache::CredentialCache;
use crate::config::SettingsStore;
use crate::convert::ConverterRegistry;
use crate::metrics;

pub use session::WatchSession;
pub use snapshot::Snapshot;

/// Pipeline-level failures.
///
/// Both variants are fatal to the pipeline run that hit them: no
/// partial cache is ever installed.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to connect to the cluster: {0}")]
    Connect(#[source] kube::Error),
    #[error("failed to list secrets for the snapshot: {0}")]
    List(#[source] kube::Error),
}

/// Where the pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Initializing,
    Snapshotting,
    Watching,
    Resyncing,
    Stopped,
}

impl SyncState {
    /// The provider serves fresh data only while watching.
    pub fn is_ready(self) -> bool {
        self == SyncState::Watching
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "Initializing",
            Self::Snapshotting => "Snapshotting",
            Self::Watching => "Watching",
            Self::Resyncing => "Resyncing",
            Self::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

type ClientFactory = Box<dyn Fn() -> BoxFuture<'static, Result<Client, kube::Error>> + Send + Sync>;

/// Drives the snapshot + watch pipeline and owns the live session.
///
/// Session handovers (stop old, snapshot, start new) happen inside one
/// critical section, so at most one session mutates the cache at any
/// time.
pub struct SyncController {
    cache: Arc<CredentialCache>,
    registry: Arc<ConverterRegistry>,
    settings: SettingsStore,
    client_factory: ClientFactory,
    session: Mutex<Option<WatchSession>>,
    state_tx: watch::Sender<SyncState>,
    resync_tx: mpsc::Sender<()>,
    resync_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl fmt::Debug for SyncController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncController")
            .field("settings", &self.settings)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl SyncController {
    pub fn new(
        cache: Arc<CredentialCache>,
        registry: Arc<ConverterRegistry>,
        settings: SettingsStore,
    ) -> Arc<Self> {
        let factory: ClientFactory =
            Box::new(|| -> BoxFuture<'static, Result<Client, kube::Error>> {
                Box::pin(Client::try_default())
            });
        Self::with_client_factory(cache, registry, settings, factory)
    }

    /// Every pipeline run builds a fresh client from the factory, so a
    /// changed kubeconfig/in-cluster target is picked up on restart.
    fn with_client_factory(
        cache: Arc<CredentialCache>,
        registry: Arc<ConverterRegistry>,
        settings: SettingsStore,
        client_factory: ClientFactory,
    ) -> Arc<Self> {
        let (state_tx, _state_rx) = watch::channel(SyncState::Initializing);
        let (resync_tx, resync_rx) = mpsc::channel(1);
        Arc::new(Self {
            cache,
            registry,
            settings,
            client_factory,
            session: Mutex::new(None),
            state_tx,
            resync_tx,
            resync_rx: std::sync::Mutex::new(Some(resync_rx)),
        })
    }

    /// Subscribes to pipeline state changes (readiness probes, tests).
    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// Runs the initial pipeline and starts reacting to configuration
    /// changes and resync requests.
    ///
    /// A failed initial listing is returned to the caller and installs
    /// no cache; the caller decides whether to retry or exit.
    pub async fn start(self: Arc<Self>) -> Result<(), SyncError> {
        self.run_pipeline().await?;
        Self::spawn_supervisor(self);
        Ok(())
    }

    /// Tears down the current session and re-runs the pipeline with the
    /// current configuration. Failures are logged, not propagated:
    /// there is no caller to report to on this path.
    pub async fn restart(&self) {
        if let Err(err) = self.run_pipeline().await {
            error!(error = %err, "credential sync pipeline failed to restart");
            self.state_tx.send_replace(SyncState::Stopped);
        }
    }

    /// Stops the live session and its connection. Idempotent: safe to
    /// call when already stopped or after the session ended on its own.
    pub async fn stop(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.stop().await;
        }
        self.state_tx.send_replace(SyncState::Stopped);
        info!("credential sync stopped");
    }

    fn spawn_supervisor(controller: Arc<Self>) {
        let taken = controller
            .resync_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        // second start() call: the supervisor is already running
        let Some(mut resync_rx) = taken else {
            return;
        };

        let mut settings_rx = controller.settings.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = settings_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!("configuration changed, restarting credential sync pipeline");
                        controller.restart().await;
                    }
                    request = resync_rx.recv() => {
                        match request {
                            Some(()) => {
                                info!("watch resume point expired, rebuilding the credential cache");
                                controller.restart().await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    /// One full pipeline run: close the old session, take a snapshot,
    /// install it, open a new watch session from the snapshot's resource
    /// version. The session task reports `Watching` once its
    /// subscription is open; until then the state stays Snapshotting.
    async fn run_pipeline(&self) -> Result<(), SyncError> {
        // Holding the slot across the whole run serializes session
        // handovers; the old session is closed before the new listing
        // so two sessions never mutate overlapping state.
        let mut slot = self.session.lock().await;
        if let Some(old) = slot.take() {
            old.stop().await;
        }

        self.state_tx.send_replace(SyncState::Snapshotting);
        let settings = self.settings.current();
        let client = (self.client_factory)().await.map_err(SyncError::Connect)?;
        let snapshot =
            snapshot::load(client.clone(), settings.selector(), self.registry.as_ref()).await?;

        let Snapshot {
            credentials,
            resource_version,
        } = snapshot;
        metrics::set_credentials_cached(
            credentials.values().map(|entries| entries.len() as i64).sum(),
        );
        self.cache.replace_all(credentials);

        let session = WatchSession::spawn(
            client,
            settings.selector().map(str::to_owned),
            resource_version,
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
            self.resync_tx.clone(),
            self.state_tx.clone(),
        );
        *slot = Some(session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kube::core::ErrorResponse;
    use tokio::time::timeout;

    use super::*;
    use crate::config::ProviderSettings;

    fn unreachable_cluster_factory() -> ClientFactory {
        Box::new(|| -> BoxFuture<'static, Result<Client, kube::Error>> {
            Box::pin(async {
                Err(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: "connection refused".to_string(),
                    reason: "ServiceUnavailable".to_string(),
                    code: 503,
                }))
            })
        })
    }

    fn test_controller() -> Arc<SyncController> {
        SyncController::with_client_factory(
            Arc::new(CredentialCache::new()),
            Arc::new(ConverterRegistry::with_defaults()),
            SettingsStore::new(ProviderSettings::default()),
            unreachable_cluster_factory(),
        )
    }

    async fn wait_for_state(rx: &mut watch::Receiver<SyncState>, wanted: SyncState) {
        let reached = timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow_and_update() == wanted {
                    return;
                }
                rx.changed().await.expect("state channel closed");
            }
        })
        .await;
        assert!(reached.is_ok(), "pipeline never reached {wanted}");
    }

    #[test]
    fn only_watching_is_ready() {
        assert!(SyncState::Watching.is_ready());
        assert!(!SyncState::Initializing.is_ready());
        assert!(!SyncState::Snapshotting.is_ready());
        assert!(!SyncState::Resyncing.is_ready());
        assert!(!SyncState::Stopped.is_ready());
    }

    #[tokio::test]
    async fn controller_starts_in_initializing() {
        let controller = SyncController::new(
            Arc::new(CredentialCache::new()),
            Arc::new(ConverterRegistry::with_defaults()),
            SettingsStore::new(ProviderSettings::default()),
        );
        assert_eq!(*controller.state().borrow(), SyncState::Initializing);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let controller = SyncController::new(
            Arc::new(CredentialCache::new()),
            Arc::new(ConverterRegistry::with_defaults()),
            SettingsStore::new(ProviderSettings::default()),
        );
        controller.stop().await;
        controller.stop().await;
        assert_eq!(*controller.state().borrow(), SyncState::Stopped);
    }

    #[tokio::test]
    async fn failed_initial_pipeline_is_returned_to_the_caller() {
        let controller = test_controller();
        let result = Arc::clone(&controller).start().await;
        assert!(matches!(result, Err(SyncError::Connect(_))));
        assert!(controller.cache.is_empty());
    }

    #[tokio::test]
    async fn resync_request_drives_a_pipeline_restart() {
        let controller = test_controller();
        let mut state_rx = controller.state();
        let resync_tx = controller.resync_tx.clone();
        SyncController::spawn_supervisor(Arc::clone(&controller));

        assert_eq!(*state_rx.borrow(), SyncState::Initializing);
        resync_tx.send(()).await.expect("supervisor is listening");

        // the restart attempt runs: Snapshotting, then Stopped because
        // the cluster is unreachable
        wait_for_state(&mut state_rx, SyncState::Stopped).await;
    }

    #[tokio::test]
    async fn settings_change_drives_a_pipeline_restart() {
        let controller = test_controller();
        let mut state_rx = controller.state();
        SyncController::spawn_supervisor(Arc::clone(&controller));

        assert_eq!(*state_rx.borrow(), SyncState::Initializing);
        controller.settings.update(ProviderSettings {
            label_selector: "team=alpha".to_string(),
            shared_namespace: String::new(),
        });

        wait_for_state(&mut state_rx, SyncState::Stopped).await;
    }
}
