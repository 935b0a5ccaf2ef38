//! # Watch Session
//!
//! One long-lived secret subscription applying incremental events to
//! the credential cache.
//!
//! A session owns its client connection and subscription exclusively;
//! the [`SyncController`](super::SyncController) creates it after a
//! successful snapshot and destroys it on stop or reconfiguration.
//! Events for the same `(namespace, id)` are applied strictly in
//! arrival order; there is no batching and no cross-key ordering.
//!
//! The API server closes watch connections routinely (the request
//! timeout caps them at a few minutes), so a cleanly closed stream is
//! not a failure: the session re-opens the subscription from the last
//! observed resource version. A resume point reported as expired
//! (HTTP 410, whether in-stream or at open time) asks the controller
//! for a full resync and exits. Genuine stream errors are logged and
//! leave the session down until a reconfiguration restarts the
//! pipeline.

use futures::{pin_mut, Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, WatchParams};
use kube::core::{ErrorResponse, WatchEvent};
use kube::Client;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::cache::CredentialCache;
use crate::constants::HTTP_GONE;
use crate::convert::{self, ConverterRegistry};
use crate::metrics;

use super::SyncState;

/// Handle to a running watch session.
///
/// Dropping the handle leaves the task running; call
/// [`WatchSession::stop`] to tear it down. Stopping an already finished
/// session is a no-op.
#[derive(Debug)]
pub struct WatchSession {
    handle: JoinHandle<()>,
}

impl WatchSession {
    /// Spawns the background task driving the subscription.
    pub fn spawn(
        client: Client,
        selector: Option<String>,
        resource_version: String,
        cache: Arc<CredentialCache>,
        registry: Arc<ConverterRegistry>,
        resync_tx: mpsc::Sender<()>,
        state_tx: watch::Sender<SyncState>,
    ) -> Self {
        let handle = tokio::spawn(run_watch(
            client,
            selector,
            resource_version,
            cache,
            registry,
            resync_tx,
            state_tx,
        ));
        Self { handle }
    }

    /// Stops the session and waits for the task to finish.
    pub async fn stop(self) {
        self.handle.abort();
        // JoinError::Cancelled is the expected outcome of an abort
        if let Err(err) = self.handle.await {
            if !err.is_cancelled() {
                error!(error = %err, "watch session task panicked");
            }
        }
    }
}

/// Whether a watch error status means the resume point has expired and
/// only a full relist can recover.
pub fn is_resume_expired(status: &ErrorResponse) -> bool {
    status.code == HTTP_GONE
}

/// Whether opening the subscription itself was rejected because the
/// resume version is already too old.
pub(crate) fn open_rejected_as_expired(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if is_resume_expired(response))
}

/// Watch parameters for the subscription; label filtering is delegated
/// to the API server, same as the bulk listing.
pub(crate) fn watch_params(selector: Option<&str>) -> WatchParams {
    let params = WatchParams::default();
    match selector {
        Some(selector) => params.labels(selector),
        None => params,
    }
}

/// Applies a single watch event to the cache.
///
/// Added/Modified convert the secret exactly like the snapshot loader
/// (skipping on non-match, missing converter, or conversion failure) and
/// replace the prior entry atomically. Deleted removes the key; absence
/// is not an error. Bookmark and Error events do not touch the cache.
pub fn apply_watch_event(
    cache: &CredentialCache,
    registry: &ConverterRegistry,
    event: WatchEvent<Secret>,
) {
    match event {
        WatchEvent::Added(secret) | WatchEvent::Modified(secret) => {
            if let Some(entry) = convert::convert_secret(registry, &secret) {
                debug!(
                    credential_id = %entry.id,
                    namespace = %entry.namespace,
                    "secret upserted"
                );
                let entry = Arc::new(entry);
                cache.upsert(&entry.namespace, &entry.id, Arc::clone(&entry));
            }
        }
        WatchEvent::Deleted(secret) => {
            if let (Some(namespace), Some(id)) = (
                secret.metadata.namespace.as_deref(),
                convert::credential_id(&secret),
            ) {
                debug!(credential_id = %id, namespace = %namespace, "secret deleted");
                cache.remove(namespace, &id);
            }
        }
        WatchEvent::Bookmark(_) | WatchEvent::Error(_) => {}
    }
}

fn event_kind(event: &WatchEvent<Secret>) -> &'static str {
    match event {
        WatchEvent::Added(_) => "Added",
        WatchEvent::Modified(_) => "Modified",
        WatchEvent::Deleted(_) => "Deleted",
        WatchEvent::Bookmark(_) => "Bookmark",
        WatchEvent::Error(_) => "Error",
    }
}

fn event_resource_version(event: &WatchEvent<Secret>) -> Option<String> {
    match event {
        WatchEvent::Added(secret)
        | WatchEvent::Modified(secret)
        | WatchEvent::Deleted(secret) => secret.metadata.resource_version.clone(),
        WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
    }
}

/// Why one watch stream stopped yielding events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamOutcome {
    /// Stream closed cleanly; re-subscribe from this resource version
    Ended(String),
    /// Resume point expired, only a full relist can recover
    ResumeExpired,
    /// Transport or API failure; fail-stop
    Failed,
}

/// Consumes one open watch stream, applying its events to the cache.
///
/// Reports `Watching` as soon as the stream is live, tracks the resume
/// position from object and bookmark resource versions, and classifies
/// how the stream stopped.
pub(crate) async fn drive_stream<S>(
    stream: S,
    resume_version: String,
    cache: &CredentialCache,
    registry: &ConverterRegistry,
    state_tx: &watch::Sender<SyncState>,
) -> StreamOutcome
where
    S: Stream<Item = Result<WatchEvent<Secret>, kube::Error>>,
{
    pin_mut!(stream);
    state_tx.send_replace(SyncState::Watching);
    let mut resume_version = resume_version;

    while let Some(event) = stream.next().await {
        match event {
            Ok(WatchEvent::Error(status)) => {
                metrics::observe_watch_event("Error");
                if is_resume_expired(&status) {
                    warn!(
                        resume_version = %resume_version,
                        "watch resume point expired, requesting full resync"
                    );
                    return StreamOutcome::ResumeExpired;
                }
                warn!(
                    code = status.code,
                    reason = %status.reason,
                    message = %status.message,
                    "error event on secret watch stream"
                );
            }
            Ok(WatchEvent::Bookmark(bookmark)) => {
                metrics::observe_watch_event("Bookmark");
                resume_version = bookmark.metadata.resource_version;
                trace!(resource_version = %resume_version, "watch bookmark");
            }
            Ok(event) => {
                metrics::observe_watch_event(event_kind(&event));
                if let Some(version) = event_resource_version(&event) {
                    resume_version = version;
                }
                apply_watch_event(cache, registry, event);
                metrics::set_credentials_cached(cache.len() as i64);
            }
            Err(err) => {
                // fail-stop: no automatic resubscribe for transport
                // errors, a reconfiguration restarts the pipeline
                error!(error = %err, "secret watch stream failed");
                return StreamOutcome::Failed;
            }
        }
    }

    StreamOutcome::Ended(resume_version)
}

async fn request_resync(resync_tx: &mpsc::Sender<()>, state_tx: &watch::Sender<SyncState>) {
    metrics::increment_resyncs();
    state_tx.send_replace(SyncState::Resyncing);
    if resync_tx.send(()).await.is_err() {
        error!("sync controller is gone, cannot resync");
        state_tx.send_replace(SyncState::Stopped);
    }
}

async fn run_watch(
    client: Client,
    selector: Option<String>,
    resource_version: String,
    cache: Arc<CredentialCache>,
    registry: Arc<ConverterRegistry>,
    resync_tx: mpsc::Sender<()>,
    state_tx: watch::Sender<SyncState>,
) {
    let api: Api<Secret> = Api::all(client);
    let params = watch_params(selector.as_deref());
    let mut resume_version = resource_version;

    loop {
        let stream = match api.watch(&params, &resume_version).await {
            Ok(stream) => stream,
            Err(err) if open_rejected_as_expired(&err) => {
                warn!(
                    resume_version = %resume_version,
                    "watch rejected, resume point expired, requesting full resync"
                );
                request_resync(&resync_tx, &state_tx).await;
                return;
            }
            Err(err) => {
                error!(
                    resource_version = %resume_version,
                    error = %err,
                    "failed to open secret watch stream"
                );
                state_tx.send_replace(SyncState::Stopped);
                return;
            }
        };

        info!(resource_version = %resume_version, "watching secrets");
        match drive_stream(stream, resume_version.clone(), &cache, &registry, &state_tx).await {
            StreamOutcome::Ended(version) => {
                // routine server-side close of the watch connection;
                // re-subscribe from the last observed version
                debug!(resource_version = %version, "secret watch stream closed, resuming");
                resume_version = version;
            }
            StreamOutcome::ResumeExpired => {
                request_resync(&resync_tx, &state_tx).await;
                return;
            }
            StreamOutcome::Failed => {
                state_tx.send_replace(SyncState::Stopped);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use futures::stream;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    use super::*;
    use crate::convert::TYPE_OPAQUE;
    use crate::credentials::Credential;

    fn secret(namespace: &str, name: &str, text: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            type_: Some(TYPE_OPAQUE.to_string()),
            data: Some(
                [("text".to_string(), ByteString(text.as_bytes().to_vec()))]
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Secret::default()
        }
    }

    fn versioned_secret(namespace: &str, name: &str, text: &str, version: &str) -> Secret {
        let mut secret = secret(namespace, name, text);
        secret.metadata.resource_version = Some(version.to_string());
        secret
    }

    fn gone() -> ErrorResponse {
        ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: HTTP_GONE,
        }
    }

    fn cached_text(cache: &CredentialCache, namespace: &str, id: &str) -> Option<String> {
        cache
            .entries_in(namespace)
            .into_iter()
            .find(|entry| entry.id == id)
            .map(|entry| match &entry.credential {
                Credential::SecretText { text } => text.expose().to_string(),
                other => panic!("expected secret text, got {other:?}"),
            })
    }

    #[test]
    fn events_for_one_key_apply_in_arrival_order() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();

        apply_watch_event(&cache, &registry, WatchEvent::Added(secret("teamA", "cred1", "v1")));
        apply_watch_event(
            &cache,
            &registry,
            WatchEvent::Modified(secret("teamA", "cred1", "v2")),
        );
        apply_watch_event(
            &cache,
            &registry,
            WatchEvent::Modified(secret("teamA", "cred1", "v3")),
        );

        assert_eq!(cached_text(&cache, "teamA", "cred1").as_deref(), Some("v3"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn deleted_removes_the_key_regardless_of_prior_state() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();

        // delete of a key that was never added
        apply_watch_event(
            &cache,
            &registry,
            WatchEvent::Deleted(secret("teamA", "ghost", "x")),
        );
        assert!(cache.is_empty());

        apply_watch_event(&cache, &registry, WatchEvent::Added(secret("teamA", "cred1", "v1")));
        apply_watch_event(
            &cache,
            &registry,
            WatchEvent::Deleted(secret("teamA", "cred1", "v1")),
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_conversion_leaves_previous_entry_in_place() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();

        apply_watch_event(&cache, &registry, WatchEvent::Added(secret("teamA", "cred1", "v1")));

        // modified secret now lacks the text key, so conversion fails
        let mut broken = secret("teamA", "cred1", "ignored");
        broken.data = Some(BTreeMap::new());
        apply_watch_event(&cache, &registry, WatchEvent::Modified(broken));

        assert_eq!(cached_text(&cache, "teamA", "cred1").as_deref(), Some("v1"));
    }

    #[test]
    fn error_events_do_not_touch_the_cache() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();
        apply_watch_event(&cache, &registry, WatchEvent::Added(secret("teamA", "cred1", "v1")));

        apply_watch_event(&cache, &registry, WatchEvent::Error(gone()));

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn resume_expiry_is_classified_by_status_code() {
        assert!(is_resume_expired(&gone()));

        let forbidden = ErrorResponse {
            status: "Failure".to_string(),
            message: "secrets is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        };
        assert!(!is_resume_expired(&forbidden));
    }

    #[test]
    fn open_rejection_with_gone_is_classified_as_expired() {
        assert!(open_rejected_as_expired(&kube::Error::Api(gone())));

        let forbidden = ErrorResponse {
            status: "Failure".to_string(),
            message: "secrets is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        };
        assert!(!open_rejected_as_expired(&kube::Error::Api(forbidden)));
    }

    #[test]
    fn selector_is_passed_to_the_watch_call() {
        assert_eq!(
            watch_params(Some("team=alpha")).label_selector.as_deref(),
            Some("team=alpha")
        );
        assert!(watch_params(None).label_selector.is_none());
    }

    #[tokio::test]
    async fn clean_stream_close_yields_the_latest_resume_version() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();
        let (state_tx, state_rx) = tokio::sync::watch::channel(SyncState::Snapshotting);

        let events = vec![
            Ok(WatchEvent::Added(versioned_secret("teamA", "cred1", "v1", "11"))),
            Ok(WatchEvent::Modified(versioned_secret("teamA", "cred1", "v2", "12"))),
        ];
        let outcome =
            drive_stream(stream::iter(events), "10".to_string(), &cache, &registry, &state_tx)
                .await;

        // the stream ran out of events, the way the API server ends a
        // watch call after its timeout; the session must resume from the
        // last applied version, not give up
        assert_eq!(outcome, StreamOutcome::Ended("12".to_string()));
        assert_eq!(*state_rx.borrow(), SyncState::Watching);
        assert_eq!(cached_text(&cache, "teamA", "cred1").as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn empty_stream_close_keeps_the_starting_version() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();
        let (state_tx, _state_rx) = tokio::sync::watch::channel(SyncState::Snapshotting);

        let outcome = drive_stream(
            stream::iter(Vec::new()),
            "10".to_string(),
            &cache,
            &registry,
            &state_tx,
        )
        .await;

        assert_eq!(outcome, StreamOutcome::Ended("10".to_string()));
    }

    #[tokio::test]
    async fn bookmark_advances_the_resume_version() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();
        let (state_tx, _state_rx) = tokio::sync::watch::channel(SyncState::Snapshotting);

        let bookmark: WatchEvent<Secret> = serde_json::from_value(serde_json::json!({
            "type": "BOOKMARK",
            "object": {
                "kind": "Secret",
                "apiVersion": "v1",
                "metadata": { "resourceVersion": "42" },
            },
        }))
        .expect("valid bookmark event");

        let outcome = drive_stream(
            stream::iter(vec![Ok(bookmark)]),
            "10".to_string(),
            &cache,
            &registry,
            &state_tx,
        )
        .await;

        assert_eq!(outcome, StreamOutcome::Ended("42".to_string()));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn gone_event_requests_a_full_resync() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();
        let (state_tx, _state_rx) = tokio::sync::watch::channel(SyncState::Snapshotting);

        let events = vec![
            Ok(WatchEvent::Added(versioned_secret("teamA", "cred1", "v1", "11"))),
            Ok(WatchEvent::Error(gone())),
        ];
        let outcome =
            drive_stream(stream::iter(events), "10".to_string(), &cache, &registry, &state_tx)
                .await;

        assert_eq!(outcome, StreamOutcome::ResumeExpired);
        // events before the expiry were still applied
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn non_gone_error_events_do_not_stop_the_stream() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();
        let (state_tx, _state_rx) = tokio::sync::watch::channel(SyncState::Snapshotting);

        let transient = ErrorResponse {
            status: "Failure".to_string(),
            message: "etcdserver: request timed out".to_string(),
            reason: "Timeout".to_string(),
            code: 500,
        };
        let events = vec![
            Ok(WatchEvent::Error(transient)),
            Ok(WatchEvent::Added(versioned_secret("teamA", "cred1", "v1", "11"))),
        ];
        let outcome =
            drive_stream(stream::iter(events), "10".to_string(), &cache, &registry, &state_tx)
                .await;

        assert_eq!(outcome, StreamOutcome::Ended("11".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn transport_errors_fail_stop() {
        let cache = CredentialCache::new();
        let registry = ConverterRegistry::with_defaults();
        let (state_tx, _state_rx) = tokio::sync::watch::channel(SyncState::Snapshotting);

        let events = vec![
            Ok(WatchEvent::Added(versioned_secret("teamA", "cred1", "v1", "11"))),
            Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "connection reset".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            })),
        ];
        let outcome =
            drive_stream(stream::iter(events), "10".to_string(), &cache, &registry, &state_tx)
                .await;

        assert_eq!(outcome, StreamOutcome::Failed);
    }
}
