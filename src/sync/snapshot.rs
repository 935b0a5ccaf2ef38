//! # Snapshot Loader
//!
//! Builds a complete, self-consistent credential mapping from one bulk
//! listing of secrets across all namespaces.
//!
//! The mapping is constructed off to the side and only handed to the
//! cache once fully built, so concurrent readers never see a partially
//! loaded snapshot. A failed listing is fatal to the caller; a failed
//! conversion skips only that secret.

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::Client;
use std::sync::Arc;
use tracing::info;

use crate::cache::NamespaceMap;
use crate::constants::DEFAULT_RESOURCE_VERSION;
use crate::convert::{self, ConverterRegistry};
use crate::metrics;

use super::SyncError;

/// A fully built credential mapping plus the resource version to resume
/// watching from.
#[derive(Debug)]
pub struct Snapshot {
    pub credentials: NamespaceMap,
    pub resource_version: String,
}

impl Snapshot {
    pub fn credential_count(&self) -> usize {
        self.credentials.values().map(|entries| entries.len()).sum()
    }
}

/// Lists all secrets (optionally filtered by `selector`) and converts
/// the matching ones.
///
/// Returns [`SyncError::List`] when the listing call itself fails; no
/// partial mapping is produced in that case.
pub async fn load(
    client: Client,
    selector: Option<&str>,
    registry: &ConverterRegistry,
) -> Result<Snapshot, SyncError> {
    let api: Api<Secret> = Api::all(client);
    let list = api.list(&list_params(selector)).await.map_err(SyncError::List)?;
    let resource_version = effective_resource_version(list.metadata.resource_version.clone());

    let credentials = build_entries(&list.items, registry);
    let snapshot = Snapshot {
        credentials,
        resource_version,
    };

    metrics::increment_snapshots();
    info!(
        credentials = snapshot.credential_count(),
        secrets = list.items.len(),
        resource_version = %snapshot.resource_version,
        "loaded secret snapshot"
    );
    Ok(snapshot)
}

/// List parameters for the bulk call; label filtering is delegated to
/// the API server.
pub(crate) fn list_params(selector: Option<&str>) -> ListParams {
    let params = ListParams::default();
    match selector {
        Some(selector) => params.labels(selector),
        None => params,
    }
}

/// The resource version to resume from: the listing's own version, or
/// the documented sentinel when the listing reported none.
pub(crate) fn effective_resource_version(listed: Option<String>) -> String {
    listed.unwrap_or_else(|| DEFAULT_RESOURCE_VERSION.to_string())
}

/// Converts a listing into a fresh namespace → id → entry mapping.
///
/// Secrets that do not match the credential shape, have no registered
/// converter, or fail conversion are skipped without affecting the rest
/// of the listing.
pub fn build_entries(items: &[Secret], registry: &ConverterRegistry) -> NamespaceMap {
    let mut credentials = NamespaceMap::new();
    for secret in items {
        if let Some(entry) = convert::convert_secret(registry, secret) {
            let entry = Arc::new(entry);
            credentials
                .entry(entry.namespace.clone())
                .or_default()
                .insert(entry.id.clone(), entry);
        }
    }
    credentials
}
