//! # Credential Cache
//!
//! Concurrent namespace → credential-id → entry mapping shared between
//! the background watch task (writer) and lookup callers (readers).
//!
//! Two write modes exist: [`CredentialCache::replace_all`] swaps the
//! whole mapping in one step after a snapshot rebuild, and
//! [`CredentialCache::upsert`]/[`CredentialCache::remove`] apply single
//! watch events in place. Both run under one write lock, so readers
//! observe either the whole old state or the whole new state, never a
//! half-built namespace map. No operation performs I/O.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::credentials::CredentialEntry;

/// Inner mapping: credential id → entry
pub type EntryMap = HashMap<String, Arc<CredentialEntry>>;

/// Outer mapping: namespace → [`EntryMap`]
pub type NamespaceMap = HashMap<String, EntryMap>;

#[derive(Debug, Default)]
pub struct CredentialCache {
    inner: RwLock<NamespaceMap>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means a panic elsewhere while holding it;
    // the map itself is still structurally valid, so recover the guard.
    fn read_lock(&self) -> RwLockReadGuard<'_, NamespaceMap> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, NamespaceMap> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the entire cache with a freshly built mapping.
    ///
    /// Used after every successful snapshot; the mapping must already be
    /// fully constructed so no partial state becomes visible.
    pub fn replace_all(&self, fresh: NamespaceMap) {
        *self.write_lock() = fresh;
    }

    /// Inserts or replaces the entry for `(namespace, id)`.
    ///
    /// The namespace's inner map is created on first write.
    pub fn upsert(&self, namespace: &str, id: &str, entry: Arc<CredentialEntry>) {
        self.write_lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(id.to_string(), entry);
    }

    /// Removes the entry for `(namespace, id)`; absence is not an error.
    pub fn remove(&self, namespace: &str, id: &str) {
        if let Some(entries) = self.write_lock().get_mut(namespace) {
            entries.remove(id);
        }
    }

    /// Entries in one namespace, sorted by credential id for
    /// deterministic lookup results.
    pub fn entries_in(&self, namespace: &str) -> Vec<Arc<CredentialEntry>> {
        let guard = self.read_lock();
        let Some(entries) = guard.get(namespace) else {
            return Vec::new();
        };
        let mut entries: Vec<_> = entries.values().map(Arc::clone).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// All namespaces and their entries at one point in time.
    pub fn read_all(&self) -> HashMap<String, Vec<Arc<CredentialEntry>>> {
        self.read_lock()
            .iter()
            .map(|(namespace, entries)| {
                (
                    namespace.clone(),
                    entries.values().map(Arc::clone).collect(),
                )
            })
            .collect()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.read_lock().keys().cloned().collect()
    }

    /// Total number of cached entries across all namespaces.
    pub fn len(&self) -> usize {
        self.read_lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
