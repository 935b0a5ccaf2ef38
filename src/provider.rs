//! # Scope Resolver
//!
//! Resolves which cached credentials are visible to a requesting scope.
//!
//! Scopes form a folder hierarchy whose folder names double as
//! namespace keys. The root is a distinguished case: it sees only the
//! configured shared namespace, not every namespace. Nested scopes walk
//! their ancestor chain nearest-first and deduplicate by credential
//! identifier, so the nearest ancestor's entry wins on collision.
//!
//! Lookups are honored only for the distinguished system identity;
//! every other caller receives an empty list, never an error. Actual
//! authorization is the consumer model's job, not this resolver's.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use crate::cache::CredentialCache;
use crate::config::SettingsStore;
use crate::credentials::{CredentialEntry, CredentialKind};

/// A requesting scope: the root, or a chain of ancestor folder names
/// ordered nearest-first and excluding the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Root,
    Folder(Vec<String>),
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerIdentity {
    /// The distinguished system-level identity
    System,
    /// Anything else; always resolves to an empty list
    External(String),
}

/// Read-only lookup surface over the credential cache.
#[derive(Debug, Clone)]
pub struct CredentialsProvider {
    cache: Arc<CredentialCache>,
    settings: SettingsStore,
}

impl CredentialsProvider {
    pub fn new(cache: Arc<CredentialCache>, settings: SettingsStore) -> Self {
        Self { cache, settings }
    }

    /// The credentials visible to `scope`, filtered by `kind`, ordered
    /// closest-ancestor-first with each identifier appearing at most
    /// once.
    pub fn credentials(
        &self,
        scope: &Scope,
        kind: CredentialKind,
        caller: &CallerIdentity,
    ) -> Vec<Arc<CredentialEntry>> {
        if *caller != CallerIdentity::System {
            trace!(?caller, "non-system caller, returning no credentials");
            return Vec::new();
        }

        match scope {
            Scope::Root => {
                let shared_namespace = self.settings.current().shared_namespace;
                if shared_namespace.is_empty() {
                    return Vec::new();
                }
                self.cache
                    .entries_in(&shared_namespace)
                    .into_iter()
                    .filter(|entry| kind.matches(entry.credential.kind()))
                    .collect()
            }
            Scope::Folder(chain) => {
                let mut seen = HashSet::new();
                let mut visible = Vec::new();
                for namespace in chain {
                    for entry in self.cache.entries_in(namespace) {
                        if kind.matches(entry.credential.kind()) && seen.insert(entry.id.clone()) {
                            visible.push(entry);
                        }
                    }
                }
                visible
            }
        }
    }
}
