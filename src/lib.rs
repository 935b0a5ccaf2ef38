//! # Kubernetes Credentials Provider
//!
//! A Kubernetes controller that maintains a live, in-memory cache of
//! credentials sourced from cluster `Secret` objects and resolves which
//! credentials a hierarchical consumer (a folder tree) may see.
//!
//! ## Overview
//!
//! The sync pipeline works in two phases:
//!
//! 1. **Snapshot** - One bulk listing across all namespaces builds a
//!    complete credential mapping and yields the resource version to
//!    resume from.
//! 2. **Watch** - A long-lived subscription applies Added/Modified/
//!    Deleted events to the cache in arrival order. An expired resume
//!    point (HTTP 410) triggers a full resync; configuration changes
//!    restart the pipeline with the new parameters.
//!
//! Lookups go through [`provider::CredentialsProvider`]: the root scope
//! sees only the configured shared namespace, nested scopes see their
//! ancestor folders' namespaces with nearest-ancestor-wins
//! deduplication, and non-system callers see nothing.
//!
//! The cache is rebuilt from the cluster on every start; nothing is
//! persisted locally.

pub mod cache;
pub mod config;
pub mod constants;
pub mod convert;
pub mod credentials;
pub mod metrics;
pub mod provider;
pub mod server;
pub mod sync;

pub use cache::CredentialCache;
pub use config::{ProviderSettings, SettingsStore};
pub use convert::{ConversionError, ConverterRegistry, SecretConverter};
pub use credentials::{Credential, CredentialEntry, CredentialKind, SecretString};
pub use provider::{CallerIdentity, CredentialsProvider, Scope};
pub use sync::{SyncController, SyncError, SyncState};
