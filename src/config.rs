//! # Configuration
//!
//! Runtime settings for the provider: the label selector applied to
//! secret list/watch calls and the namespace whose credentials are
//! visible to root-scope lookups.
//!
//! Settings live behind a [`tokio::sync::watch`] channel so the sync
//! controller can react to changes by restarting the pipeline, the way
//! the probe server reacts to sync-state changes.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::constants::{ENV_LABEL_SELECTOR, ENV_SHARED_NAMESPACE};

/// The two user-facing settings.
///
/// An empty `label_selector` means unfiltered; an empty
/// `shared_namespace` means root-scope lookups see nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(default)]
    pub label_selector: String,
    #[serde(default)]
    pub shared_namespace: String,
}

impl ProviderSettings {
    pub fn from_env() -> Self {
        Self {
            label_selector: std::env::var(ENV_LABEL_SELECTOR).unwrap_or_default(),
            shared_namespace: std::env::var(ENV_SHARED_NAMESPACE).unwrap_or_default(),
        }
    }

    /// The label selector as an option: `None` when unfiltered.
    pub fn selector(&self) -> Option<&str> {
        if self.label_selector.is_empty() {
            None
        } else {
            Some(&self.label_selector)
        }
    }
}

/// Shared handle to the current settings plus change notification.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    tx: watch::Sender<ProviderSettings>,
}

impl SettingsStore {
    pub fn new(initial: ProviderSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> ProviderSettings {
        self.tx.borrow().clone()
    }

    /// Installs new settings; subscribers are only notified when the
    /// settings actually changed.
    pub fn update(&self, settings: ProviderSettings) {
        self.tx.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
    }

    /// Subscribes to settings changes.
    pub fn subscribe(&self) -> watch::Receiver<ProviderSettings> {
        self.tx.subscribe()
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(ProviderSettings::default())
    }
}
