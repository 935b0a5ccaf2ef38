//! # Secret Conversion
//!
//! Converts raw Kubernetes `Secret` objects into typed [`Credential`]
//! values.
//!
//! Conversion is driven by the secret's `type` field: a
//! [`ConverterRegistry`] maps each type tag to a [`SecretConverter`]
//! capability. Secrets whose shape does not match ([`is_credential_secret`])
//! or whose tag has no registered converter are skipped silently; a
//! converter failure skips the single secret with a warning and never
//! aborts the surrounding snapshot or watch event.

use std::collections::HashMap;
use std::fmt;

use k8s_openapi::api::core::v1::Secret;
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{Credential, CredentialEntry, SecretString};
use crate::metrics;

/// Annotation overriding the credential identifier (defaults to the
/// secret's name)
pub const CREDENTIAL_ID_ANNOTATION: &str = "credentials.kubernetes.io/id";

/// Annotation carrying the username attached to an SSH private key
pub const SSH_USERNAME_ANNOTATION: &str = "credentials.kubernetes.io/ssh-username";

/// Secret type tags with built-in converters
pub const TYPE_BASIC_AUTH: &str = "kubernetes.io/basic-auth";
pub const TYPE_SSH_AUTH: &str = "kubernetes.io/ssh-auth";
pub const TYPE_OPAQUE: &str = "Opaque";

/// Failure converting one secret into a credential.
///
/// Always scoped to a single secret; callers log and skip.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("secret is missing required data field '{0}'")]
    MissingField(String),
    #[error("data field '{0}' is not valid UTF-8")]
    InvalidUtf8(String),
}

/// Capability converting one raw secret into a credential.
pub trait SecretConverter: Send + Sync {
    fn convert(&self, secret: &Secret) -> Result<Credential, ConversionError>;
}

/// Registry of converters keyed by the secret `type` tag.
///
/// Constructed once at startup and passed into the sync pipeline; there
/// is deliberately no process-wide registry singleton.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: HashMap<String, Box<dyn SecretConverter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with converters for the built-in secret types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TYPE_BASIC_AUTH, Box::new(BasicAuthConverter));
        registry.register(TYPE_SSH_AUTH, Box::new(SshAuthConverter));
        registry.register(TYPE_OPAQUE, Box::new(SecretTextConverter));
        registry
    }

    /// Registers a converter for a type tag, replacing any previous one.
    pub fn register(&mut self, type_tag: impl Into<String>, converter: Box<dyn SecretConverter>) {
        self.converters.insert(type_tag.into(), converter);
    }

    pub fn lookup(&self, type_tag: &str) -> Option<&dyn SecretConverter> {
        self.converters.get(type_tag).map(|converter| converter.as_ref())
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("type_tags", &self.converters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Whether a secret has the structural markers of a credential secret:
/// a name, a namespace, a non-empty type tag, and a data map.
pub fn is_credential_secret(secret: &Secret) -> bool {
    secret.metadata.name.is_some()
        && secret.metadata.namespace.is_some()
        && secret.type_.as_deref().is_some_and(|t| !t.is_empty())
        && secret.data.is_some()
}

/// The credential identifier for a secret: the id annotation when
/// present, otherwise the secret's name.
pub fn credential_id(secret: &Secret) -> Option<String> {
    if let Some(annotations) = &secret.metadata.annotations {
        if let Some(id) = annotations.get(CREDENTIAL_ID_ANNOTATION) {
            if !id.is_empty() {
                return Some(id.clone());
            }
        }
    }
    secret.metadata.name.clone()
}

/// Converts one secret through the registry.
///
/// Returns `None` for non-matching secrets, unregistered type tags, and
/// per-item conversion failures (logged at `warn`). This is the single
/// conversion path shared by the snapshot loader and the watch session.
pub fn convert_secret(registry: &ConverterRegistry, secret: &Secret) -> Option<CredentialEntry> {
    if !is_credential_secret(secret) {
        return None;
    }

    // is_credential_secret checked these
    let type_tag = secret.type_.as_deref()?;
    let namespace = secret.metadata.namespace.clone()?;
    let id = credential_id(secret)?;

    let Some(converter) = registry.lookup(type_tag) else {
        debug!(
            credential_id = %id,
            type_tag = %type_tag,
            "no converter registered for secret type, skipping"
        );
        return None;
    };

    match converter.convert(secret) {
        Ok(credential) => Some(CredentialEntry {
            id,
            namespace,
            credential,
        }),
        Err(err) => {
            // do not spam the logs with per-item failures at error level
            warn!(
                credential_id = %id,
                namespace = %namespace,
                type_tag = %type_tag,
                error = %err,
                "failed to convert secret, skipping"
            );
            metrics::increment_conversion_failures();
            None
        }
    }
}

/// Reads a required UTF-8 field from the secret's data map.
fn required_field(secret: &Secret, key: &str) -> Result<String, ConversionError> {
    optional_field(secret, key)?.ok_or_else(|| ConversionError::MissingField(key.to_string()))
}

/// Reads an optional UTF-8 field from the secret's data map.
///
/// `string_data` takes precedence when both are set, matching the API
/// server's own merge behavior.
fn optional_field(secret: &Secret, key: &str) -> Result<Option<String>, ConversionError> {
    if let Some(string_data) = &secret.string_data {
        if let Some(value) = string_data.get(key) {
            return Ok(Some(value.clone()));
        }
    }
    if let Some(data) = &secret.data {
        if let Some(bytes) = data.get(key) {
            let value = String::from_utf8(bytes.0.clone())
                .map_err(|_| ConversionError::InvalidUtf8(key.to_string()))?;
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn annotation(secret: &Secret, key: &str) -> Option<String> {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .filter(|value| !value.is_empty())
        .cloned()
}

/// `kubernetes.io/basic-auth` → username/password
#[derive(Debug)]
pub struct BasicAuthConverter;

impl SecretConverter for BasicAuthConverter {
    fn convert(&self, secret: &Secret) -> Result<Credential, ConversionError> {
        Ok(Credential::UsernamePassword {
            username: required_field(secret, "username")?,
            password: SecretString::new(required_field(secret, "password")?),
        })
    }
}

/// `kubernetes.io/ssh-auth` → SSH private key
#[derive(Debug)]
pub struct SshAuthConverter;

impl SecretConverter for SshAuthConverter {
    fn convert(&self, secret: &Secret) -> Result<Credential, ConversionError> {
        Ok(Credential::SshPrivateKey {
            username: annotation(secret, SSH_USERNAME_ANNOTATION),
            private_key: SecretString::new(required_field(secret, "ssh-privatekey")?),
            passphrase: optional_field(secret, "passphrase")?.map(SecretString::new),
        })
    }
}

/// `Opaque` secrets carrying a `text` key → secret text
#[derive(Debug)]
pub struct SecretTextConverter;

impl SecretConverter for SecretTextConverter {
    fn convert(&self, secret: &Secret) -> Result<Credential, ConversionError> {
        Ok(Credential::SecretText {
            text: SecretString::new(required_field(secret, "text")?),
        })
    }
}
