//! # Credential Model
//!
//! Typed credential values produced by secret conversion.
//!
//! Entries are immutable once created: a modified secret produces a whole
//! new [`CredentialEntry`] that replaces the previous one in the cache.
//! Secret material is wrapped in [`SecretString`] so it is zeroized on
//! drop and never shows up in debug output or logs.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// A string holding secret material.
///
/// The inner value is zeroized when dropped and redacted from `Debug`
/// formatting. Call [`SecretString::expose`] to read it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A converted credential value.
///
/// Each variant corresponds to a secret `type` tag handled by a
/// registered converter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Username/password pair (`kubernetes.io/basic-auth`)
    UsernamePassword {
        username: String,
        password: SecretString,
    },
    /// SSH private key (`kubernetes.io/ssh-auth`), optionally with a
    /// username and key passphrase
    SshPrivateKey {
        username: Option<String>,
        private_key: SecretString,
        passphrase: Option<SecretString>,
    },
    /// Free-form secret text (`Opaque` secrets carrying a `text` key)
    SecretText { text: SecretString },
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::UsernamePassword { .. } => CredentialKind::UsernamePassword,
            Self::SshPrivateKey { .. } => CredentialKind::SshPrivateKey,
            Self::SecretText { .. } => CredentialKind::SecretText,
        }
    }
}

/// The credential shape a lookup asks for.
///
/// `Any` matches every credential; the other variants match exactly one
/// [`Credential`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Any,
    UsernamePassword,
    SshPrivateKey,
    SecretText,
}

impl CredentialKind {
    pub fn matches(self, other: CredentialKind) -> bool {
        self == CredentialKind::Any || self == other
    }
}

/// A cached credential.
///
/// `namespace` always equals the outer cache key the entry is stored
/// under; it is carried here so log lines and lookups can report it
/// without consulting the cache structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    /// Credential identifier, unique within its namespace
    pub id: String,
    /// Namespace the owning secret lives in
    pub namespace: String,
    pub credential: Credential,
}
