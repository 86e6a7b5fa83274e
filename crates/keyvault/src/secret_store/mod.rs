//! Client side of the centralized secret-management collaborator.
//!
//! The store holds the material this subsystem must never persist itself:
//! custodian share-wrapping keys and pending recovery KEKs. Implementations
//! log paths and outcomes only, never values.

pub mod client;
pub mod memory;
pub mod retry;

pub use client::{HttpSecretStore, SecretStoreSettings};
pub use memory::MemorySecretStore;
pub use retry::RetryPolicy;

use std::future::Future;

use secrecy::SecretBox;
use thiserror::Error;

use crate::escrow::MasterKeySession;

/// A secret value fetched from the store. Wiped on drop.
pub type SecretValue = SecretBox<Vec<u8>>;

/// Errors produced by the secret store client.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("no secret at {path}")]
    NotFound { path: String },

    /// Create-only write hit an existing secret.
    #[error("secret already exists at {path}")]
    Conflict { path: String },

    /// Role login or token rejected. Never retried.
    #[error("secret store authentication failed: {0}")]
    Auth(String),

    /// Network failure, timeout, 5xx, or rate limiting after all retries.
    #[error("secret store unavailable: {0}")]
    Transient(String),

    /// The store answered with something this client does not understand.
    #[error("unexpected secret store response: {0}")]
    Protocol(String),

    /// The master key session passed to `unseal` has expired.
    #[error("master key session expired")]
    SessionExpired,
}

impl SecretStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SecretStoreError::Transient(_))
    }
}

/// Path-addressed key/value secret storage.
pub trait SecretStore: Send + Sync + 'static {
    /// Write `value` at `path`, replacing any previous version.
    fn put_secret(
        &self,
        path: &str,
        value: &[u8],
    ) -> impl Future<Output = Result<(), SecretStoreError>> + Send;

    /// Write `value` at `path` only if nothing is stored there yet.
    fn create_secret(
        &self,
        path: &str,
        value: &[u8],
    ) -> impl Future<Output = Result<(), SecretStoreError>> + Send;

    /// Read the value at `path`. A missing secret is [`SecretStoreError::NotFound`].
    fn get_secret(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<SecretValue, SecretStoreError>> + Send;

    /// Remove every version of the secret at `path`. Missing paths are not an error.
    fn delete_secret(&self, path: &str) -> impl Future<Output = Result<(), SecretStoreError>> + Send;

    /// Hand the reconstructed platform master key to the store.
    fn unseal(
        &self,
        session: &MasterKeySession,
    ) -> impl Future<Output = Result<(), SecretStoreError>> + Send;
}
