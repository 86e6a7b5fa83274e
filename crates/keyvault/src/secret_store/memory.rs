//! In-process secret store for tests and local development.
//!
//! Supports outage injection so callers can exercise their transient
//! failure paths without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use secrecy::SecretBox;
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use super::{SecretStore, SecretStoreError, SecretValue};
use crate::escrow::MasterKeySession;

#[derive(Default)]
struct Inner {
    secrets: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
    outage: AtomicBool,
    /// Remaining calls that fail transiently before the store recovers.
    failures_left: AtomicU32,
    /// SHA-256 of the master key last used to unseal.
    unsealed_with: Mutex<Option<[u8; 32]>>,
}

/// Cheaply cloneable in-memory [`SecretStore`].
#[derive(Clone, Default)]
pub struct MemorySecretStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySecretStore")
            .field("outage", &self.inner.outage.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail transiently until cleared.
    pub fn set_outage(&self, down: bool) {
        self.inner.outage.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` calls transiently.
    pub fn fail_next(&self, n: u32) {
        self.inner.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().map(|m| m.contains_key(path)).unwrap_or(false)
    }

    /// Whether `unseal` was called with a live session for this key digest.
    pub fn unsealed_with(&self) -> Option<[u8; 32]> {
        self.inner.unsealed_with.lock().ok().and_then(|g| *g)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Zeroizing<Vec<u8>>>>, SecretStoreError> {
        self.inner
            .secrets
            .lock()
            .map_err(|_| SecretStoreError::Protocol("memory store poisoned".into()))
    }

    fn check_available(&self, path: &str) -> Result<(), SecretStoreError> {
        if self.inner.outage.load(Ordering::SeqCst) {
            debug!(path, outcome = "outage", "memory secret store call");
            return Err(SecretStoreError::Transient("injected outage".into()));
        }
        let consumed = self
            .inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            debug!(path, outcome = "injected_failure", "memory secret store call");
            return Err(SecretStoreError::Transient("injected failure".into()));
        }
        Ok(())
    }
}

impl SecretStore for MemorySecretStore {
    async fn put_secret(&self, path: &str, value: &[u8]) -> Result<(), SecretStoreError> {
        self.check_available(path)?;
        self.lock()?
            .insert(path.to_owned(), Zeroizing::new(value.to_vec()));
        Ok(())
    }

    async fn create_secret(&self, path: &str, value: &[u8]) -> Result<(), SecretStoreError> {
        self.check_available(path)?;
        let mut secrets = self.lock()?;
        if secrets.contains_key(path) {
            return Err(SecretStoreError::Conflict {
                path: path.to_owned(),
            });
        }
        secrets.insert(path.to_owned(), Zeroizing::new(value.to_vec()));
        Ok(())
    }

    async fn get_secret(&self, path: &str) -> Result<SecretValue, SecretStoreError> {
        self.check_available(path)?;
        self.lock()?
            .get(path)
            .map(|v| SecretBox::new(Box::new(v.to_vec())))
            .ok_or_else(|| SecretStoreError::NotFound {
                path: path.to_owned(),
            })
    }

    async fn delete_secret(&self, path: &str) -> Result<(), SecretStoreError> {
        self.check_available(path)?;
        self.lock()?.remove(path);
        Ok(())
    }

    async fn unseal(&self, session: &MasterKeySession) -> Result<(), SecretStoreError> {
        self.check_available("sys/unseal")?;
        let key = session
            .key(Utc::now())
            .ok_or(SecretStoreError::SessionExpired)?;
        let digest: [u8; 32] = Sha256::digest(key.material().expose()).into();
        if let Ok(mut slot) = self.inner.unsealed_with.lock() {
            *slot = Some(digest);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemorySecretStore::new();
        store.put_secret("a/b", b"v1").await.unwrap();
        store.put_secret("a/b", b"v2").await.unwrap();
        assert_eq!(store.get_secret("a/b").await.unwrap().expose_secret(), b"v2");
        store.delete_secret("a/b").await.unwrap();
        assert!(matches!(
            store.get_secret("a/b").await,
            Err(SecretStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_is_create_only() {
        let store = MemorySecretStore::new();
        store.create_secret("k", b"1").await.unwrap();
        assert!(matches!(
            store.create_secret("k", b"2").await,
            Err(SecretStoreError::Conflict { .. })
        ));
        assert_eq!(store.get_secret("k").await.unwrap().expose_secret(), b"1");
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemorySecretStore::new();
        store.fail_next(2);
        assert!(store.put_secret("k", b"1").await.unwrap_err().is_transient());
        assert!(store.put_secret("k", b"1").await.unwrap_err().is_transient());
        store.put_secret("k", b"1").await.unwrap();

        store.set_outage(true);
        assert!(store.get_secret("k").await.unwrap_err().is_transient());
        store.set_outage(false);
        assert!(store.get_secret("k").await.is_ok());
    }
}
