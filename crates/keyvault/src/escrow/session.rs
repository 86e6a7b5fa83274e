//! Live unseal sessions and the short-lived master key they produce.
//!
//! Custodians present their shares one by one into an [`UnsealSession`].
//! Shares live only in that session: when it expires it is purged and every
//! share is wiped. Reaching the threshold consumes the session and yields a
//! [`MasterKeySession`], which is handed explicitly to the operation that
//! needs it and dropped afterwards. No master key is ever stored globally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::time;
use tracing::{debug, error};
use uuid::Uuid;

use super::shamir::{self, Share};
use super::{verify_check_blob, EscrowError};
use crate::crypto::MasterKey;

/// The reconstructed platform master key, valid until `expires_at`.
pub struct MasterKeySession {
    key: MasterKey,
    expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for MasterKeySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeySession")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl MasterKeySession {
    pub(crate) fn new(key: MasterKey, expires_at: DateTime<Utc>) -> Self {
        Self { key, expires_at }
    }

    /// The master key, or `None` once the session has expired.
    pub fn key(&self, now: DateTime<Utc>) -> Option<&MasterKey> {
        (now < self.expires_at).then_some(&self.key)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Shares collected so far for one reconstruction attempt.
#[derive(Debug)]
pub struct UnsealSession {
    id: Uuid,
    threshold: u8,
    roster: Vec<String>,
    check_blob: Vec<u8>,
    expires_at: DateTime<Utc>,
    presented: HashMap<String, Share>,
}

impl UnsealSession {
    pub fn new(
        roster: Vec<String>,
        threshold: u8,
        check_blob: Vec<u8>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            threshold,
            roster,
            check_blob,
            expires_at: now + ttl,
            presented: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn presented(&self) -> usize {
        self.presented.len()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Accept `custodian`'s own share.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::SessionExpired`] after the deadline.
    /// - [`EscrowError::UnknownCustodian`] if `custodian` is not on the roster.
    /// - [`EscrowError::AlreadyPresented`] on a second presentation.
    /// - [`EscrowError::ShareMismatch`] if the share was not issued to `custodian`.
    pub fn present(&mut self, custodian: &str, share: Share, now: DateTime<Utc>) -> Result<usize, EscrowError> {
        if self.is_expired(now) {
            return Err(EscrowError::SessionExpired);
        }
        let position = self
            .roster
            .iter()
            .position(|c| c == custodian)
            .ok_or_else(|| EscrowError::UnknownCustodian(custodian.to_owned()))?;
        if self.presented.contains_key(custodian) {
            return Err(EscrowError::AlreadyPresented(custodian.to_owned()));
        }
        // Share x is issued to the custodian at roster position x - 1.
        if usize::from(share.index()) != position + 1 || share.threshold() != self.threshold {
            return Err(EscrowError::ShareMismatch(custodian.to_owned()));
        }
        self.presented.insert(custodian.to_owned(), share);
        Ok(self.presented.len())
    }

    pub fn is_complete(&self) -> bool {
        self.presented.len() >= usize::from(self.threshold)
    }

    /// Reconstruct and verify the master key. Consumes the session so the
    /// shares are wiped whatever the outcome.
    pub fn finish(self, now: DateTime<Utc>, master_ttl: Duration) -> Result<MasterKeySession, EscrowError> {
        if self.is_expired(now) {
            return Err(EscrowError::SessionExpired);
        }
        let shares: Vec<Share> = self.presented.into_values().collect();
        let material = shamir::reconstruct(&shares)?;
        let key = MasterKey::from_material(material);
        verify_check_blob(&key, &self.check_blob)?;
        Ok(MasterKeySession::new(key, now + master_ttl))
    }
}

/// Result of presenting a share.
#[derive(Debug)]
pub struct PresentOutcome {
    pub presented: usize,
    pub threshold: u8,
    /// Set once the threshold was reached and the key verified.
    pub master: Option<MasterKeySession>,
}

/// Open unseal sessions, keyed by id.
#[derive(Debug, Default)]
pub struct UnsealSessions {
    sessions: Mutex<HashMap<Uuid, UnsealSession>>,
}

impl UnsealSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, UnsealSession>>, EscrowError> {
        self.sessions.lock().map_err(|_| EscrowError::Poisoned)
    }

    /// Drop expired sessions. Returns how many were purged.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, EscrowError> {
        let mut sessions = self.lock()?;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        Ok(before - sessions.len())
    }

    pub fn insert(&self, session: UnsealSession) -> Result<(), EscrowError> {
        self.lock()?.insert(session.id(), session);
        Ok(())
    }

    /// Present a share into session `id`. On reaching the threshold the
    /// session is removed and reconstructed.
    pub fn present(
        &self,
        id: Uuid,
        custodian: &str,
        share: Share,
        now: DateTime<Utc>,
        master_ttl: Duration,
    ) -> Result<PresentOutcome, EscrowError> {
        let mut sessions = self.lock()?;
        sessions.retain(|_, s| !s.is_expired(now));
        let session = sessions.get_mut(&id).ok_or(EscrowError::SessionNotFound(id))?;
        let presented = session.present(custodian, share, now)?;
        let threshold = session.threshold();
        if !session.is_complete() {
            return Ok(PresentOutcome {
                presented,
                threshold,
                master: None,
            });
        }
        let session = sessions.remove(&id).ok_or(EscrowError::SessionNotFound(id))?;
        drop(sessions);
        let master = session.finish(now, master_ttl)?;
        Ok(PresentOutcome {
            presented,
            threshold,
            master: Some(master),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How often [`sweep_task`] purges abandoned sessions.
pub const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// Spawn a background task that purges expired sessions every `interval`,
/// wiping the shares of sessions nobody finished.
pub fn sweep_task(sessions: Arc<UnsealSessions>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sessions.purge_expired(Utc::now()) {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "expired unseal sessions purged"),
                Err(e) => error!(error = %e, "unseal session sweep failed"),
            }
        }
    })
}
