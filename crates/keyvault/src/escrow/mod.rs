//! Escrow and split-knowledge key custody.
//!
//! Two threshold schemes live here:
//!
//! - **Platform master key.** Generated once by [`EscrowManager::initialise_platform`]
//!   and split among human custodians; only a check value is persisted.
//!   Unsealing the secret store requires `t` custodians to present their
//!   shares live within one [`UnsealSession`].
//! - **Per-survey escrow.** Each ORGANIZATION survey gets a random
//!   [`EscrowKek`] that wraps its DEK. That key is split `t`-of-`n` across
//!   the configured custodians, and each share is sealed under the
//!   custodian's share-wrapping key held by the secret store. Recovery
//!   fetches those keys from the store, so no human takes part.

pub mod session;
pub mod shamir;

pub use session::{MasterKeySession, PresentOutcome, UnsealSession, UnsealSessions};
pub use shamir::{Share, ShamirError};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::actor::Actor;
use crate::audit::{AuditAction, AuditError, AuditEvent, Auditor, Outcome};
use crate::crypto::{self, CipherError, CustodianKey, EscrowKek, MasterKey, Sealed};
use crate::db::seal::PlatformSeal;
use crate::db::{self, Database, StoreError};
use crate::secret_store::{SecretStore, SecretStoreError};

const CHECK_PLAINTEXT: &[u8] = b"keyvault platform seal v1";
const CHECK_AAD: &[u8] = b"keyvault/platform-seal";

/// Target id used for platform-level audit entries.
pub const PLATFORM_TARGET: &str = "platform";

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error(transparent)]
    Shamir(#[from] ShamirError),

    #[error("unseal session expired")]
    SessionExpired,

    #[error("unseal session {0} not found or expired")]
    SessionNotFound(Uuid),

    #[error("{0} is not a custodian")]
    UnknownCustodian(String),

    #[error("custodian {0} already presented a share")]
    AlreadyPresented(String),

    #[error("share was not issued to custodian {0}")]
    ShareMismatch(String),

    /// The reconstructed master key does not open the check value.
    #[error("reconstructed key failed verification")]
    CheckFailed,

    #[error("platform key custody is already initialised")]
    AlreadyInitialised,

    #[error("platform key custody has not been initialised")]
    NotInitialised,

    #[error("invalid custodian roster: {0}")]
    InvalidRoster(String),

    /// An escrow share or custodian key failed verification.
    #[error("escrow material failed verification: {0}")]
    Integrity(String),

    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("unseal session registry lock poisoned")]
    Poisoned,
}

/// Persisted, encrypted share of a survey's escrow KEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowShareRecord {
    pub survey_id: String,
    pub share_index: u8,
    pub threshold: u8,
    /// `nonce || ciphertext || tag` under the custodian's share-wrapping key.
    pub encrypted_share: Vec<u8>,
    pub custodian_ref: String,
}

/// Fresh escrow material for a survey being provisioned.
#[derive(Debug)]
pub struct EscrowGrant {
    pub escrow_kek: EscrowKek,
    pub shares: Vec<EscrowShareRecord>,
}

/// Secret store path of a custodian's share-wrapping key.
pub fn custodian_key_path(custodian_ref: &str) -> String {
    format!("escrow/custodians/{custodian_ref}")
}

fn share_aad(survey_id: &str, index: u8) -> Vec<u8> {
    format!("keyvault/escrow-share/{index}/{survey_id}").into_bytes()
}

pub(crate) fn make_check_blob(key: &MasterKey) -> Result<Vec<u8>, EscrowError> {
    crypto::seal(key.material(), CHECK_PLAINTEXT, CHECK_AAD)
        .map(|s| s.to_bytes())
        .map_err(|e| EscrowError::Integrity(e.to_string()))
}

pub(crate) fn verify_check_blob(key: &MasterKey, blob: &[u8]) -> Result<(), EscrowError> {
    let sealed = Sealed::from_bytes(blob).map_err(|_| EscrowError::CheckFailed)?;
    match crypto::open(key.material(), &sealed, CHECK_AAD) {
        Ok(pt) if pt == CHECK_PLAINTEXT => Ok(()),
        _ => Err(EscrowError::CheckFailed),
    }
}

pub fn validate_roster(custodians: &[String], threshold: u8) -> Result<u8, EscrowError> {
    let n = u8::try_from(custodians.len())
        .map_err(|_| EscrowError::InvalidRoster("at most 255 custodians".into()))?;
    if n == 0 {
        return Err(EscrowError::InvalidRoster("no custodians".into()));
    }
    if threshold == 0 || threshold > n {
        return Err(EscrowError::InvalidRoster(format!(
            "threshold {threshold} must be between 1 and {n}"
        )));
    }
    let mut seen = HashSet::new();
    for c in custodians {
        if c.trim().is_empty() || c.contains('/') {
            return Err(EscrowError::InvalidRoster(format!("invalid custodian name {c:?}")));
        }
        if !seen.insert(c.as_str()) {
            return Err(EscrowError::InvalidRoster(format!("duplicate custodian {c:?}")));
        }
    }
    Ok(n)
}

/// Progress of an unseal after presenting one share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsealStatus {
    pub presented: usize,
    pub threshold: u8,
    pub unsealed: bool,
}

/// Coordinates custodian key material with the secret store.
pub struct EscrowManager<S> {
    store: Arc<S>,
    db: Database,
    auditor: Auditor,
    custodians: Vec<String>,
    threshold: u8,
}

impl<S> std::fmt::Debug for EscrowManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowManager")
            .field("custodians", &self.custodians)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl<S: SecretStore> EscrowManager<S> {
    /// # Errors
    ///
    /// Returns [`EscrowError::InvalidRoster`] if the survey escrow roster is unusable.
    pub fn new(
        store: Arc<S>,
        db: Database,
        custodians: Vec<String>,
        threshold: u8,
    ) -> Result<Self, EscrowError> {
        validate_roster(&custodians, threshold)?;
        Ok(Self {
            store,
            auditor: Auditor::new(db.clone()),
            db,
            custodians,
            threshold,
        })
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Create any missing custodian share-wrapping keys. Existing keys are
    /// left untouched, so this is safe to run at every startup.
    pub async fn ensure_custodian_keys(&self) -> Result<usize, EscrowError> {
        let mut created = 0;
        for custodian in &self.custodians {
            let key = CustodianKey::generate();
            match self
                .store
                .create_secret(&custodian_key_path(custodian), key.material().expose())
                .await
            {
                Ok(()) => created += 1,
                Err(SecretStoreError::Conflict { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if created > 0 {
            info!(created, "custodian share-wrapping keys created");
        }
        Ok(created)
    }

    async fn custodian_key(&self, custodian: &str) -> Result<CustodianKey, EscrowError> {
        let secret = self.store.get_secret(&custodian_key_path(custodian)).await?;
        CustodianKey::from_slice(secret.expose_secret())
            .map_err(|_| EscrowError::Integrity(format!("custodian key {custodian} is malformed")))
    }

    /// Generate a survey escrow KEK and its sealed shares.
    pub async fn prepare_grant(&self, survey_id: &str) -> Result<EscrowGrant, EscrowError> {
        let escrow_kek = EscrowKek::generate();
        let n = validate_roster(&self.custodians, self.threshold)?;
        let shares = shamir::split(escrow_kek.material(), n, self.threshold)?;

        let mut records = Vec::with_capacity(shares.len());
        for (custodian, share) in self.custodians.iter().zip(&shares) {
            let key = self.custodian_key(custodian).await?;
            let sealed = crypto::seal(
                key.material(),
                &share.to_bytes(),
                &share_aad(survey_id, share.index()),
            )
            .map_err(|e| EscrowError::Integrity(e.to_string()))?;
            records.push(EscrowShareRecord {
                survey_id: survey_id.to_owned(),
                share_index: share.index(),
                threshold: share.threshold(),
                encrypted_share: sealed.to_bytes(),
                custodian_ref: custodian.clone(),
            });
        }
        Ok(EscrowGrant { escrow_kek, shares: records })
    }

    async fn open_share(&self, record: &EscrowShareRecord) -> Result<Share, EscrowError> {
        let key = self.custodian_key(&record.custodian_ref).await?;
        let sealed = Sealed::from_bytes(&record.encrypted_share)
            .map_err(|_| EscrowError::Integrity(format!("share {} is malformed", record.share_index)))?;
        let plain = zeroize::Zeroizing::new(
            crypto::open(
                key.material(),
                &sealed,
                &share_aad(&record.survey_id, record.share_index),
            )
            .map_err(|e| match e {
                CipherError::Integrity => {
                    EscrowError::Integrity(format!("share {} failed verification", record.share_index))
                }
                other => EscrowError::Integrity(other.to_string()),
            })?,
        );
        let share = Share::from_bytes(&plain)?;
        if share.index() != record.share_index {
            return Err(EscrowError::Integrity(format!(
                "share {} carries index {}",
                record.share_index,
                share.index()
            )));
        }
        Ok(share)
    }

    /// Reconstruct a survey's escrow KEK from its persisted shares.
    ///
    /// Shares are opened in index order until the threshold is met. A
    /// transient store failure aborts at once; a missing or corrupt share is
    /// skipped as long as enough others remain.
    pub async fn recover_kek(&self, records: &[EscrowShareRecord]) -> Result<EscrowKek, EscrowError> {
        let need = records
            .first()
            .map(|r| usize::from(r.threshold))
            .ok_or_else(|| EscrowError::Integrity("survey has no escrow shares".into()))?;

        let mut shares = Vec::with_capacity(need);
        let mut last_err = None;
        for record in records {
            if shares.len() == need {
                break;
            }
            match self.open_share(record).await {
                Ok(share) => shares.push(share),
                Err(EscrowError::SecretStore(err)) if err.is_transient() => {
                    return Err(EscrowError::SecretStore(err));
                }
                Err(err) => {
                    warn!(share_index = record.share_index, error = %err, "escrow share unusable");
                    last_err = Some(err);
                }
            }
        }
        if shares.len() < need {
            return Err(last_err.unwrap_or(EscrowError::Shamir(ShamirError::InsufficientShares {
                have: shares.len(),
                need: records[0].threshold,
            })));
        }
        Ok(EscrowKek::from_material(shamir::reconstruct(&shares)?))
    }

    // -----------------------------------------------------------------------
    // Platform ceremony
    // -----------------------------------------------------------------------

    pub fn is_platform_initialised(&self) -> Result<bool, EscrowError> {
        Ok(self.db.read(db::seal::get)?.is_some())
    }

    /// Generate the platform master key and split it among `custodians`.
    ///
    /// Returns each custodian's share exactly once; only a check value is
    /// persisted.
    pub fn initialise_platform(
        &self,
        actor: &Actor,
        custodians: &[String],
        threshold: u8,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Share)>, EscrowError> {
        let n = validate_roster(custodians, threshold)?;
        let master = MasterKey::generate();
        let shares = shamir::split(master.material(), n, threshold)?;
        let seal = PlatformSeal {
            threshold,
            custodians: custodians.to_vec(),
            check_blob: make_check_blob(&master)?,
            created_at: now,
        };
        drop(master);

        self.db.write(|tx| {
            if db::seal::get(tx)?.is_some() {
                return Err(EscrowError::AlreadyInitialised);
            }
            db::seal::insert(tx, &seal)?;
            Auditor::record_tx(
                tx,
                AuditEvent::success(&actor.id, AuditAction::PlatformInitialised, PLATFORM_TARGET, now)
                    .with_detail(format!("threshold {threshold} of {n}")),
            )?;
            Ok(())
        })?;
        info!(threshold, custodians = n, "platform key custody initialised");
        Ok(custodians.iter().cloned().zip(shares).collect())
    }

    /// Open an unseal session against the persisted roster.
    pub fn open_unseal_session(
        &self,
        sessions: &UnsealSessions,
        actor: &Actor,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(Uuid, u8, DateTime<Utc>), EscrowError> {
        sessions.purge_expired(now)?;
        let seal = self.db.read(db::seal::get)?.ok_or(EscrowError::NotInitialised)?;
        let session = UnsealSession::new(seal.custodians, seal.threshold, seal.check_blob, now, ttl);
        let opened = (session.id(), session.threshold(), session.expires_at());
        sessions.insert(session)?;
        self.auditor.record(
            AuditEvent::success(&actor.id, AuditAction::UnsealSessionOpened, PLATFORM_TARGET, now)
                .with_detail(opened.0.to_string()),
        )?;
        Ok(opened)
    }

    /// Present `custodian`'s share. Once the threshold is reached the
    /// reconstructed key is handed to the secret store and dropped.
    pub async fn present_share(
        &self,
        sessions: &UnsealSessions,
        session_id: Uuid,
        custodian: &Actor,
        share_text: &str,
        now: DateTime<Utc>,
        master_ttl: Duration,
    ) -> Result<UnsealStatus, EscrowError> {
        let outcome = Share::decode(share_text)
            .map_err(EscrowError::from)
            .and_then(|share| sessions.present(session_id, &custodian.id, share, now, master_ttl));

        let outcome = match outcome {
            Ok(o) => o,
            Err(err) => {
                self.auditor.record(
                    AuditEvent::success(&custodian.id, AuditAction::UnsealSharePresented, PLATFORM_TARGET, now)
                        .with_outcome(Outcome::Denied)
                        .with_detail(err.to_string()),
                )?;
                return Err(err);
            }
        };
        self.auditor.record(AuditEvent::success(
            &custodian.id,
            AuditAction::UnsealSharePresented,
            PLATFORM_TARGET,
            now,
        ))?;

        let Some(master) = outcome.master else {
            return Ok(UnsealStatus {
                presented: outcome.presented,
                threshold: outcome.threshold,
                unsealed: false,
            });
        };
        let result = self.store.unseal(&master).await;
        drop(master);
        let audit = AuditEvent::success(&custodian.id, AuditAction::PlatformUnsealed, PLATFORM_TARGET, now);
        match result {
            Ok(()) => {
                self.auditor.record(audit)?;
                info!(session_id = %session_id, "secret store unsealed");
                Ok(UnsealStatus {
                    presented: outcome.presented,
                    threshold: outcome.threshold,
                    unsealed: true,
                })
            }
            Err(err) => {
                self.auditor.record(
                    audit
                        .with_outcome(Outcome::Failure)
                        .with_detail(err.to_string()),
                )?;
                Err(err.into())
            }
        }
    }
}
