//! Append-only, hash-chained audit emitter.
//!
//! Every operation that touches key material or recovery state records an
//! entry before it reports success. A failed write aborts the operation:
//! [`Auditor::record_tx`] shares the caller's transaction, so the entry and
//! the state change commit or roll back together.
//!
//! Each entry stores the SHA-256 of its predecessor, so editing or removing
//! a row out-of-band is detected by [`verify_chain`].

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::db::{self, Database, StoreError};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    Store(#[from] StoreError),

    /// The stored chain does not hash-link at entry `id`.
    #[error("audit chain broken at entry {id}")]
    ChainBroken { id: i64 },
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    SurveyProvisioned,
    DekUnwrap,
    DekRewrap,
    KeysDestroyed,
    EscrowGranted,
    RecoveryRequested,
    RecoveryApproved,
    RecoveryRejected,
    RecoveryCancelled,
    RecoveryCompleted,
    RecoveryAttemptFailed,
    RecoveryFailed,
    PlatformInitialised,
    UnsealSessionOpened,
    UnsealSharePresented,
    PlatformUnsealed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::SurveyProvisioned => "survey.provisioned",
            AuditAction::DekUnwrap => "dek.unwrap",
            AuditAction::DekRewrap => "dek.rewrap",
            AuditAction::KeysDestroyed => "keys.destroyed",
            AuditAction::EscrowGranted => "escrow.granted",
            AuditAction::RecoveryRequested => "recovery.requested",
            AuditAction::RecoveryApproved => "recovery.approved",
            AuditAction::RecoveryRejected => "recovery.rejected",
            AuditAction::RecoveryCancelled => "recovery.cancelled",
            AuditAction::RecoveryCompleted => "recovery.completed",
            AuditAction::RecoveryAttemptFailed => "recovery.attempt_failed",
            AuditAction::RecoveryFailed => "recovery.failed",
            AuditAction::PlatformInitialised => "platform.initialised",
            AuditAction::UnsealSessionOpened => "unseal.session_opened",
            AuditAction::UnsealSharePresented => "unseal.share_presented",
            AuditAction::PlatformUnsealed => "platform.unsealed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Denied,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Denied => "denied",
        }
    }
}

/// An entry about to be recorded.
#[derive(Debug, Clone)]
pub struct AuditEvent<'a> {
    pub actor: &'a str,
    pub action: AuditAction,
    pub target_id: &'a str,
    pub outcome: Outcome,
    /// Free-form context. Never key material or credentials.
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl<'a> AuditEvent<'a> {
    pub fn success(actor: &'a str, action: AuditAction, target_id: &'a str, at: DateTime<Utc>) -> Self {
        Self {
            actor,
            action,
            target_id,
            outcome: Outcome::Success,
            detail: None,
            at,
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A persisted audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub target_id: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditLogEntry {
    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.prev_hash.as_str(),
            self.actor.as_str(),
            self.action.as_str(),
            self.target_id.as_str(),
            self.outcome.as_str(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        match &self.detail {
            Some(d) => {
                hasher.update([1u8]);
                hasher.update((d.len() as u64).to_le_bytes());
                hasher.update(d.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update(self.timestamp.timestamp_micros().to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Writes audit entries to the relational store.
#[derive(Debug, Clone)]
pub struct Auditor {
    db: Database,
}

impl Auditor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record `event` in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] if the entry could not be written; the
    /// caller must then abort.
    pub fn record(&self, event: AuditEvent<'_>) -> Result<AuditLogEntry, AuditError> {
        self.db.write(|tx| Self::record_tx(tx, event))
    }

    /// Record `event` inside the caller's transaction.
    pub fn record_tx(conn: &Connection, event: AuditEvent<'_>) -> Result<AuditLogEntry, AuditError> {
        let prev_hash = db::audit::head_hash(conn)?.unwrap_or_else(|| GENESIS_HASH.to_owned());
        let mut entry = AuditLogEntry {
            id: 0,
            actor: event.actor.to_owned(),
            action: event.action.as_str().to_owned(),
            target_id: event.target_id.to_owned(),
            outcome: event.outcome.as_str().to_owned(),
            detail: event.detail,
            // Stored at microsecond precision; truncate before hashing.
            timestamp: db::from_micros(db::to_micros(event.at))?,
            prev_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();
        entry.id = db::audit::insert(conn, &entry)?;

        info!(
            target: "audit",
            audit_id = entry.id,
            actor = %entry.actor,
            action = %entry.action,
            target_id = %entry.target_id,
            outcome = %entry.outcome,
            "audit entry recorded"
        );
        Ok(entry)
    }

    pub fn entries_for(&self, target_id: &str) -> Result<Vec<AuditLogEntry>, AuditError> {
        Ok(self.db.read(|c| db::audit::list_for_target(c, target_id))?)
    }

    pub fn verify(&self) -> Result<usize, AuditError> {
        self.db.read(verify_chain)
    }
}

/// Walk the whole log and check every hash link. Returns the entry count.
///
/// # Errors
///
/// Returns [`AuditError::ChainBroken`] at the first entry whose stored hash
/// or predecessor link does not match.
pub fn verify_chain(conn: &Connection) -> Result<usize, AuditError> {
    let entries = db::audit::list(conn)?;
    let mut expected_prev = GENESIS_HASH.to_owned();
    for entry in &entries {
        if entry.prev_hash != expected_prev || entry.compute_hash() != entry.entry_hash {
            return Err(AuditError::ChainBroken { id: entry.id });
        }
        expected_prev = entry.entry_hash.clone();
    }
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auditor() -> (Database, Auditor) {
        let db = Database::open_in_memory().unwrap();
        (db.clone(), Auditor::new(db))
    }

    #[test]
    fn entries_are_chained() {
        let (_db, auditor) = auditor();
        let now = Utc::now();
        let a = auditor
            .record(AuditEvent::success("u1", AuditAction::DekUnwrap, "s1", now))
            .unwrap();
        let b = auditor
            .record(
                AuditEvent::success("u1", AuditAction::DekUnwrap, "s1", now)
                    .with_outcome(Outcome::Failure)
                    .with_detail("integrity"),
            )
            .unwrap();
        assert_eq!(a.prev_hash, GENESIS_HASH);
        assert_eq!(b.prev_hash, a.entry_hash);
        assert_eq!(auditor.verify().unwrap(), 2);
        assert_eq!(auditor.entries_for("s1").unwrap().len(), 2);
    }

    #[test]
    fn log_is_append_only() {
        let (db, auditor) = auditor();
        auditor
            .record(AuditEvent::success("u1", AuditAction::KeysDestroyed, "s1", Utc::now()))
            .unwrap();
        let update: Result<usize, StoreError> =
            db.write(|tx| Ok(tx.execute("UPDATE audit_log SET outcome = 'denied'", [])?));
        assert!(update.is_err());
        let delete: Result<usize, StoreError> =
            db.write(|tx| Ok(tx.execute("DELETE FROM audit_log", [])?));
        assert!(delete.is_err());
    }

    #[test]
    fn tampering_breaks_chain() {
        let (db, auditor) = auditor();
        let now = Utc::now();
        for _ in 0..3 {
            auditor
                .record(AuditEvent::success("u1", AuditAction::DekUnwrap, "s1", now))
                .unwrap();
        }
        // Simulate an out-of-band edit that bypasses the triggers.
        db.write(|tx| {
            tx.execute_batch(
                "DROP TRIGGER audit_log_no_update;
                 UPDATE audit_log SET actor = 'mallory' WHERE id = 2;",
            )
            .map_err(StoreError::from)
        })
        .unwrap();
        assert!(matches!(
            auditor.verify(),
            Err(AuditError::ChainBroken { id: 2 })
        ));
    }

    #[test]
    fn rolled_back_transaction_drops_entry() {
        let (db, auditor) = auditor();
        let res: Result<(), AuditError> = db.write(|tx| {
            Auditor::record_tx(
                tx,
                AuditEvent::success("u1", AuditAction::RecoveryApproved, "r1", Utc::now()),
            )?;
            Err(AuditError::ChainBroken { id: -1 })
        });
        assert!(res.is_err());
        assert!(auditor.entries_for("r1").unwrap().is_empty());
    }
}
