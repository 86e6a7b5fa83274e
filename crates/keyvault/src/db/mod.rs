//! Durable relational store (SQLite) for key records, escrow shares,
//! recovery requests, the audit log, and the event outbox.
//!
//! # Module invariants
//!
//! - No plaintext key material is ever written here. Wrapped DEKs, encrypted
//!   shares, and KDF recipes only.
//! - Audit entries and recovery requests are never deleted; triggers reject
//!   any attempt.
//! - Multi-row changes run inside `BEGIN IMMEDIATE` so concurrent processes
//!   serialise on the write lock.

pub mod audit;
pub mod keys;
pub mod outbox;
pub mod recovery;
pub mod seal;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

/// Errors produced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A persisted row does not decode into a valid domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("database connection lock poisoned")]
    Poisoned,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS surveys (
    id          TEXT PRIMARY KEY,
    tier        TEXT NOT NULL CHECK (tier IN ('INDIVIDUAL', 'ORGANIZATION')),
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS survey_key_records (
    survey_id           TEXT PRIMARY KEY REFERENCES surveys(id),
    wrap_version        INTEGER NOT NULL,
    wrapped_dek         BLOB NOT NULL,
    kek_derivation      TEXT NOT NULL,
    escrow_wrapped_dek  BLOB,
    created_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS escrow_shares (
    survey_id        TEXT NOT NULL REFERENCES surveys(id),
    share_index      INTEGER NOT NULL,
    threshold        INTEGER NOT NULL,
    encrypted_share  BLOB NOT NULL,
    custodian_ref    TEXT NOT NULL,
    PRIMARY KEY (survey_id, share_index)
);

CREATE TABLE IF NOT EXISTS recovery_requests (
    id                      TEXT PRIMARY KEY,
    survey_id               TEXT NOT NULL,
    requested_by            TEXT NOT NULL,
    state                   TEXT NOT NULL,
    requested_at            INTEGER NOT NULL,
    reviewed_by             TEXT,
    reviewed_at             INTEGER,
    scheduled_execution_at  INTEGER,
    completed_at            INTEGER,
    rejection_reason        TEXT,
    cancelled_by            TEXT,
    cancelled_at            INTEGER,
    failed_at               INTEGER,
    failure_reason          TEXT,
    attempts                INTEGER NOT NULL DEFAULT 0,
    claim_token             TEXT,
    claimed_until           INTEGER,
    pending_kek_derivation  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recovery_due
    ON recovery_requests(state, scheduled_execution_at);

CREATE UNIQUE INDEX IF NOT EXISTS idx_recovery_one_open
    ON recovery_requests(survey_id) WHERE state IN ('REQUESTED', 'APPROVED');

CREATE TRIGGER IF NOT EXISTS recovery_requests_retained
    BEFORE DELETE ON recovery_requests
BEGIN
    SELECT RAISE(ABORT, 'recovery requests are retained');
END;

CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    actor       TEXT NOT NULL,
    action      TEXT NOT NULL,
    target_id   TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    detail      TEXT,
    timestamp   INTEGER NOT NULL,
    prev_hash   TEXT NOT NULL,
    entry_hash  TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update
    BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
    BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TABLE IF NOT EXISTS event_outbox (
    event_id      TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    payload       TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    delivered_at  INTEGER
);

CREATE TABLE IF NOT EXISTS platform_seal (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    threshold   INTEGER NOT NULL,
    custodians  TEXT NOT NULL,
    check_blob  BLOB NOT NULL,
    created_at  INTEGER NOT NULL
);
"#;

/// Shared handle to the SQLite connection.
///
/// Cloning is cheap. Every call takes the connection lock only for the
/// duration of its SQL; callers must never hold it across network I/O.
#[derive(Clone, Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the file cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Open a private in-memory database. Used by tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Overwritten wrapped DEKs must not linger in free pages.
        conn.pragma_update(None, "secure_delete", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run `f` against the connection outside an explicit transaction.
    pub fn read<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error rolls
    /// everything back, including audit entries written by `f`.
    pub fn write<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    /// Cheap liveness probe used by the health endpoint.
    pub fn ping(&self) -> bool {
        self.lock()
            .and_then(|c| {
                c.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
                    .map_err(StoreError::from)
            })
            .is_ok()
    }
}

/// Timestamps are stored as integer microseconds since the Unix epoch.
pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {micros}")))
}

pub(crate) fn opt_from_micros(micros: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    micros.map(from_micros).transpose()
}
