//! Append-only audit log rows.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{from_micros, to_micros, StoreError};
use crate::audit::AuditLogEntry;

const COLUMNS: &str =
    "id, actor, action, target_id, outcome, detail, timestamp, prev_hash, entry_hash";

fn entry_from_row(r: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let timestamp = from_micros(r.get(6)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Integer, Box::new(e)))?;
    Ok(AuditLogEntry {
        id: r.get(0)?,
        actor: r.get(1)?,
        action: r.get(2)?,
        target_id: r.get(3)?,
        outcome: r.get(4)?,
        detail: r.get(5)?,
        timestamp,
        prev_hash: r.get(7)?,
        entry_hash: r.get(8)?,
    })
}

/// Hash of the newest entry, the chain head.
pub fn head_hash(conn: &Connection) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT entry_hash FROM audit_log ORDER BY id DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?)
}

/// Append `entry`; returns the assigned row id.
pub fn insert(conn: &Connection, entry: &AuditLogEntry) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO audit_log (actor, action, target_id, outcome, detail, timestamp, prev_hash, entry_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.actor,
            entry.action,
            entry.target_id,
            entry.outcome,
            entry.detail,
            to_micros(entry.timestamp),
            entry.prev_hash,
            entry.entry_hash,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// All entries in chain order.
pub fn list(conn: &Connection) -> Result<Vec<AuditLogEntry>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM audit_log ORDER BY id"))?;
    let rows = stmt.query_map([], entry_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Entries about one target, in chain order.
pub fn list_for_target(conn: &Connection, target_id: &str) -> Result<Vec<AuditLogEntry>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM audit_log WHERE target_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![target_id], entry_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
