//! Transactional outbox for recovery lifecycle events.
//!
//! Events are inserted in the same transaction as the state change that
//! produced them and delivered afterwards; delivery is at-least-once.

use chrono::{DateTime, Utc};
use common::protocol::RecoveryEvent;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{to_micros, StoreError};

pub fn insert(conn: &Connection, event: &RecoveryEvent) -> Result<(), StoreError> {
    let payload = serde_json::to_string(event)
        .map_err(|e| StoreError::Corrupt(format!("event payload: {e}")))?;
    conn.execute(
        "INSERT INTO event_outbox (event_id, kind, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            event.event_id.to_string(),
            event.kind.as_str(),
            payload,
            to_micros(event.occurred_at),
        ],
    )?;
    Ok(())
}

/// Oldest undelivered events first, at most `limit`.
pub fn undelivered(conn: &Connection, limit: usize) -> Result<Vec<RecoveryEvent>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT payload FROM event_outbox WHERE delivered_at IS NULL
          ORDER BY created_at, rowid LIMIT ?1",
    )?;
    let payloads = stmt
        .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |r| {
            r.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    payloads
        .iter()
        .map(|p| {
            serde_json::from_str(p).map_err(|e| StoreError::Corrupt(format!("event payload: {e}")))
        })
        .collect()
}

pub fn mark_delivered(conn: &Connection, event_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE event_outbox SET delivered_at = ?2 WHERE event_id = ?1 AND delivered_at IS NULL",
        params![event_id.to_string(), to_micros(now)],
    )?;
    Ok(changed == 1)
}
