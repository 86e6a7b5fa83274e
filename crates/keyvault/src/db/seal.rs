//! The single platform seal row written by the custody ceremony.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{from_micros, to_micros, StoreError};

/// Public record of the split-knowledge ceremony. Holds no share material:
/// `check_blob` is an AEAD seal under the master key used to verify a
/// reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSeal {
    pub threshold: u8,
    pub custodians: Vec<String>,
    pub check_blob: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

pub fn get(conn: &Connection) -> Result<Option<PlatformSeal>, StoreError> {
    let row = conn
        .query_row(
            "SELECT threshold, custodians, check_blob, created_at FROM platform_seal WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, u8>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Vec<u8>>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(threshold, custodians, check_blob, created_at)| {
        Ok(PlatformSeal {
            threshold,
            custodians: serde_json::from_str(&custodians)
                .map_err(|e| StoreError::Corrupt(format!("custodians: {e}")))?,
            check_blob,
            created_at: from_micros(created_at)?,
        })
    })
    .transpose()
}

/// Insert the seal. Fails if the platform was already initialised.
pub fn insert(conn: &Connection, seal: &PlatformSeal) -> Result<(), StoreError> {
    let custodians = serde_json::to_string(&seal.custodians)
        .map_err(|e| StoreError::Corrupt(format!("custodians: {e}")))?;
    conn.execute(
        "INSERT INTO platform_seal (id, threshold, custodians, check_blob, created_at)
         VALUES (1, ?1, ?2, ?3, ?4)",
        params![seal.threshold, custodians, seal.check_blob, to_micros(seal.created_at)],
    )?;
    Ok(())
}
