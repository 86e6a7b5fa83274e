//! Survey, key record, and escrow share rows.

use common::protocol::Tier;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{from_micros, to_micros, StoreError};
use crate::dek::{SurveyKeyRecord, WrappedDek};
use crate::escrow::EscrowShareRecord;
use crate::survey::Survey;

pub fn insert_survey(conn: &Connection, survey: &Survey) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO surveys (id, tier, created_at) VALUES (?1, ?2, ?3)",
        params![survey.id, survey.tier.as_str(), to_micros(survey.created_at)],
    )?;
    Ok(())
}

pub fn get_survey(conn: &Connection, id: &str) -> Result<Option<Survey>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, tier, created_at FROM surveys WHERE id = ?1",
            params![id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(id, tier, created_at)| {
        let tier = Tier::parse(&tier)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown tier {tier:?}")))?;
        Ok(Survey {
            id,
            tier,
            created_at: from_micros(created_at)?,
        })
    })
    .transpose()
}

pub fn update_survey_tier(conn: &Connection, id: &str, tier: Tier) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE surveys SET tier = ?2 WHERE id = ?1",
        params![id, tier.as_str()],
    )?;
    Ok(changed == 1)
}

const KEY_RECORD_COLUMNS: &str =
    "survey_id, wrap_version, wrapped_dek, kek_derivation, escrow_wrapped_dek, created_at";

fn key_record_from_row(row: &Row<'_>) -> rusqlite::Result<RawKeyRecord> {
    Ok(RawKeyRecord {
        survey_id: row.get(0)?,
        wrap_version: row.get(1)?,
        wrapped_dek: row.get(2)?,
        kek_derivation: row.get(3)?,
        escrow_wrapped_dek: row.get(4)?,
        created_at: row.get(5)?,
    })
}

struct RawKeyRecord {
    survey_id: String,
    wrap_version: u32,
    wrapped_dek: Vec<u8>,
    kek_derivation: String,
    escrow_wrapped_dek: Option<Vec<u8>>,
    created_at: i64,
}

impl RawKeyRecord {
    fn decode(self) -> Result<SurveyKeyRecord, StoreError> {
        let corrupt = |what: &str| StoreError::Corrupt(format!("{what} for survey {}", self.survey_id));
        let wrapped_dek =
            WrappedDek::from_bytes(&self.wrapped_dek).map_err(|_| corrupt("wrapped_dek"))?;
        let escrow_wrapped_dek = self
            .escrow_wrapped_dek
            .as_deref()
            .map(WrappedDek::from_bytes)
            .transpose()
            .map_err(|_| corrupt("escrow_wrapped_dek"))?;
        let kek_derivation =
            serde_json::from_str(&self.kek_derivation).map_err(|_| corrupt("kek_derivation"))?;
        Ok(SurveyKeyRecord {
            wrapped_dek,
            wrap_version: self.wrap_version,
            kek_derivation,
            escrow_wrapped_dek,
            created_at: from_micros(self.created_at)?,
            survey_id: self.survey_id,
        })
    }
}

pub fn get_key_record(
    conn: &Connection,
    survey_id: &str,
) -> Result<Option<SurveyKeyRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {KEY_RECORD_COLUMNS} FROM survey_key_records WHERE survey_id = ?1"),
        params![survey_id],
        key_record_from_row,
    )
    .optional()?
    .map(RawKeyRecord::decode)
    .transpose()
}

fn encode_derivation(record: &SurveyKeyRecord) -> Result<String, StoreError> {
    serde_json::to_string(&record.kek_derivation)
        .map_err(|e| StoreError::Corrupt(format!("kek_derivation: {e}")))
}

/// Insert the first key record of a survey. Fails if one already exists.
pub fn insert_key_record(conn: &Connection, record: &SurveyKeyRecord) -> Result<(), StoreError> {
    conn.execute(
        &format!("INSERT INTO survey_key_records ({KEY_RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            record.survey_id,
            record.wrap_version,
            record.wrapped_dek.to_bytes(),
            encode_derivation(record)?,
            record.escrow_wrapped_dek.as_ref().map(WrappedDek::to_bytes),
            to_micros(record.created_at),
        ],
    )?;
    Ok(())
}

/// Replace the active key record, but only if it is still at
/// `expected_version`. Returns `false` when the guard did not match.
pub fn replace_key_record(
    conn: &Connection,
    record: &SurveyKeyRecord,
    expected_version: u32,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE survey_key_records
            SET wrap_version = ?2, wrapped_dek = ?3, kek_derivation = ?4,
                escrow_wrapped_dek = ?5, created_at = ?6
          WHERE survey_id = ?1 AND wrap_version = ?7",
        params![
            record.survey_id,
            record.wrap_version,
            record.wrapped_dek.to_bytes(),
            encode_derivation(record)?,
            record.escrow_wrapped_dek.as_ref().map(WrappedDek::to_bytes),
            to_micros(record.created_at),
            expected_version,
        ],
    )?;
    Ok(changed == 1)
}

pub fn delete_key_record(conn: &Connection, survey_id: &str) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "DELETE FROM survey_key_records WHERE survey_id = ?1",
        params![survey_id],
    )?)
}

pub fn insert_escrow_share(conn: &Connection, share: &EscrowShareRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO escrow_shares (survey_id, share_index, threshold, encrypted_share, custodian_ref)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            share.survey_id,
            share.share_index,
            share.threshold,
            share.encrypted_share,
            share.custodian_ref,
        ],
    )?;
    Ok(())
}

pub fn escrow_shares(conn: &Connection, survey_id: &str) -> Result<Vec<EscrowShareRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT survey_id, share_index, threshold, encrypted_share, custodian_ref
           FROM escrow_shares WHERE survey_id = ?1 ORDER BY share_index",
    )?;
    let rows = stmt.query_map(params![survey_id], |r| {
        Ok(EscrowShareRecord {
            survey_id: r.get(0)?,
            share_index: r.get(1)?,
            threshold: r.get(2)?,
            encrypted_share: r.get(3)?,
            custodian_ref: r.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn delete_escrow_shares(conn: &Connection, survey_id: &str) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "DELETE FROM escrow_shares WHERE survey_id = ?1",
        params![survey_id],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Dek, KdfParams, KekDerivation, Kek};
    use crate::db::Database;
    use crate::dek::{wrap_dek, WrapContext};
    use chrono::Utc;

    fn record(survey_id: &str, version: u32) -> SurveyKeyRecord {
        let wrapped = wrap_dek(
            &Dek::generate(),
            &Kek::generate(),
            WrapContext::new(survey_id, version),
        )
        .unwrap();
        SurveyKeyRecord {
            survey_id: survey_id.into(),
            wrapped_dek: wrapped,
            wrap_version: version,
            kek_derivation: KekDerivation::fresh(KdfParams::new(64, 1, 1)),
            escrow_wrapped_dek: None,
            created_at: Utc::now(),
        }
    }

    fn with_survey(db: &Database, id: &str) {
        db.write(|tx| {
            insert_survey(
                tx,
                &Survey {
                    id: id.into(),
                    tier: Tier::Organization,
                    created_at: Utc::now(),
                },
            )
        })
        .unwrap();
    }

    #[test]
    fn key_record_round_trip() {
        let db = Database::open_in_memory().unwrap();
        with_survey(&db, "s1");
        let rec = record("s1", 1);
        db.write(|tx| insert_key_record(tx, &rec)).unwrap();

        let loaded = db.read(|c| get_key_record(c, "s1")).unwrap().unwrap();
        assert_eq!(loaded.wrapped_dek, rec.wrapped_dek);
        assert_eq!(loaded.kek_derivation, rec.kek_derivation);
        assert!(db.read(|c| get_key_record(c, "missing")).unwrap().is_none());
    }

    #[test]
    fn one_active_record_per_survey() {
        let db = Database::open_in_memory().unwrap();
        with_survey(&db, "s1");
        db.write(|tx| insert_key_record(tx, &record("s1", 1))).unwrap();
        assert!(db.write(|tx| insert_key_record(tx, &record("s1", 1))).is_err());
    }

    #[test]
    fn replace_is_version_guarded() {
        let db = Database::open_in_memory().unwrap();
        with_survey(&db, "s1");
        db.write(|tx| insert_key_record(tx, &record("s1", 1))).unwrap();

        let next = record("s1", 2);
        assert!(!db.write(|tx| replace_key_record(tx, &next, 5)).unwrap());
        assert!(db.write(|tx| replace_key_record(tx, &next, 1)).unwrap());
        // A second replay against the old version is a no-op.
        assert!(!db.write(|tx| replace_key_record(tx, &next, 1)).unwrap());

        let loaded = db.read(|c| get_key_record(c, "s1")).unwrap().unwrap();
        assert_eq!(loaded.wrap_version, 2);
    }

    #[test]
    fn escrow_shares_ordered_by_index() {
        let db = Database::open_in_memory().unwrap();
        with_survey(&db, "s1");
        for idx in [3u8, 1, 2] {
            db.write(|tx| {
                insert_escrow_share(
                    tx,
                    &EscrowShareRecord {
                        survey_id: "s1".into(),
                        share_index: idx,
                        threshold: 2,
                        encrypted_share: vec![idx; 8],
                        custodian_ref: format!("c{idx}"),
                    },
                )
            })
            .unwrap();
        }
        let shares = db.read(|c| escrow_shares(c, "s1")).unwrap();
        let idx: Vec<u8> = shares.iter().map(|s| s.share_index).collect();
        assert_eq!(idx, vec![1, 2, 3]);
        assert_eq!(db.write(|tx| delete_escrow_shares(tx, "s1")).unwrap(), 3);
    }
}
