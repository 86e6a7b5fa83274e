//! Field-level encryption of survey responses.
//!
//! Each response field is sealed under the survey DEK with the field's
//! identity bound as AAD, so a ciphertext moved to another field, response
//! or survey fails verification. The DEK is unwrapped once per
//! [`SurveyKeySession`] and is never persisted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::protocol::Tier;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::actor::Actor;
use crate::audit::{AuditAction, AuditError, AuditEvent, Auditor, Outcome};
use crate::crypto::{self, CipherError, Dek, EscrowKek, KdfError, KdfParams, KekDerivation, Kek, Sealed};
use crate::db::{self, Database, StoreError};
use crate::dek::{unwrap_dek, wrap_dek, SurveyKeyRecord, WrapContext, WrapError};
use crate::escrow::{EscrowError, EscrowManager};
use crate::secret_store::SecretStore;
use crate::survey::{self, SurveyError};

#[derive(Debug, Error)]
pub enum FieldError {
    #[error("{0}")]
    NotFound(String),

    /// Verification failed. `unrecoverable` is set on INDIVIDUAL surveys,
    /// where no other path to the key exists.
    #[error("integrity check failed")]
    Integrity { unrecoverable: bool },

    #[error("{0}")]
    PolicyViolation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("ciphertext is not a valid field blob")]
    InvalidCiphertext,

    #[error("field belongs to survey {field_survey}, session is for {session_survey}")]
    SurveyMismatch {
        field_survey: String,
        session_survey: String,
    },

    #[error(transparent)]
    Survey(#[from] SurveyError),

    #[error(transparent)]
    Kdf(#[from] KdfError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Cipher(CipherError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("key derivation task failed: {0}")]
    Task(String),
}

/// Identity of one encrypted field, bound as AAD.
#[derive(Debug, Clone, Copy)]
pub struct FieldContext<'a> {
    pub survey_id: &'a str,
    pub response_id: &'a str,
    pub field_id: &'a str,
}

impl<'a> FieldContext<'a> {
    pub fn new(survey_id: &'a str, response_id: &'a str, field_id: &'a str) -> Self {
        Self {
            survey_id,
            response_id,
            field_id,
        }
    }

    fn aad(&self) -> Vec<u8> {
        // Length-prefixed so ("a/b", "c") and ("a", "b/c") differ.
        let mut aad = b"keyvault/field/v1".to_vec();
        for part in [self.survey_id, self.response_id, self.field_id] {
            aad.extend_from_slice(&(part.len() as u32).to_be_bytes());
            aad.extend_from_slice(part.as_bytes());
        }
        aad
    }
}

/// How the caller proves access to a survey's DEK.
pub enum KeyAccess<'a> {
    /// The owner's credential, derived with the record's salt and parameters.
    Credential(&'a [u8]),
    /// A KEK the caller already derived.
    Kek(&'a Kek),
    /// The survey's reconstructed escrow KEK. ORGANIZATION only.
    Escrow(&'a EscrowKek),
}

impl KeyAccess<'_> {
    fn label(&self) -> &'static str {
        match self {
            KeyAccess::Credential(_) => "credential",
            KeyAccess::Kek(_) => "kek",
            KeyAccess::Escrow(_) => "escrow",
        }
    }
}

/// An unwrapped survey DEK, good for any number of field operations.
pub struct SurveyKeySession {
    survey_id: String,
    tier: Tier,
    dek: Dek,
}

impl std::fmt::Debug for SurveyKeySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurveyKeySession")
            .field("survey_id", &self.survey_id)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

impl SurveyKeySession {
    pub fn survey_id(&self) -> &str {
        &self.survey_id
    }

    fn check(&self, ctx: &FieldContext<'_>) -> Result<(), FieldError> {
        if ctx.survey_id != self.survey_id {
            return Err(FieldError::SurveyMismatch {
                field_survey: ctx.survey_id.to_owned(),
                session_survey: self.survey_id.clone(),
            });
        }
        Ok(())
    }

    /// Seal `plaintext` into a `v1.<nonce>.<ciphertext+tag>` blob.
    pub fn encrypt(&self, ctx: &FieldContext<'_>, plaintext: &[u8]) -> Result<String, FieldError> {
        self.check(ctx)?;
        let sealed = crypto::seal(self.dek.material(), plaintext, &ctx.aad()).map_err(FieldError::Cipher)?;
        Ok(sealed.to_string_repr())
    }

    /// Open a field blob. Fails closed: no partial plaintext is returned.
    pub fn decrypt(&self, ctx: &FieldContext<'_>, blob: &str) -> Result<Zeroizing<Vec<u8>>, FieldError> {
        self.check(ctx)?;
        let sealed = Sealed::parse(blob).map_err(|_| FieldError::InvalidCiphertext)?;
        crypto::open(self.dek.material(), &sealed, &ctx.aad())
            .map(Zeroizing::new)
            .map_err(|e| match e {
                CipherError::Integrity => FieldError::Integrity {
                    unrecoverable: self.tier == Tier::Individual,
                },
                CipherError::InvalidFormat => FieldError::InvalidCiphertext,
                other => FieldError::Cipher(other),
            })
    }
}

/// Provisions survey keys and opens key sessions.
pub struct FieldEngine<S> {
    db: Database,
    escrow: Arc<EscrowManager<S>>,
    auditor: Auditor,
    kdf_params: KdfParams,
}

impl<S> std::fmt::Debug for FieldEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldEngine")
            .field("kdf_params", &self.kdf_params)
            .finish_non_exhaustive()
    }
}

impl<S: SecretStore> FieldEngine<S> {
    pub fn new(db: Database, escrow: Arc<EscrowManager<S>>, kdf_params: KdfParams) -> Self {
        Self {
            auditor: Auditor::new(db.clone()),
            db,
            escrow,
            kdf_params,
        }
    }

    /// Create the survey's DEK and persist its wrapped forms.
    ///
    /// ORGANIZATION surveys additionally get an escrow wrap and sealed
    /// escrow shares; INDIVIDUAL surveys never do. Survey, record, shares
    /// and audit entries commit together.
    ///
    /// # Errors
    ///
    /// - [`FieldError::Conflict`] if the survey already has a key record.
    /// - [`FieldError::Survey`] if the tier may no longer change.
    pub async fn provision(
        &self,
        actor: &Actor,
        survey_id: &str,
        tier: Tier,
        credential: Zeroizing<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<SurveyKeyRecord, FieldError> {
        if self.db.read(|c| db::keys::get_key_record(c, survey_id))?.is_some() {
            return Err(FieldError::Conflict(format!("survey {survey_id} is already provisioned")));
        }
        if credential.is_empty() {
            return Err(KdfError::EmptySecret.into());
        }

        let grant = match tier {
            Tier::Organization => Some(self.escrow.prepare_grant(survey_id).await?),
            Tier::Individual => None,
        };

        let derivation = KekDerivation::fresh(self.kdf_params);
        let kek = {
            let derivation = derivation.clone();
            tokio::task::spawn_blocking(move || derivation.derive(&credential))
                .await
                .map_err(|e| FieldError::Task(e.to_string()))??
        };

        let dek = Dek::generate();
        let wrap_version = 1;
        let record = SurveyKeyRecord {
            survey_id: survey_id.to_owned(),
            wrapped_dek: wrap_dek(&dek, &kek, WrapContext::new(survey_id, wrap_version)).map_err(wrap_err)?,
            wrap_version,
            kek_derivation: derivation,
            escrow_wrapped_dek: grant
                .as_ref()
                .map(|g| wrap_dek(&dek, &g.escrow_kek, WrapContext::escrow(survey_id)))
                .transpose()
                .map_err(wrap_err)?,
            created_at: now,
        };
        drop(dek);

        self.db.write(|tx| {
            survey::register_survey(tx, survey_id, tier, now)?;
            db::keys::insert_key_record(tx, &record)?;
            Auditor::record_tx(
                tx,
                AuditEvent::success(&actor.id, AuditAction::SurveyProvisioned, survey_id, now)
                    .with_detail(tier.as_str()),
            )?;
            if let Some(grant) = &grant {
                for share in &grant.shares {
                    db::keys::insert_escrow_share(tx, share)?;
                }
                Auditor::record_tx(
                    tx,
                    AuditEvent::success(&actor.id, AuditAction::EscrowGranted, survey_id, now)
                        .with_detail(format!(
                            "threshold {} of {}",
                            self.escrow.threshold(),
                            grant.shares.len()
                        )),
                )?;
            }
            Ok::<_, FieldError>(())
        })?;
        info!(survey_id, tier = tier.as_str(), "survey keys provisioned");
        Ok(record)
    }

    /// Unwrap the survey DEK. Success and failure are both audited.
    ///
    /// Runs Argon2 for [`KeyAccess::Credential`]; call from a blocking context.
    pub fn open(
        &self,
        actor: &Actor,
        survey_id: &str,
        access: KeyAccess<'_>,
        now: DateTime<Utc>,
    ) -> Result<SurveyKeySession, FieldError> {
        let survey = self
            .db
            .read(|c| db::keys::get_survey(c, survey_id))?
            .ok_or_else(|| FieldError::NotFound(format!("survey {survey_id}")))?;
        let record = self
            .db
            .read(|c| db::keys::get_key_record(c, survey_id))?
            .ok_or_else(|| FieldError::NotFound(format!("key record for survey {survey_id}")))?;

        let label = access.label();
        let unwrapped = match access {
            KeyAccess::Credential(secret) => {
                let kek = record.kek_derivation.derive(secret)?;
                unwrap_dek(&record.wrapped_dek, &kek, record.owner_context())
            }
            KeyAccess::Kek(kek) => unwrap_dek(&record.wrapped_dek, kek, record.owner_context()),
            KeyAccess::Escrow(escrow_kek) => {
                let wrapped = match (&survey.tier, &record.escrow_wrapped_dek) {
                    (Tier::Organization, Some(w)) => w,
                    _ => {
                        return Err(FieldError::PolicyViolation(format!(
                            "survey {survey_id} has no escrow access"
                        )))
                    }
                };
                unwrap_dek(wrapped, escrow_kek, record.escrow_context())
            }
        };

        let audit = AuditEvent::success(&actor.id, AuditAction::DekUnwrap, survey_id, now);
        match unwrapped {
            Ok(dek) => {
                self.auditor.record(audit.with_detail(label))?;
                debug!(survey_id, access = label, "survey key unwrapped");
                Ok(SurveyKeySession {
                    survey_id: survey_id.to_owned(),
                    tier: survey.tier,
                    dek,
                })
            }
            Err(err) => {
                self.auditor.record(
                    audit
                        .with_outcome(Outcome::Failure)
                        .with_detail(format!("{label}: {err}")),
                )?;
                warn!(survey_id, access = label, "survey key unwrap failed");
                Err(match err {
                    WrapError::Integrity | WrapError::InvalidFormat => FieldError::Integrity {
                        unrecoverable: survey.tier == Tier::Individual,
                    },
                    WrapError::Cipher(c) => FieldError::Cipher(c),
                })
            }
        }
    }

    /// Encrypt one field with the owner's credential.
    pub fn encrypt_field(
        &self,
        actor: &Actor,
        credential: &[u8],
        ctx: &FieldContext<'_>,
        plaintext: &[u8],
        now: DateTime<Utc>,
    ) -> Result<String, FieldError> {
        self.open(actor, ctx.survey_id, KeyAccess::Credential(credential), now)?
            .encrypt(ctx, plaintext)
    }

    /// Decrypt one field with the owner's credential.
    pub fn decrypt_field(
        &self,
        actor: &Actor,
        credential: &[u8],
        ctx: &FieldContext<'_>,
        blob: &str,
        now: DateTime<Utc>,
    ) -> Result<Zeroizing<Vec<u8>>, FieldError> {
        self.open(actor, ctx.survey_id, KeyAccess::Credential(credential), now)?
            .decrypt(ctx, blob)
    }
}

fn wrap_err(err: WrapError) -> FieldError {
    match err {
        WrapError::Cipher(c) => FieldError::Cipher(c),
        _ => FieldError::Integrity { unrecoverable: false },
    }
}
