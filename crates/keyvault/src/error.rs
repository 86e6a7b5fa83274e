//! Mapping of module errors onto the service taxonomy.
//!
//! Messages of internal failures are logged here and replaced with a
//! generic text so store paths and SQL never reach a caller.

use common::ServiceError;
use tracing::error;

use crate::audit::AuditError;
use crate::crypto::KdfError;
use crate::db::StoreError;
use crate::escrow::{EscrowError, ShamirError};
use crate::field::FieldError;
use crate::processor::ProcessorError;
use crate::recovery::{RecoveryError, TransitionError};
use crate::secret_store::SecretStoreError;
use crate::survey::SurveyError;

fn internal(context: &str, err: &dyn std::fmt::Display) -> ServiceError {
    error!(error = %err, context, "internal error");
    ServiceError::Internal(format!("{context} failed"))
}

fn store(err: StoreError) -> ServiceError {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) =>
        {
            ServiceError::TransientInfra("database is busy".into())
        }
        other => internal("database", &other),
    }
}

fn audit(err: AuditError) -> ServiceError {
    match err {
        AuditError::Store(e) => store(e),
        other => internal("audit log", &other),
    }
}

fn kdf(err: KdfError) -> ServiceError {
    match err {
        KdfError::EmptySecret => ServiceError::BadRequest(err.to_string()),
        other => internal("key derivation", &other),
    }
}

pub fn secret_store(err: SecretStoreError) -> ServiceError {
    match err {
        SecretStoreError::NotFound { path } => ServiceError::NotFound(format!("secret {path}")),
        SecretStoreError::Conflict { path } => ServiceError::Conflict(format!("secret {path} already exists")),
        SecretStoreError::Transient(m) => ServiceError::TransientInfra(m),
        SecretStoreError::SessionExpired => ServiceError::Unavailable("master key session expired".into()),
        SecretStoreError::Auth(m) => {
            error!(error = %m, "secret store rejected our credentials");
            ServiceError::Unavailable("secret store authentication failed".into())
        }
        other @ SecretStoreError::Protocol(_) => internal("secret store", &other),
    }
}

fn transition(err: TransitionError) -> ServiceError {
    match err {
        TransitionError::MissingReason => ServiceError::BadRequest(err.to_string()),
        TransitionError::ScheduleOutOfRange { .. } => internal("recovery scheduling", &err),
        other => ServiceError::Conflict(other.to_string()),
    }
}

impl From<FieldError> for ServiceError {
    fn from(err: FieldError) -> Self {
        match err {
            FieldError::NotFound(m) => ServiceError::NotFound(m),
            FieldError::Integrity { unrecoverable } => ServiceError::Integrity {
                message: if unrecoverable {
                    "data is permanently unreadable without the original credential".into()
                } else {
                    "wrong credential or tampered data".into()
                },
                unrecoverable,
            },
            FieldError::PolicyViolation(m) => ServiceError::PolicyViolation(m),
            FieldError::Conflict(m) => ServiceError::Conflict(m),
            FieldError::InvalidCiphertext | FieldError::SurveyMismatch { .. } => {
                ServiceError::BadRequest(err.to_string())
            }
            FieldError::Survey(e) => e.into(),
            FieldError::Kdf(e) => kdf(e),
            FieldError::Escrow(e) => e.into(),
            FieldError::Store(e) => store(e),
            FieldError::Audit(e) => audit(e),
            other @ (FieldError::Cipher(_) | FieldError::Task(_)) => internal("field encryption", &other),
        }
    }
}

impl From<SurveyError> for ServiceError {
    fn from(err: SurveyError) -> Self {
        match err {
            SurveyError::PolicyViolation(m) => ServiceError::PolicyViolation(m),
            SurveyError::NotFound(m) => ServiceError::NotFound(m),
            SurveyError::Forbidden(m) => ServiceError::Forbidden(m),
            SurveyError::InvalidId(_) => ServiceError::BadRequest(err.to_string()),
            SurveyError::Store(e) => store(e),
            SurveyError::Audit(e) => audit(e),
        }
    }
}

impl From<RecoveryError> for ServiceError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::Forbidden(m) => ServiceError::Forbidden(m),
            RecoveryError::PolicyViolation(m) => ServiceError::PolicyViolation(m),
            RecoveryError::NotFound(m) => ServiceError::NotFound(m),
            RecoveryError::Conflict(m) => ServiceError::Conflict(m),
            RecoveryError::Transition(e) => transition(e),
            RecoveryError::Kdf(e) => kdf(e),
            RecoveryError::SecretStore(e) => secret_store(e),
            RecoveryError::Store(e) => store(e),
            RecoveryError::Audit(e) => audit(e),
            other @ RecoveryError::Task(_) => internal("recovery", &other),
        }
    }
}

impl From<EscrowError> for ServiceError {
    fn from(err: EscrowError) -> Self {
        match err {
            EscrowError::Shamir(ShamirError::InvalidParams { .. }) | EscrowError::InvalidRoster(_) => {
                ServiceError::BadRequest(err.to_string())
            }
            EscrowError::Shamir(ShamirError::InvalidEncoding) | EscrowError::ShareMismatch(_) => {
                ServiceError::BadRequest(err.to_string())
            }
            EscrowError::UnknownCustodian(_) => ServiceError::Forbidden(err.to_string()),
            EscrowError::SessionNotFound(_) | EscrowError::SessionExpired => {
                ServiceError::NotFound(err.to_string())
            }
            EscrowError::AlreadyPresented(_) | EscrowError::AlreadyInitialised => {
                ServiceError::Conflict(err.to_string())
            }
            EscrowError::NotInitialised => ServiceError::Unavailable(err.to_string()),
            EscrowError::CheckFailed | EscrowError::Integrity(_) | EscrowError::Shamir(_) => {
                ServiceError::integrity(err.to_string())
            }
            EscrowError::SecretStore(e) => secret_store(e),
            EscrowError::Store(e) => store(e),
            EscrowError::Audit(e) => audit(e),
            other @ EscrowError::Poisoned => internal("unseal session registry", &other),
        }
    }
}

impl From<ProcessorError> for ServiceError {
    fn from(err: ProcessorError) -> Self {
        match err {
            ProcessorError::Store(e) => store(e),
            ProcessorError::Audit(e) => audit(e),
            ProcessorError::Transition(e) => transition(e),
            other => ServiceError::Conflict(other.to_string()),
        }
    }
}
