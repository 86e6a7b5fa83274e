//! Common error types shared across crates.

use thiserror::Error;

/// Top-level service error type.
///
/// The first four variants after [`ServiceError::BadRequest`] are the
/// subsystem's failure taxonomy; the rest are transport-level. Each maps to
/// an HTTP status returned to callers:
/// - [`ServiceError::BadRequest`] → 400
/// - [`ServiceError::Integrity`] → 422
/// - [`ServiceError::NotFound`] → 404
/// - [`ServiceError::TransientInfra`] → 503
/// - [`ServiceError::PolicyViolation`] → 422
/// - [`ServiceError::Forbidden`] → 403
/// - [`ServiceError::Conflict`] → 409
/// - [`ServiceError::Unavailable`] → 503
/// - [`ServiceError::Internal`] → 500
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was malformed: missing header, bad JSON, empty field.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// AEAD tag verification failed: wrong key or tampered ciphertext.
    ///
    /// `unrecoverable` is set when no recovery path exists for the data
    /// (zero-knowledge tier), so callers can surface it as permanent loss.
    #[error("integrity check failed: {message}")]
    Integrity { message: String, unrecoverable: bool },

    /// A required record or secret is missing. Never an empty default.
    #[error("not found: {0}")]
    NotFound(String),

    /// The secret store or database is temporarily unavailable.
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    /// The operation is forbidden by policy (e.g. recovery on a zero-knowledge survey).
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// The caller is not allowed to perform this action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The operation conflicts with the current state of the resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A required component (e.g. the secret store session) is not available.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::Integrity { .. } => 422,
            ServiceError::NotFound(_) => 404,
            ServiceError::TransientInfra(_) => 503,
            ServiceError::PolicyViolation(_) => 422,
            ServiceError::Forbidden(_) => 403,
            ServiceError::Conflict(_) => 409,
            ServiceError::Unavailable(_) => 503,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Short machine-readable code used in [`crate::protocol::ErrorResponse`].
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::Integrity {
                unrecoverable: true,
                ..
            } => "unrecoverable_data",
            ServiceError::Integrity { .. } => "integrity_error",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::TransientInfra(_) => "transient_infra",
            ServiceError::PolicyViolation(_) => "policy_violation",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Unavailable(_) => "service_unavailable",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    /// Convenience constructor for a recoverable integrity failure.
    pub fn integrity(message: impl Into<String>) -> Self {
        ServiceError::Integrity {
            message: message.into(),
            unrecoverable: false,
        }
    }
}
