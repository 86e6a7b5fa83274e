//! Request, response, and event types exchanged between components.
//!
//! These types are serialised as JSON over the public HTTPS API and in the
//! recovery lifecycle events handed to the notification collaborator.
//!
//! Bodies that carry a credential implement `Debug` by hand so the credential
//! never reaches a log line.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Surveys
// ---------------------------------------------------------------------------

/// Protection tier of a survey. Immutable once responses exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    /// Zero-knowledge: only the user's credential can unwrap the survey key.
    Individual,
    /// Escrowed: the survey key can be recovered through the recovery workflow.
    Organization,
}

impl Tier {
    /// Stable string form used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Individual => "INDIVIDUAL",
            Tier::Organization => "ORGANIZATION",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INDIVIDUAL" => Some(Tier::Individual),
            "ORGANIZATION" => Some(Tier::Organization),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body for `POST /surveys`.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProvisionSurveyRequest {
    pub survey_id: String,
    pub tier: Tier,
    /// Secret the survey owner unlocks the survey key with.
    pub credential: String,
}

impl fmt::Debug for ProvisionSurveyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionSurveyRequest")
            .field("survey_id", &self.survey_id)
            .field("tier", &self.tier)
            .field("credential", &"[REDACTED]")
            .finish()
    }
}

/// Response body for `POST /surveys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionSurveyResponse {
    pub survey_id: String,
    pub tier: Tier,
    pub wrap_version: u32,
    /// `true` when escrow material was created (ORGANIZATION tier).
    pub escrowed: bool,
}

// ---------------------------------------------------------------------------
// Field encryption
// ---------------------------------------------------------------------------

/// Request body for `POST /surveys/:id/fields/encrypt`.
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptFieldRequest {
    pub credential: String,
    pub response_id: String,
    pub field_id: String,
    pub plaintext: String,
}

impl fmt::Debug for EncryptFieldRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptFieldRequest")
            .field("response_id", &self.response_id)
            .field("field_id", &self.field_id)
            .finish_non_exhaustive()
    }
}

/// Response body for `POST /surveys/:id/fields/encrypt`.
///
/// `ciphertext` is a `v1.<nonce>.<ciphertext+tag>` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptFieldResponse {
    pub ciphertext: String,
}

/// Request body for `POST /surveys/:id/fields/decrypt`.
#[derive(Clone, Serialize, Deserialize)]
pub struct DecryptFieldRequest {
    pub credential: String,
    pub response_id: String,
    pub field_id: String,
    pub ciphertext: String,
}

impl fmt::Debug for DecryptFieldRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptFieldRequest")
            .field("response_id", &self.response_id)
            .field("field_id", &self.field_id)
            .finish_non_exhaustive()
    }
}

/// Response body for `POST /surveys/:id/fields/decrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptFieldResponse {
    pub plaintext: String,
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Request body for `POST /surveys/:id/recovery`.
#[derive(Clone, Serialize, Deserialize)]
pub struct CreateRecoveryRequest {
    /// Credential the survey key will be re-wrapped under once recovery completes.
    pub new_credential: String,
}

impl fmt::Debug for CreateRecoveryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CreateRecoveryRequest { new_credential: [REDACTED] }")
    }
}

/// Request body for `POST /recovery/:id/reject`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectRecoveryRequest {
    pub reason: String,
}

/// Public view of a recovery request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRequestView {
    pub id: Uuid,
    pub survey_id: String,
    pub requested_by: String,
    /// One of `REQUESTED`, `APPROVED`, `REJECTED`, `CANCELLED`, `COMPLETED`, `FAILED`.
    pub state: String,
    pub requested_at: DateTime<Utc>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub scheduled_execution_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub failure_reason: Option<String>,
}

/// Kind of lifecycle event emitted to the notification collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryEventKind {
    #[serde(rename = "recovery.completed")]
    Completed,
    #[serde(rename = "recovery.rejected")]
    Rejected,
}

impl RecoveryEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryEventKind::Completed => "recovery.completed",
            RecoveryEventKind::Rejected => "recovery.rejected",
        }
    }
}

/// Recovery lifecycle event. Never carries key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub event_id: Uuid,
    pub kind: RecoveryEventKind,
    pub request_id: Uuid,
    pub survey_id: String,
    /// Opaque identifier of the requesting user.
    pub requested_by: String,
    /// Opaque identifier of the reviewer, when one acted.
    pub reviewed_by: Option<String>,
    /// Rejection reason surfaced to the requester.
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Escrow ceremony
// ---------------------------------------------------------------------------

/// Request body for `POST /escrow/ceremony`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitCeremonyRequest {
    pub custodians: Vec<String>,
    pub threshold: u8,
}

/// A share handed to exactly one custodian.
#[derive(Clone, Serialize, Deserialize)]
pub struct CustodianShare {
    pub custodian: String,
    pub share: String,
}

impl fmt::Debug for CustodianShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustodianShare")
            .field("custodian", &self.custodian)
            .field("share", &"[REDACTED]")
            .finish()
    }
}

/// Response body for `POST /escrow/ceremony`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitCeremonyResponse {
    pub threshold: u8,
    pub shares: Vec<CustodianShare>,
}

/// Response body for `POST /escrow/unseal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealSessionResponse {
    pub session_id: Uuid,
    pub threshold: u8,
    pub expires_at: DateTime<Utc>,
}

/// Request body for `POST /escrow/unseal/:session/shares`.
#[derive(Clone, Serialize, Deserialize)]
pub struct PresentShareRequest {
    pub share: String,
}

impl fmt::Debug for PresentShareRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresentShareRequest { share: [REDACTED] }")
    }
}

/// Response body for `POST /escrow/unseal/:session/shares`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealProgress {
    pub session_id: Uuid,
    pub presented: usize,
    pub threshold: u8,
    /// `true` once the secret store accepted the reconstructed master key.
    pub unsealed: bool,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::ServiceError> for ErrorResponse {
    fn from(err: &crate::ServiceError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether the relational store answered a probe query.
    pub database_ready: bool,
    /// Whether the split-knowledge ceremony has been performed.
    pub platform_initialised: bool,
}
