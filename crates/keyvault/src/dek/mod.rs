//! Survey DEK lifecycle: wrapping under KEKs and the persisted key record.
//!
//! # Lifecycle
//!
//! 1. When a survey is provisioned a random DEK is generated and wrapped
//!    under the owner's credential-derived KEK (and, for ORGANIZATION
//!    surveys, under a per-survey escrow KEK).
//! 2. The wrapped forms are persisted as the survey's single active
//!    [`SurveyKeyRecord`].
//! 3. A completed recovery replaces the record with a re-wrap under the new
//!    credential at the next `wrap_version`.
//!
//! # Security invariants
//!
//! - The plaintext DEK is **never** written to disk, logged, or included in traces.
//! - Unwrapping fails closed: a wrong key yields [`WrapError::Integrity`], never a guess.

pub mod wrap;

pub use wrap::{unwrap_dek, wrap_dek, WrapContext, WrapError, WrappedDek, WrappingKey};

use chrono::{DateTime, Utc};

use crate::crypto::KekDerivation;

/// The single active key record of a survey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurveyKeyRecord {
    pub survey_id: String,
    /// DEK wrapped under the owner's KEK.
    pub wrapped_dek: WrappedDek,
    /// Incremented on every owner re-wrap; bound into the wrap AAD.
    pub wrap_version: u32,
    /// Salt and KDF parameters that re-derive the owner's KEK.
    pub kek_derivation: KekDerivation,
    /// DEK wrapped under the survey escrow KEK. `None` on INDIVIDUAL surveys.
    pub escrow_wrapped_dek: Option<WrappedDek>,
    pub created_at: DateTime<Utc>,
}

impl SurveyKeyRecord {
    /// Wrap context for the owner wrap of this record.
    pub fn owner_context(&self) -> WrapContext<'_> {
        WrapContext::new(&self.survey_id, self.wrap_version)
    }

    /// Wrap context for the escrow wrap of this record.
    pub fn escrow_context(&self) -> WrapContext<'_> {
        WrapContext::escrow(&self.survey_id)
    }
}
