//! Wrapping and unwrapping of survey DEKs under a key-encryption key.
//!
//! Wrapping is AEAD encryption of the DEK bytes with the wrapping key. The
//! survey id, the wrap purpose and the wrap version are bound as AAD, so a
//! wrapped DEK copied onto another survey or version never unwraps.

use thiserror::Error;

use crate::crypto::{self, CipherError, Dek, EscrowKek, KeyMaterial, Kek, Sealed};

/// Errors produced by the wrapping service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WrapError {
    /// Tag verification failed. The wrapping key is wrong or the blob was tampered with.
    #[error("wrapped DEK failed verification")]
    Integrity,

    /// The persisted blob is not a valid wrapped DEK encoding.
    #[error("wrapped DEK has an invalid encoding")]
    InvalidFormat,

    /// Encryption failed inside the cipher layer.
    #[error("wrap failed: {0}")]
    Cipher(CipherError),
}

impl From<CipherError> for WrapError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::Integrity => WrapError::Integrity,
            CipherError::InvalidFormat => WrapError::InvalidFormat,
            other => WrapError::Cipher(other),
        }
    }
}

/// A key that may wrap DEKs.
pub trait WrappingKey {
    /// Label bound into the AAD so owner and escrow wraps are not interchangeable.
    const PURPOSE: &'static str;

    fn key_material(&self) -> &KeyMaterial;
}

impl WrappingKey for Kek {
    const PURPOSE: &'static str = "owner";

    fn key_material(&self) -> &KeyMaterial {
        self.material()
    }
}

impl WrappingKey for EscrowKek {
    const PURPOSE: &'static str = "escrow";

    fn key_material(&self) -> &KeyMaterial {
        self.material()
    }
}

/// Identity of the wrap, bound as AAD.
#[derive(Debug, Clone, Copy)]
pub struct WrapContext<'a> {
    pub survey_id: &'a str,
    pub wrap_version: u32,
}

impl<'a> WrapContext<'a> {
    pub fn new(survey_id: &'a str, wrap_version: u32) -> Self {
        Self {
            survey_id,
            wrap_version,
        }
    }

    /// Escrow wraps survive owner re-wraps, so they are not versioned.
    pub fn escrow(survey_id: &'a str) -> Self {
        Self::new(survey_id, 0)
    }

    fn aad(&self, purpose: &str) -> Vec<u8> {
        format!(
            "keyvault/dek/{purpose}/{}/{}",
            self.wrap_version, self.survey_id
        )
        .into_bytes()
    }
}

/// A DEK encrypted under a wrapping key: `nonce || ciphertext || tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedDek(Sealed);

impl WrappedDek {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    /// # Errors
    ///
    /// Returns [`WrapError::InvalidFormat`] if `bytes` is not a sealed blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WrapError> {
        Sealed::from_bytes(bytes)
            .map(Self)
            .map_err(|_| WrapError::InvalidFormat)
    }
}

/// Wrap `dek` under `key`.
///
/// # Errors
///
/// Returns [`WrapError::Cipher`] if the cipher layer fails.
pub fn wrap_dek<K: WrappingKey>(
    dek: &Dek,
    key: &K,
    ctx: WrapContext<'_>,
) -> Result<WrappedDek, WrapError> {
    let sealed = crypto::seal(
        key.key_material(),
        dek.material().expose(),
        &ctx.aad(K::PURPOSE),
    )?;
    Ok(WrappedDek(sealed))
}

/// Unwrap a DEK. Possession of the correct key is necessary and sufficient.
///
/// # Errors
///
/// Returns [`WrapError::Integrity`] on any verification failure; no partial
/// key is ever returned.
pub fn unwrap_dek<K: WrappingKey>(
    wrapped: &WrappedDek,
    key: &K,
    ctx: WrapContext<'_>,
) -> Result<Dek, WrapError> {
    let plaintext = zeroize::Zeroizing::new(crypto::open(
        key.key_material(),
        &wrapped.0,
        &ctx.aad(K::PURPOSE),
    )?);
    KeyMaterial::from_slice(&plaintext)
        .map(Dek::from_material)
        .map_err(|_| WrapError::Integrity)
}
