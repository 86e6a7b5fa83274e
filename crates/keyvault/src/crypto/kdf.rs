//! Argon2id derivation of Key Encryption Keys from user credentials.
//!
//! Parameters are versioned and persisted with every derivation, so the
//! default cost can be raised later without orphaning existing records.

use std::fmt;

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use super::cipher::KEY_LEN;
use super::keys::{KeyMaterial, Kek};

/// Byte length of a KDF salt.
pub const SALT_LEN: usize = 16;

/// Parameter set version 1: Argon2id, Argon2 version 0x13.
pub const KDF_V1: u16 = 1;

/// Errors produced by the KDF.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KdfError {
    /// The persisted parameter set names a version this build does not know.
    #[error("unsupported KDF parameter version {0}")]
    UnsupportedVersion(u16),

    /// Argon2 rejected the cost parameters or inputs.
    #[error("invalid KDF parameters: {0}")]
    InvalidParams(String),

    /// The salt does not decode to [`SALT_LEN`] bytes.
    #[error("invalid salt encoding")]
    InvalidSalt,

    #[error("credential must not be empty")]
    EmptySecret,
}

/// Versioned Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub version: u16,
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Current-version parameters with the given costs.
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            version: KDF_V1,
            memory_kib,
            iterations,
            parallelism,
        }
    }

    fn hasher(&self) -> Result<Argon2<'static>, KdfError> {
        match self.version {
            KDF_V1 => {
                let params = Params::new(
                    self.memory_kib,
                    self.iterations,
                    self.parallelism,
                    Some(KEY_LEN),
                )
                .map_err(|e| KdfError::InvalidParams(e.to_string()))?;
                Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
            }
            other => Err(KdfError::UnsupportedVersion(other)),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::new(64 * 1024, 3, 1)
    }
}

/// Random per-derivation salt, serialised as standard base64.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    /// Draw a fresh salt from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }
}

impl From<[u8; SALT_LEN]> for Salt {
    fn from(bytes: [u8; SALT_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<String> for Salt {
    type Error = KdfError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = STANDARD.decode(value).map_err(|_| KdfError::InvalidSalt)?;
        let arr: [u8; SALT_LEN] = bytes.try_into().map_err(|_| KdfError::InvalidSalt)?;
        Ok(Self(arr))
    }
}

impl From<Salt> for String {
    fn from(salt: Salt) -> Self {
        STANDARD.encode(salt.0)
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({})", STANDARD.encode(self.0))
    }
}

/// How a survey's KEK is re-derived: the salt and parameters used with the
/// owner's credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekDerivation {
    pub salt: Salt,
    pub params: KdfParams,
}

impl KekDerivation {
    /// A fresh derivation recipe with a new random salt.
    pub fn fresh(params: KdfParams) -> Self {
        Self {
            salt: Salt::generate(),
            params,
        }
    }

    /// Derive the KEK for `secret` under this recipe.
    ///
    /// # Errors
    ///
    /// See [`derive_kek`].
    pub fn derive(&self, secret: &[u8]) -> Result<Kek, KdfError> {
        derive_kek(secret, &self.salt, &self.params)
    }
}

/// Derive a 256-bit KEK from `secret` with Argon2id.
///
/// Deterministic for identical inputs.
///
/// # Errors
///
/// Returns [`KdfError::UnsupportedVersion`] for unknown parameter versions and
/// [`KdfError::InvalidParams`] if Argon2 rejects the costs.
pub fn derive_kek(secret: &[u8], salt: &Salt, params: &KdfParams) -> Result<Kek, KdfError> {
    if secret.is_empty() {
        return Err(KdfError::EmptySecret);
    }
    let hasher = params.hasher()?;
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    hasher
        .hash_password_into(secret, salt.as_bytes(), out.as_mut_slice())
        .map_err(|e| KdfError::InvalidParams(e.to_string()))?;
    Ok(Kek::from_material(KeyMaterial::from_array(*out)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfParams {
        KdfParams::new(64, 1, 1)
    }

    #[test]
    fn derivation_is_deterministic() {
        let salt = Salt::from([1u8; SALT_LEN]);
        let a = derive_kek(b"correct horse", &salt, &cheap()).unwrap();
        let b = derive_kek(b"correct horse", &salt, &cheap()).unwrap();
        assert_eq!(a.material().expose(), b.material().expose());
    }

    #[test]
    fn any_input_change_changes_output() {
        let salt = Salt::from([1u8; SALT_LEN]);
        let base = derive_kek(b"pw", &salt, &cheap()).unwrap();

        let other_secret = derive_kek(b"pw2", &salt, &cheap()).unwrap();
        let other_salt = derive_kek(b"pw", &Salt::from([2u8; SALT_LEN]), &cheap()).unwrap();
        let other_params = derive_kek(b"pw", &salt, &KdfParams::new(64, 2, 1)).unwrap();

        for k in [&other_secret, &other_salt, &other_params] {
            assert_ne!(base.material().expose(), k.material().expose());
        }
    }

    #[test]
    fn unknown_version_rejected() {
        let mut params = cheap();
        params.version = 99;
        assert_eq!(
            derive_kek(b"pw", &Salt::generate(), &params).unwrap_err(),
            KdfError::UnsupportedVersion(99)
        );
    }

    #[test]
    fn derivation_recipe_serde_round_trip() {
        let recipe = KekDerivation::fresh(cheap());
        let json = serde_json::to_string(&recipe).unwrap();
        let back: KekDerivation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, recipe);
    }

    #[test]
    fn bad_salt_encoding_rejected() {
        assert!(Salt::try_from("not base64!".to_string()).is_err());
        assert!(Salt::try_from(STANDARD.encode([0u8; 4])).is_err());
    }
}
