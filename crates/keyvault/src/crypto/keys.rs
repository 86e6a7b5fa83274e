//! Fixed-size key buffers and the typed keys built on them.
//!
//! Each role (DEK, KEK, escrow KEK, custodian key, platform master key) gets
//! its own newtype so a key can only be passed where its role is expected.

use std::fmt;

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use thiserror::Error;
use zeroize::Zeroize;

use super::cipher::KEY_LEN;

/// Errors produced when importing raw key bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The key material has an unexpected length.
    #[error("key has invalid length: expected {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// The buffer is boxed so moves never leave stray copies on the stack, and
/// it is wiped when dropped.
#[derive(Clone)]
pub struct KeyMaterial(Box<[u8; KEY_LEN]>);

impl KeyMaterial {
    /// Draw fresh key material from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut buf = Box::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(buf.as_mut_slice());
        Self(buf)
    }

    /// Copy key material out of a slice.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidLength`] if the slice has the wrong length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidLength(bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub(crate) fn from_array(bytes: [u8; KEY_LEN]) -> Self {
        Self(Box::new(bytes))
    }

    /// Borrow the raw bytes. Callers must not copy them into unmanaged buffers.
    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        (*self.0).zeroize();
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("KeyMaterial([REDACTED])")
    }
}

macro_rules! typed_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(KeyMaterial);

        impl $name {
            /// Generate a fresh random key.
            pub fn generate() -> Self {
                Self(KeyMaterial::generate())
            }

            /// Import a key from raw bytes.
            ///
            /// # Errors
            ///
            /// Returns [`KeyError::InvalidLength`] if `bytes` is not [`KEY_LEN`] long.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
                KeyMaterial::from_slice(bytes).map(Self)
            }

            pub(crate) fn from_material(material: KeyMaterial) -> Self {
                Self(material)
            }

            pub(crate) fn material(&self) -> &KeyMaterial {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "([REDACTED])"))
            }
        }
    };
}

typed_key!(
    /// Per-survey Data Encryption Key. Encrypts response fields; never persisted in plaintext.
    Dek
);
typed_key!(
    /// Key Encryption Key derived from a user credential. Only wraps DEKs.
    Kek
);
typed_key!(
    /// Per-survey escrow key for ORGANIZATION-tier surveys, split across custodians.
    EscrowKek
);
typed_key!(
    /// A custodian's share-wrapping key, held by the secret store.
    CustodianKey
);
typed_key!(
    /// The platform master key reconstructed during an unseal ceremony.
    MasterKey
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let a = KeyMaterial::generate();
        let b = KeyMaterial::generate();
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(
            KeyMaterial::from_slice(&[0u8; 16]).unwrap_err(),
            KeyError::InvalidLength(16)
        );
        assert!(Dek::from_slice(&[0u8; 33]).is_err());
        assert!(Kek::from_slice(&[7u8; KEY_LEN]).is_ok());
    }

    #[test]
    fn typed_keys_redacted_in_debug() {
        let dek = Dek::from_slice(&[0xFFu8; KEY_LEN]).unwrap();
        let dbg = format!("{dek:?}");
        assert_eq!(dbg, "Dek([REDACTED])");
        assert!(format!("{:?}", MasterKey::generate()).contains("REDACTED"));
    }
}
