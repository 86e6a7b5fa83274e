//! AES-256-GCM-SIV authenticated encryption with associated data.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant,
//! so even a CSPRNG collision degrades to leaking plaintext equality rather
//! than the key stream.
//!
//! Nonces are generated exclusively inside [`seal`]. No function in this
//! module accepts a caller-supplied nonce.

use aes_gcm_siv::{
    aead::{generic_array::GenericArray, rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;
use zeroize::Zeroizing;

use super::keys::KeyMaterial;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag.
pub const TAG_LEN: usize = 16;

/// Prefix that appears at the start of every encrypted field value.
pub const VERSION_PREFIX: &str = "v1";

/// Errors produced by the cipher layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Key material is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Tag verification failed: wrong key, wrong AAD, or tampered data.
    #[error("integrity check failed")]
    Integrity,

    /// Encryption itself failed (unreachable with a valid key).
    #[error("aead encryption failed")]
    AeadFailure,

    /// The encoded value does not match the expected structure.
    #[error("invalid ciphertext format")]
    InvalidFormat,
}

/// Output of one AEAD encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Detached authentication tag.
    pub tag: [u8; TAG_LEN],
}

impl Sealed {
    /// Binary encoding: `nonce || ciphertext || tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Decode the binary form produced by [`Sealed::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if `bytes` is too short.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let (nonce_bytes, rest) = bytes.split_at(NONCE_LEN);
        let (ciphertext, tag_bytes) = rest.split_at(rest.len() - TAG_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(tag_bytes);
        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
            tag,
        })
    }

    /// Encode to the canonical field string:
    /// `v1.<base64url-no-pad(nonce)>.<base64url-no-pad(ciphertext+tag)>`.
    pub fn to_string_repr(&self) -> String {
        let mut body = Vec::with_capacity(self.ciphertext.len() + TAG_LEN);
        body.extend_from_slice(&self.ciphertext);
        body.extend_from_slice(&self.tag);
        format!(
            "{}.{}.{}",
            VERSION_PREFIX,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(body),
        )
    }

    /// Parse a field string back into a [`Sealed`] value.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if the string does not match the
    /// expected `v1.<nonce>.<ciphertext+tag>` structure.
    pub fn parse(s: &str) -> Result<Self, CipherError> {
        let parts: Vec<&str> = s.splitn(3, '.').collect();
        if parts.len() != 3 || parts[0] != VERSION_PREFIX {
            return Err(CipherError::InvalidFormat);
        }
        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|_| CipherError::InvalidFormat)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let body = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| CipherError::InvalidFormat)?;
        if body.len() < TAG_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let (ciphertext, tag_bytes) = body.split_at(body.len() - TAG_LEN);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&nonce_bytes);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(tag_bytes);
        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
            tag,
        })
    }
}

/// Encrypt `plaintext` under `key`, binding `aad` into the tag.
///
/// A fresh 96-bit nonce is drawn from the OS CSPRNG on every call.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] on an internal AEAD error.
pub fn seal(key: &KeyMaterial, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CipherError> {
    let cipher = build_cipher(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|_| CipherError::AeadFailure)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok(Sealed {
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypt and verify a [`Sealed`] value.
///
/// On any verification failure the working buffer is wiped and
/// [`CipherError::Integrity`] is returned; no partial plaintext escapes.
///
/// # Errors
///
/// Returns [`CipherError::Integrity`] if the key, AAD, nonce, ciphertext or
/// tag do not match.
pub fn open(key: &KeyMaterial, sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            aad,
            buffer.as_mut_slice(),
            GenericArray::from_slice(&sealed.tag),
        )
        .map_err(|_| CipherError::Integrity)?;
    Ok(std::mem::take(&mut *buffer))
}

fn build_cipher(key: &KeyMaterial) -> Result<Aes256GcmSiv, CipherError> {
    Aes256GcmSiv::new_from_slice(key.expose())
        .map_err(|_| CipherError::InvalidKeyLength(key.expose().len()))
}
