//! Cryptographic primitives: AEAD, typed keys, and the credential KDF.
//!
//! This module is intentionally free of storage, network, and HTTP
//! dependencies. It holds no state.
//!
//! # Ciphertext format
//!
//! ```text
//! v1.<base64url-no-pad(nonce)>.<base64url-no-pad(ciphertext+tag)>
//! ```
//!
//! The `v1` prefix enables future algorithm or key-version migration without
//! breaking existing ciphertext.

pub mod cipher;
pub mod kdf;
pub mod keys;

pub use cipher::{open, seal, CipherError, Sealed, KEY_LEN};
pub use kdf::{derive_kek, KdfError, KdfParams, KekDerivation, Salt};
pub use keys::{CustodianKey, Dek, EscrowKek, KeyError, KeyMaterial, Kek, MasterKey};
