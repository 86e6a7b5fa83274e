//! Byte-wise Shamir secret sharing over GF(2^8) for 256-bit keys.
//!
//! Each byte of the secret is the constant term of its own random
//! polynomial of degree `t - 1`; share `x` holds every polynomial evaluated
//! at `x`. Any `t` shares interpolate the secret at `x = 0`, and fewer
//! reveal nothing about it.

use std::fmt;

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{KeyMaterial, KEY_LEN};

/// Encoding version of a serialised share.
const SHARE_V1: u8 = 1;
const ENCODED_LEN: usize = 3 + KEY_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShamirError {
    #[error("invalid sharing parameters: threshold {threshold} of {shares}")]
    InvalidParams { threshold: u8, shares: u8 },

    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: u8 },

    #[error("share index {0} presented twice")]
    DuplicateIndex(u8),

    #[error("shares disagree on the threshold")]
    MixedThreshold,

    #[error("share encoding is invalid")]
    InvalidEncoding,
}

/// One custodian's share of a 256-bit secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Share {
    threshold: u8,
    index: u8,
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("threshold", &self.threshold)
            .field("index", &self.index)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl Share {
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Binary form: `version || threshold || index || y-bytes`.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(ENCODED_LEN));
        out.extend_from_slice(&[SHARE_V1, self.threshold, self.index]);
        out.extend_from_slice(self.bytes.as_slice());
        out
    }

    /// # Errors
    ///
    /// Returns [`ShamirError::InvalidEncoding`] on a wrong length, unknown
    /// version, or zero index/threshold.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShamirError> {
        if bytes.len() != ENCODED_LEN || bytes[0] != SHARE_V1 {
            return Err(ShamirError::InvalidEncoding);
        }
        let (threshold, index) = (bytes[1], bytes[2]);
        if threshold == 0 || index == 0 {
            return Err(ShamirError::InvalidEncoding);
        }
        let mut y = Zeroizing::new([0u8; KEY_LEN]);
        y.copy_from_slice(&bytes[3..]);
        Ok(Self {
            threshold,
            index,
            bytes: y,
        })
    }

    /// Text form handed to human custodians.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes().as_slice())
    }

    pub fn decode(s: &str) -> Result<Self, ShamirError> {
        let raw = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(s.trim())
                .map_err(|_| ShamirError::InvalidEncoding)?,
        );
        Self::from_bytes(&raw)
    }
}

// ---------------------------------------------------------------------------
// GF(2^8) arithmetic, reduction polynomial x^8 + x^4 + x^3 + x + 1 (0x11b)
// ---------------------------------------------------------------------------

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0u8;
    while b != 0 {
        if b & 1 == 1 {
            p ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    p
}

fn gf_inv(a: u8) -> u8 {
    // a^254 == a^-1 for a != 0.
    let mut result = 1u8;
    let mut base = a;
    let mut exp = 254u8;
    while exp > 0 {
        if exp & 1 == 1 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}

/// Split `secret` into `n` shares, any `t` of which reconstruct it.
///
/// # Errors
///
/// Returns [`ShamirError::InvalidParams`] unless `1 <= t <= n`.
pub fn split(secret: &KeyMaterial, n: u8, t: u8) -> Result<Vec<Share>, ShamirError> {
    if t == 0 || n == 0 || t > n {
        return Err(ShamirError::InvalidParams {
            threshold: t,
            shares: n,
        });
    }
    let secret = secret.expose();
    let t_len = usize::from(t);

    // coeffs[b][0] is the secret byte; the rest are random.
    let mut coeffs = Zeroizing::new(vec![0u8; KEY_LEN * t_len]);
    OsRng.fill_bytes(coeffs.as_mut_slice());
    for (b, byte) in secret.iter().enumerate() {
        coeffs[b * t_len] = *byte;
    }

    let shares = (1..=n)
        .map(|x| {
            let mut y = Zeroizing::new([0u8; KEY_LEN]);
            for (b, out) in y.iter_mut().enumerate() {
                // Horner evaluation from the highest coefficient down.
                let poly = &coeffs[b * t_len..(b + 1) * t_len];
                *out = poly.iter().rev().fold(0u8, |acc, c| gf_mul(acc, x) ^ c);
            }
            Share {
                threshold: t,
                index: x,
                bytes: y,
            }
        })
        .collect();
    Ok(shares)
}

/// Reconstruct the secret from at least `threshold` distinct shares.
///
/// # Errors
///
/// - [`ShamirError::InsufficientShares`] if fewer than the threshold are given.
/// - [`ShamirError::DuplicateIndex`] if an index repeats.
/// - [`ShamirError::MixedThreshold`] if the shares come from different splits.
pub fn reconstruct(shares: &[Share]) -> Result<KeyMaterial, ShamirError> {
    let Some(first) = shares.first() else {
        return Err(ShamirError::InsufficientShares { have: 0, need: 1 });
    };
    let t = first.threshold;
    if shares.iter().any(|s| s.threshold != t) {
        return Err(ShamirError::MixedThreshold);
    }
    let mut seen = [false; 256];
    for s in shares {
        if std::mem::replace(&mut seen[usize::from(s.index)], true) {
            return Err(ShamirError::DuplicateIndex(s.index));
        }
    }
    if shares.len() < usize::from(t) {
        return Err(ShamirError::InsufficientShares {
            have: shares.len(),
            need: t,
        });
    }

    let used = &shares[..usize::from(t)];
    // Lagrange basis at x = 0: l_i = prod_{j != i} x_j / (x_j - x_i).
    let basis: Vec<u8> = used
        .iter()
        .enumerate()
        .map(|(i, si)| {
            let (num, den) = used
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .fold((1u8, 1u8), |(num, den), (_, sj)| {
                    (gf_mul(num, sj.index), gf_mul(den, sj.index ^ si.index))
                });
            gf_mul(num, gf_inv(den))
        })
        .collect();

    let mut secret = Zeroizing::new([0u8; KEY_LEN]);
    for (b, out) in secret.iter_mut().enumerate() {
        *out = used
            .iter()
            .zip(&basis)
            .fold(0u8, |acc, (s, l)| acc ^ gf_mul(s.bytes[b], *l));
    }
    Ok(KeyMaterial::from_array(*secret))
}
