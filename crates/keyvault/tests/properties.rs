//! Property tests for the primitives and the recovery timing rule.

use std::collections::HashSet;

use chrono::{Duration, TimeZone, Utc};
use keyvault::crypto::{self, derive_kek, CipherError, Dek, KdfParams, KeyMaterial, Salt, Sealed};
use keyvault::dek::{unwrap_dek, wrap_dek, WrapContext};
use keyvault::escrow::shamir;
use keyvault::recovery::{RecoveryState, TransitionError};
use proptest::prelude::*;

fn cheap() -> KdfParams {
    KdfParams::new(64, 1, 1)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn seal_open_round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..512), aad in proptest::collection::vec(any::<u8>(), 0..64)) {
        let key = KeyMaterial::generate();
        let sealed = crypto::seal(&key, &plaintext, &aad).unwrap();
        prop_assert_eq!(crypto::open(&key, &sealed, &aad).unwrap(), plaintext.clone());

        let parsed = Sealed::parse(&sealed.to_string_repr()).unwrap();
        prop_assert_eq!(crypto::open(&key, &parsed, &aad).unwrap(), plaintext);
    }

    #[test]
    fn any_bit_flip_fails_closed(
        plaintext in proptest::collection::vec(any::<u8>(), 1..128),
        target in 0usize..4,
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let key = KeyMaterial::generate();
        let aad = b"survey/response/field".to_vec();
        let mut sealed = crypto::seal(&key, &plaintext, &aad).unwrap();
        let mut aad_used = aad.clone();
        let flip = 1u8 << bit;
        match target {
            0 => { let i = position.index(sealed.ciphertext.len()); sealed.ciphertext[i] ^= flip; }
            1 => { let i = position.index(sealed.nonce.len()); sealed.nonce[i] ^= flip; }
            2 => { let i = position.index(sealed.tag.len()); sealed.tag[i] ^= flip; }
            _ => { let i = position.index(aad_used.len()); aad_used[i] ^= flip; }
        }
        prop_assert!(matches!(crypto::open(&key, &sealed, &aad_used), Err(CipherError::Integrity)));
    }

    #[test]
    fn wrapped_dek_is_bound_to_survey_and_version(version in 1u32..1000, other in 1u32..1000) {
        prop_assume!(version != other);
        let dek = Dek::generate();
        let kek = derive_kek(b"owner secret", &Salt::generate(), &cheap()).unwrap();
        let wrapped = wrap_dek(&dek, &kek, WrapContext::new("s1", version)).unwrap();
        prop_assert!(unwrap_dek(&wrapped, &kek, WrapContext::new("s1", version)).is_ok());
        prop_assert!(unwrap_dek(&wrapped, &kek, WrapContext::new("s1", other)).is_err());
        prop_assert!(unwrap_dek(&wrapped, &kek, WrapContext::new("s2", version)).is_err());
    }

    #[test]
    fn shamir_any_threshold_subset_reconstructs(n in 2u8..8, t_off in 0u8..6, secret in proptest::array::uniform32(any::<u8>())) {
        let t = 1 + t_off % n;
        let key = KeyMaterial::from_slice(&secret).unwrap();
        let shares = shamir::split(&key, n, t).unwrap();
        prop_assert_eq!(shares.len(), usize::from(n));

        let subset: Vec<_> = shares.iter().rev().take(usize::from(t)).cloned().collect();
        let rebuilt = shamir::reconstruct(&subset).unwrap();
        let probe = crypto::seal(&rebuilt, b"probe", b"").unwrap();
        prop_assert_eq!(crypto::open(&key, &probe, b"").unwrap(), b"probe".to_vec());

        if t > 1 {
            let short: Vec<_> = shares.iter().take(usize::from(t - 1)).cloned().collect();
            prop_assert!(shamir::reconstruct(&short).is_err());
        }
    }

    #[test]
    fn completion_never_precedes_schedule(cooling_secs in 1i64..10_000_000, offset_secs in -10_000_000i64..10_000_000) {
        let approved_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let cooling_off = Duration::seconds(cooling_secs);
        let approved = RecoveryState::Requested.approve("reviewer", approved_at, cooling_off).unwrap();
        let scheduled = approved_at + cooling_off;

        let now = approved_at + Duration::seconds(offset_secs);
        match approved.complete(now) {
            Ok(state) => {
                prop_assert!(now >= scheduled);
                prop_assert_eq!(state.name(), "COMPLETED");
            }
            Err(err) => {
                prop_assert!(now < scheduled);
                let too_early = matches!(err, TransitionError::NotYetDue { .. });
                prop_assert!(too_early);
            }
        }
    }
}

#[test]
fn nonces_never_repeat_under_one_key() {
    let key = KeyMaterial::generate();
    let mut seen = HashSet::new();
    for _ in 0..20_000 {
        let sealed = crypto::seal(&key, b"same plaintext", b"same aad").unwrap();
        assert!(seen.insert(sealed.nonce), "nonce reused");
    }
}

#[test]
fn kdf_is_deterministic_and_input_sensitive() {
    let salt = Salt::generate();
    let params = cheap();
    let kek = derive_kek(b"secret", &salt, &params).unwrap();
    let dek = Dek::generate();
    let ctx = || WrapContext::new("s1", 1);
    let wrapped = wrap_dek(&dek, &kek, ctx()).unwrap();

    let same = derive_kek(b"secret", &salt, &params).unwrap();
    assert!(unwrap_dek(&wrapped, &same, ctx()).is_ok());

    let variants = [
        derive_kek(b"secret!", &salt, &params).unwrap(),
        derive_kek(b"secret", &Salt::generate(), &params).unwrap(),
        derive_kek(b"secret", &salt, &KdfParams::new(128, 1, 1)).unwrap(),
        derive_kek(b"secret", &salt, &KdfParams::new(64, 2, 1)).unwrap(),
    ];
    for kek in &variants {
        assert!(unwrap_dek(&wrapped, kek, ctx()).is_err());
    }
}
