//! HMAC-SHA256 payload signing.
//!
//! The signature is the lowercase hex HMAC of the exact body bytes sent, keyed
//! with the subscription secret.

use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Secret size in bytes before hex encoding.
pub const SECRET_BYTES: usize = 32;

/// Fresh random secret, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign(payload: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a received signature. Length mismatch fails fast; equal lengths are
/// compared in constant time.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let expected = sign(payload, secret);
    if expected.len() != signature.len() {
        return false;
    }
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            sign(b"what do ya want for nothing?", "Jefe"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn secrets_are_random_hex() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), SECRET_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        #[test]
        fn signature_round_trips(payload in prop::collection::vec(any::<u8>(), 0..512), secret in "[0-9a-f]{64}") {
            let signature = sign(&payload, &secret);
            prop_assert!(verify_signature(&payload, &signature, &secret));
        }

        #[test]
        fn mutated_payload_is_rejected(
            payload in prop::collection::vec(any::<u8>(), 1..512),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let secret = generate_secret();
            let signature = sign(&payload, &secret);

            let mut tampered = payload.clone();
            let i = index.index(tampered.len());
            tampered[i] ^= flip;
            prop_assert!(!verify_signature(&tampered, &signature, &secret));
        }

        #[test]
        fn wrong_length_signature_is_rejected(payload in prop::collection::vec(any::<u8>(), 0..128), cut in 1usize..64) {
            let secret = generate_secret();
            let signature = sign(&payload, &secret);
            prop_assert!(!verify_signature(&payload, &signature[cut..], &secret));
            let padded = format!("{}00", signature);
            prop_assert!(!verify_signature(&payload, &padded, &secret));
        }

        #[test]
        fn mutated_signature_is_rejected(
            payload in prop::collection::vec(any::<u8>(), 0..128),
            index in any::<prop::sample::Index>(),
            shift in 1u32..16,
        ) {
            let secret = generate_secret();
            let signature = sign(&payload, &secret);

            let mut chars: Vec<char> = signature.chars().collect();
            let i = index.index(chars.len());
            let digit = chars[i].to_digit(16).unwrap_or(0);
            chars[i] = std::char::from_digit((digit + shift) % 16, 16).unwrap_or('0');
            let tampered: String = chars.into_iter().collect();

            prop_assert_eq!(tampered.len(), signature.len());
            prop_assert_ne!(&tampered, &signature);
            prop_assert!(!verify_signature(&payload, &tampered, &secret));
        }

        #[test]
        fn other_secret_is_rejected(payload in prop::collection::vec(any::<u8>(), 0..128)) {
            let signature = sign(&payload, &generate_secret());
            prop_assert!(!verify_signature(&payload, &signature, &generate_secret()));
        }
    }
}
