//! Commitment computation and constant-time comparison.
//!
//! The accepter of a SAS start commits to its ephemeral public key before the
//! initiator reveals anything: `sha256(public_key || canonical_start_json)`.
//! The initiator recomputes this when the key is finally revealed and must
//! compare in constant time.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Commitment over the accepter's wire-encoded public key and the canonical
/// JSON of the initiator's start content. Unpadded base64 of the SHA-256.
pub fn compute_commitment(public_key_b64: &str, canonical_start_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key_b64.as_bytes());
    hasher.update(canonical_start_json.as_bytes());
    STANDARD_NO_PAD.encode(hasher.finalize())
}

/// Constant-time equality for commitment and MAC strings.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn commitment_is_deterministic() {
        let a = compute_commitment("PubKey", r#"{"method":"m.sas.v1"}"#);
        let b = compute_commitment("PubKey", r#"{"method":"m.sas.v1"}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn commitment_binds_key_and_content() {
        let base = compute_commitment("PubKey", r#"{"a":1}"#);
        assert_ne!(base, compute_commitment("OtherKey", r#"{"a":1}"#));
        assert_ne!(base, compute_commitment("PubKey", r#"{"a":2}"#));
    }

    #[test]
    fn commitment_is_unpadded_base64_sha256() {
        let commitment = compute_commitment("k", "{}");
        assert!(!commitment.contains('='));
        assert_eq!(STANDARD_NO_PAD.decode(&commitment).unwrap().len(), 32);
    }

    #[test]
    fn constant_time_eq_matches_equality() {
        assert!(constant_time_eq("same", "same"));
        assert!(!constant_time_eq("same", "diff"));
        assert!(!constant_time_eq("longer", "short"));
    }
}
