//! Algorithm identifiers used during SAS parameter negotiation.
//!
//! These are wire vocabulary, not implementations. The crypto crate
//! implements the schemes; the engine negotiates over these names.

/// Key agreement on ephemeral Curve25519 keys with HKDF-SHA256 expansion.
pub const KEY_AGREEMENT_CURVE25519_HKDF_SHA256: &str = "curve25519-hkdf-sha256";

/// Legacy key agreement without the HKDF step. Recognized on the wire,
/// never offered or accepted.
pub const KEY_AGREEMENT_CURVE25519: &str = "curve25519";

/// The only supported commitment hash.
pub const HASH_SHA256: &str = "sha256";

/// Preferred MAC scheme: per-key HKDF-derived HMAC-SHA256 key.
pub const MAC_HKDF_HMAC_SHA256: &str = "hkdf-hmac-sha256";

/// Legacy MAC scheme with a long-KDF derived key.
pub const MAC_HMAC_SHA256: &str = "hmac-sha256";

/// Short code rendered as three four-digit numbers.
pub const SHORT_CODE_DECIMAL: &str = "decimal";

/// Short code rendered as seven emoji.
pub const SHORT_CODE_EMOJI: &str = "emoji";

/// MAC identifiers acceptable in an incoming `start`.
pub const KNOWN_MACS: &[&str] = &[MAC_HKDF_HMAC_SHA256, MAC_HMAC_SHA256];

/// Key agreement protocols acceptable in an incoming `start`.
pub const KNOWN_KEY_AGREEMENTS: &[&str] = &[KEY_AGREEMENT_CURVE25519_HKDF_SHA256];

/// Hashes acceptable in an incoming `start`.
pub const KNOWN_HASHES: &[&str] = &[HASH_SHA256];

/// Short code formats this implementation can render.
pub const KNOWN_SHORT_CODES: &[&str] = &[SHORT_CODE_DECIMAL, SHORT_CODE_EMOJI];
