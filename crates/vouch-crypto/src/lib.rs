//! `Vouch` Verification Crypto
//!
//! Cryptographic building blocks for interactive device verification. This
//! crate sequences vetted primitives; it does not invent any.
//!
//! ## Primitives
//!
//! - **Exchange**: X25519 ephemeral keypair per transaction, one-shot ECDH
//! - **SAS bytes**: HKDF-SHA256 over the shared secret with a
//!   transcript-binding info string, truncated to 6 bytes
//! - **Short codes**: decimal triplet and seven-emoji renderings of the SAS
//!   bytes
//! - **Commitment**: SHA-256 over the accepter's public key and the canonical
//!   start content
//! - **MACs**: HMAC-SHA256 keyed via HKDF (preferred) or the legacy long-KDF
//!   scheme

pub mod commitment;
pub mod error;
pub mod exchange;
pub mod sas;
pub mod short_code;

pub use commitment::{compute_commitment, constant_time_eq};
pub use error::CryptoError;
#[cfg(any(test, feature = "test-utils"))]
pub use exchange::exchange_pair;
pub use exchange::{EphemeralSas, SharedSecret, random_secret, validate_public_key};
pub use sas::{
    SasIdentity, calculate_mac, calculate_mac_long_kdf, derive_sas_bytes, mac_info, sas_info,
};
pub use short_code::{EMOJI_TABLE, Emoji, decimal_code, emoji_code};
