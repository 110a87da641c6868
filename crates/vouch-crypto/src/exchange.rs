//! Ephemeral key exchange for one verification transaction.
//!
//! Each SAS transaction generates a fresh X25519 keypair, publishes the
//! public half (directly or hidden behind a commitment) and performs a
//! one-shot ECDH once the peer reveals theirs. The shared secret feeds the
//! short-code and MAC derivations and is erased when the transaction ends.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// ECDH output bound to one transaction, erased on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Ephemeral keypair for one SAS transaction.
pub struct EphemeralSas {
    secret: StaticSecret,
    public: PublicKey,
}

// Shows only the public half.
impl std::fmt::Debug for EphemeralSas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralSas")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Default for EphemeralSas {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralSas {
    /// Generate a fresh keypair.
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Our public key, unpadded base64, as it goes on the wire.
    pub fn public_key(&self) -> String {
        STANDARD_NO_PAD.encode(self.public.as_bytes())
    }

    /// Complete the exchange with the peer's wire-encoded public key.
    ///
    /// Consumes the keypair; a transaction performs exactly one exchange.
    pub fn diffie_hellman(self, peer_public_b64: &str) -> Result<SharedSecret, CryptoError> {
        let peer_public = PublicKey::from(decode_public_key(peer_public_b64)?);
        let shared = self.secret.diffie_hellman(&peer_public);
        Ok(SharedSecret {
            bytes: *shared.as_bytes(),
        })
    }
}

fn decode_public_key(peer_public_b64: &str) -> Result<[u8; 32], CryptoError> {
    let decoded = STANDARD_NO_PAD
        .decode(peer_public_b64)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    <[u8; 32]>::try_from(decoded.as_slice()).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        actual: decoded.len(),
    })
}

/// Check that a wire-encoded public key decodes to 32 bytes, without
/// committing a keypair to the exchange.
pub fn validate_public_key(peer_public_b64: &str) -> Result<(), CryptoError> {
    decode_public_key(peer_public_b64).map(|_| ())
}

/// Random 32-byte secret, unpadded base64. Used as the QR reciprocation
/// secret embedded in a displayed code.
pub fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let encoded = STANDARD_NO_PAD.encode(bytes);
    bytes.zeroize();
    encoded
}

/// Run a full exchange between two fresh keypairs and return both public
/// keys and both derived secrets.
///
/// Convenience for tests; production code holds one [`EphemeralSas`] per
/// transaction and learns the peer key from the wire.
#[cfg(any(test, feature = "test-utils"))]
pub fn exchange_pair() -> Result<(String, String, SharedSecret, SharedSecret), CryptoError> {
    let ours = EphemeralSas::new();
    let theirs = EphemeralSas::new();

    let our_public = ours.public_key();
    let their_public = theirs.public_key();

    let our_shared = ours.diffie_hellman(&their_public)?;
    let their_shared = theirs.diffie_hellman(&our_public)?;

    Ok((our_public, their_public, our_shared, their_shared))
}
