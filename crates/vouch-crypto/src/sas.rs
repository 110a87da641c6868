//! SAS byte and MAC derivation.
//!
//! Both derivations bind the transcript into the HKDF info string: the two
//! identities, their public keys and the flow id. Peers that disagree on any
//! of these derive different bytes and the comparison fails.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use hkdf::Hkdf;
use hmac::{Hmac, Mac as _};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::exchange::SharedSecret;

const SAS_INFO_PREFIX: &str = "MATRIX_KEY_VERIFICATION_SAS";
const MAC_INFO_PREFIX: &str = "MATRIX_KEY_VERIFICATION_MAC";

/// Number of SAS bytes the short codes are derived from.
pub const SAS_BYTES_LEN: usize = 6;

/// Key length for the legacy long-KDF MAC scheme.
const LONG_KDF_KEY_LEN: usize = 256;

type HmacSha256 = Hmac<Sha256>;

/// One party of a SAS transaction as it appears in the transcript.
#[derive(Debug, Clone, Copy)]
pub struct SasIdentity<'a> {
    pub user_id: &'a str,
    pub device_id: &'a str,
    /// Ephemeral public key, unpadded base64.
    pub public_key: &'a str,
}

/// Info string for SAS byte derivation. The initiator is the side that sent
/// the `start`; both peers must build the string from the same perspective.
pub fn sas_info(
    initiator: &SasIdentity<'_>,
    responder: &SasIdentity<'_>,
    flow_id: &str,
) -> String {
    format!(
        "{SAS_INFO_PREFIX}|{}|{}|{}|{}|{}|{}|{flow_id}",
        initiator.user_id,
        initiator.device_id,
        initiator.public_key,
        responder.user_id,
        responder.device_id,
        responder.public_key,
    )
}

/// Info string for a MAC over one key. The sender is whoever computed the
/// MAC; the receiver verifies with the roles swapped.
pub fn mac_info(
    sender_user: &str,
    sender_device: &str,
    receiver_user: &str,
    receiver_device: &str,
    flow_id: &str,
    key_id: &str,
) -> String {
    format!(
        "{MAC_INFO_PREFIX}{sender_user}{sender_device}{receiver_user}{receiver_device}{flow_id}{key_id}"
    )
}

/// Derive the 6 SAS bytes: HKDF-SHA256 over the shared secret, no salt,
/// with the transcript info string.
pub fn derive_sas_bytes(
    shared: &SharedSecret,
    info: &str,
) -> Result<[u8; SAS_BYTES_LEN], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut bytes = [0u8; SAS_BYTES_LEN];
    hk.expand(info.as_bytes(), &mut bytes)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(bytes)
}

fn hmac_base64(key: &[u8], message: &str) -> Result<String, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::MacFailed(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(STANDARD_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// MAC a message under the `hkdf-hmac-sha256` scheme: a fresh 32-byte
/// HMAC-SHA256 key is derived per info string.
pub fn calculate_mac(
    shared: &SharedSecret,
    info: &str,
    message: &str,
) -> Result<String, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(info.as_bytes(), &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    let encoded = hmac_base64(&key, message);
    key.zeroize();
    encoded
}

/// MAC a message under the legacy `hmac-sha256` scheme, which keys HMAC with
/// a 256-byte HKDF output. Kept for peers that negotiate it; never preferred.
pub fn calculate_mac_long_kdf(
    shared: &SharedSecret,
    info: &str,
    message: &str,
) -> Result<String, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; LONG_KDF_KEY_LEN];
    hk.expand(info.as_bytes(), &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    let encoded = hmac_base64(&key, message);
    key.zeroize();
    encoded
}
