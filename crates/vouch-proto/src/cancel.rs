//! Cancellation codes carried on the wire.

use serde::{Deserialize, Serialize};

/// Reason code attached to a `cancel` message.
///
/// These are protocol values, not local errors: both the code and a
/// human-readable reason travel to the peer so either side can explain to the
/// user why verification stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CancelCode {
    /// The user cancelled the verification.
    User,
    /// The verification took too long.
    Timeout,
    /// A message referenced an unknown flow.
    UnknownTransaction,
    /// A message named a method this device cannot perform.
    UnknownMethod,
    /// A message arrived that no valid transition accepts.
    UnexpectedMessage,
    /// A message was structurally invalid.
    InvalidMessage,
    /// The revealed key did not match the earlier commitment.
    MismatchedCommitment,
    /// The users' short codes did not match.
    MismatchedSas,
    /// The exchanged MACs or device keys did not match.
    MismatchedKeys,
    /// A local failure while driving the protocol, e.g. a send that failed.
    UserError,
    /// A scanned QR payload could not be parsed or did not fit the flow.
    QrCodeInvalid,
    /// The QR payload named a different user than expected.
    MismatchedUser,
    /// Another of our own sessions already accepted the request.
    AcceptedByAnotherDevice,
    /// A code this implementation does not know.
    Other(String),
}

impl CancelCode {
    /// The code as it appears on the wire.
    pub fn as_wire(&self) -> &str {
        match self {
            Self::User => "m.user",
            Self::Timeout => "m.timeout",
            Self::UnknownTransaction => "m.unknown_transaction",
            Self::UnknownMethod => "m.unknown_method",
            Self::UnexpectedMessage => "m.unexpected_message",
            Self::InvalidMessage => "m.invalid_message",
            Self::MismatchedCommitment => "m.mismatched_commitment",
            Self::MismatchedSas => "m.mismatched_sas",
            Self::MismatchedKeys => "m.key_mismatch",
            Self::UserError => "m.user_error",
            Self::QrCodeInvalid => "m.qr_code.invalid",
            Self::MismatchedUser => "m.user_mismatch",
            Self::AcceptedByAnotherDevice => "m.accepted",
            Self::Other(s) => s,
        }
    }

    /// Default reason string sent alongside the code.
    pub fn human_readable(&self) -> &str {
        match self {
            Self::User => "the user cancelled the verification",
            Self::Timeout => "the verification process timed out",
            Self::UnknownTransaction => "the device does not know about this verification",
            Self::UnknownMethod => {
                "the device cannot agree on a key agreement, hash, MAC, or SAS method"
            }
            Self::UnexpectedMessage => "the device received an unexpected message",
            Self::InvalidMessage => "the device received an invalid message",
            Self::MismatchedCommitment => "the hash commitment did not match",
            Self::MismatchedSas => "the short authentication strings did not match",
            Self::MismatchedKeys => "the exchanged keys did not match",
            Self::UserError => "a local error occurred while verifying",
            Self::QrCodeInvalid => "the scanned QR code was invalid",
            Self::MismatchedUser => "the QR code named an unexpected user",
            Self::AcceptedByAnotherDevice => "the request was accepted by a different device",
            Self::Other(_) => "the verification was cancelled",
        }
    }
}

impl From<String> for CancelCode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "m.user" => Self::User,
            "m.timeout" => Self::Timeout,
            "m.unknown_transaction" => Self::UnknownTransaction,
            "m.unknown_method" => Self::UnknownMethod,
            "m.unexpected_message" => Self::UnexpectedMessage,
            "m.invalid_message" => Self::InvalidMessage,
            "m.mismatched_commitment" => Self::MismatchedCommitment,
            "m.mismatched_sas" => Self::MismatchedSas,
            "m.key_mismatch" => Self::MismatchedKeys,
            "m.user_error" => Self::UserError,
            "m.qr_code.invalid" => Self::QrCodeInvalid,
            "m.user_mismatch" => Self::MismatchedUser,
            "m.accepted" => Self::AcceptedByAnotherDevice,
            _ => Self::Other(s),
        }
    }
}

impl From<CancelCode> for String {
    fn from(c: CancelCode) -> Self {
        c.as_wire().to_owned()
    }
}

impl std::fmt::Display for CancelCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_wire_names() {
        let codes = [
            CancelCode::User,
            CancelCode::Timeout,
            CancelCode::UnknownTransaction,
            CancelCode::UnknownMethod,
            CancelCode::UnexpectedMessage,
            CancelCode::InvalidMessage,
            CancelCode::MismatchedCommitment,
            CancelCode::MismatchedSas,
            CancelCode::MismatchedKeys,
            CancelCode::UserError,
            CancelCode::QrCodeInvalid,
            CancelCode::MismatchedUser,
            CancelCode::AcceptedByAnotherDevice,
        ];
        for code in codes {
            let wire = code.as_wire().to_owned();
            assert_eq!(CancelCode::from(wire), code);
        }
    }

    #[test]
    fn unknown_code_survives() {
        let code = CancelCode::from("m.something_new".to_owned());
        assert_eq!(code, CancelCode::Other("m.something_new".to_owned()));
        assert_eq!(code.as_wire(), "m.something_new");
    }

    #[test]
    fn key_mismatch_uses_legacy_wire_name() {
        assert_eq!(CancelCode::MismatchedKeys.as_wire(), "m.key_mismatch");
    }

    #[test]
    fn every_code_has_a_reason() {
        assert!(!CancelCode::User.human_readable().is_empty());
        assert!(!CancelCode::Other("x".into()).human_readable().is_empty());
    }
}
