//! Verification method identifiers.

use serde::{Deserialize, Serialize};

const SAS_V1: &str = "m.sas.v1";
const QR_SHOW_V1: &str = "m.qr_code.show.v1";
const QR_SCAN_V1: &str = "m.qr_code.scan.v1";
const RECIPROCATE_V1: &str = "m.reciprocate.v1";

/// A verification method advertised in request/ready messages or named in a
/// `start`. Unknown identifiers survive round-trips as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VerificationMethod {
    /// Short-authentication-string (emoji/decimal) comparison.
    SasV1,
    /// We can display a QR code for the peer to scan.
    QrShowV1,
    /// We can scan a QR code displayed by the peer.
    QrScanV1,
    /// The concrete QR flow started after a scan.
    ReciprocateV1,
    /// A method this implementation does not know.
    Other(String),
}

impl VerificationMethod {
    /// The identifier as it appears on the wire.
    pub fn as_wire(&self) -> &str {
        match self {
            Self::SasV1 => SAS_V1,
            Self::QrShowV1 => QR_SHOW_V1,
            Self::QrScanV1 => QR_SCAN_V1,
            Self::ReciprocateV1 => RECIPROCATE_V1,
            Self::Other(s) => s,
        }
    }
}

impl From<String> for VerificationMethod {
    fn from(s: String) -> Self {
        match s.as_str() {
            SAS_V1 => Self::SasV1,
            QR_SHOW_V1 => Self::QrShowV1,
            QR_SCAN_V1 => Self::QrScanV1,
            RECIPROCATE_V1 => Self::ReciprocateV1,
            _ => Self::Other(s),
        }
    }
}

impl From<VerificationMethod> for String {
    fn from(m: VerificationMethod) -> Self {
        m.as_wire().to_owned()
    }
}

impl std::fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn known_methods_round_trip() {
        for wire in [SAS_V1, QR_SHOW_V1, QR_SCAN_V1, RECIPROCATE_V1] {
            let method = VerificationMethod::from(wire.to_owned());
            assert!(!matches!(method, VerificationMethod::Other(_)));
            assert_eq!(method.as_wire(), wire);
        }
    }

    #[test]
    fn unknown_method_is_preserved() {
        let method = VerificationMethod::from("m.sas.v2".to_owned());
        assert_eq!(method, VerificationMethod::Other("m.sas.v2".to_owned()));
        assert_eq!(method.as_wire(), "m.sas.v2");
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&VerificationMethod::SasV1).unwrap();
        assert_eq!(json, "\"m.sas.v1\"");

        let parsed: VerificationMethod = serde_json::from_str("\"m.qr_code.scan.v1\"").unwrap();
        assert_eq!(parsed, VerificationMethod::QrScanV1);
    }
}
