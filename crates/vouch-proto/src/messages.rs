//! Typed verification message contents.
//!
//! Every inbound message is deserialized into one of these structs and then
//! passed through [`VerificationContent::validate`] before it may touch a
//! state machine. Validation here is structural (blank fields, empty lists,
//! missing method-specific fields); whether the named parameters are
//! *acceptable* is a negotiation concern decided by the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelCode;
use crate::error::MessageError;
use crate::method::VerificationMethod;

/// Opens a verification flow and advertises the sender's methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContent {
    pub from_device: String,
    pub transaction_id: String,
    pub methods: Vec<VerificationMethod>,
    /// Milliseconds since the epoch, by the sender's clock.
    pub timestamp: u64,
}

/// Accepts a verification request and advertises our methods back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyContent {
    pub from_device: String,
    pub transaction_id: String,
    pub methods: Vec<VerificationMethod>,
}

/// Begins a concrete verification: SAS parameter lists or a reciprocate
/// secret, depending on `method`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartContent {
    pub from_device: String,
    pub method: VerificationMethod,
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_agreement_protocols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_authentication_codes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_authentication_string: Option<Vec<String>>,
    /// Shared secret proving a QR code was scanned. Reciprocate only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// The negotiation lists carried by a SAS `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasStartLists {
    pub key_agreement_protocols: Vec<String>,
    pub hashes: Vec<String>,
    pub message_authentication_codes: Vec<String>,
    pub short_authentication_string: Vec<String>,
}

impl StartContent {
    /// The four negotiation lists, present on every validated SAS start.
    pub fn sas_lists(&self) -> Option<SasStartLists> {
        Some(SasStartLists {
            key_agreement_protocols: self.key_agreement_protocols.clone()?,
            hashes: self.hashes.clone()?,
            message_authentication_codes: self.message_authentication_codes.clone()?,
            short_authentication_string: self.short_authentication_string.clone()?,
        })
    }
}

/// Accepts a SAS `start`, committing to our ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptContent {
    pub transaction_id: String,
    pub key_agreement_protocol: String,
    pub hash: String,
    pub message_authentication_code: String,
    pub short_authentication_string: Vec<String>,
    /// Hash of our ephemeral public key and the canonical start content.
    pub commitment: String,
}

/// Reveals an ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContent {
    pub transaction_id: String,
    /// Unpadded base64 Curve25519 public key.
    pub key: String,
}

/// Authenticates device keys with MACs derived from the shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacContent {
    pub transaction_id: String,
    /// MAC per key, keyed by key id such as `ed25519:DEVICEID`.
    pub mac: BTreeMap<String, String>,
    /// MAC over the comma-joined, sorted list of key ids above.
    pub keys: String,
}

/// Terminates a flow with a reason code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelContent {
    pub transaction_id: String,
    pub code: CancelCode,
    pub reason: String,
}

/// Signals successful local completion of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneContent {
    pub transaction_id: String,
}

/// Any verification message, tagged with its wire event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VerificationContent {
    #[serde(rename = "m.key.verification.request")]
    Request(RequestContent),
    #[serde(rename = "m.key.verification.ready")]
    Ready(ReadyContent),
    #[serde(rename = "m.key.verification.start")]
    Start(StartContent),
    #[serde(rename = "m.key.verification.accept")]
    Accept(AcceptContent),
    #[serde(rename = "m.key.verification.key")]
    Key(KeyContent),
    #[serde(rename = "m.key.verification.mac")]
    Mac(MacContent),
    #[serde(rename = "m.key.verification.cancel")]
    Cancel(CancelContent),
    #[serde(rename = "m.key.verification.done")]
    Done(DoneContent),
}

fn non_blank(value: &str, field: &'static str) -> Result<(), MessageError> {
    if value.trim().is_empty() {
        return Err(MessageError::BlankField { field });
    }
    Ok(())
}

fn non_empty<T>(list: &[T], field: &'static str) -> Result<(), MessageError> {
    if list.is_empty() {
        return Err(MessageError::EmptyList { field });
    }
    Ok(())
}

impl RequestContent {
    pub fn validate(&self) -> Result<(), MessageError> {
        non_blank(&self.from_device, "from_device")?;
        non_blank(&self.transaction_id, "transaction_id")?;
        non_empty(&self.methods, "methods")
    }
}

impl ReadyContent {
    pub fn validate(&self) -> Result<(), MessageError> {
        non_blank(&self.from_device, "from_device")?;
        non_blank(&self.transaction_id, "transaction_id")?;
        non_empty(&self.methods, "methods")
    }
}

impl StartContent {
    pub fn validate(&self) -> Result<(), MessageError> {
        non_blank(&self.from_device, "from_device")?;
        non_blank(&self.transaction_id, "transaction_id")?;
        match &self.method {
            VerificationMethod::SasV1 => {
                let require = |list: &Option<Vec<String>>, field: &'static str| {
                    list.as_deref().map_or(
                        Err(MessageError::MissingField {
                            method: self.method.to_string(),
                            field,
                        }),
                        |items| non_empty(items, field),
                    )
                };
                require(&self.key_agreement_protocols, "key_agreement_protocols")?;
                require(&self.hashes, "hashes")?;
                require(
                    &self.message_authentication_codes,
                    "message_authentication_codes",
                )?;
                require(
                    &self.short_authentication_string,
                    "short_authentication_string",
                )
            }
            VerificationMethod::ReciprocateV1 => match self.secret.as_deref() {
                Some(secret) => non_blank(secret, "secret"),
                None => Err(MessageError::MissingField {
                    method: self.method.to_string(),
                    field: "secret",
                }),
            },
            // Starts for methods we do not implement are structurally fine;
            // the engine answers them with an unknown-method cancel.
            _ => Ok(()),
        }
    }
}

impl AcceptContent {
    pub fn validate(&self) -> Result<(), MessageError> {
        non_blank(&self.transaction_id, "transaction_id")?;
        non_blank(&self.key_agreement_protocol, "key_agreement_protocol")?;
        non_blank(&self.hash, "hash")?;
        non_blank(&self.message_authentication_code, "message_authentication_code")?;
        non_empty(&self.short_authentication_string, "short_authentication_string")?;
        non_blank(&self.commitment, "commitment")
    }
}

impl KeyContent {
    pub fn validate(&self) -> Result<(), MessageError> {
        non_blank(&self.transaction_id, "transaction_id")?;
        non_blank(&self.key, "key")
    }
}

impl MacContent {
    pub fn validate(&self) -> Result<(), MessageError> {
        non_blank(&self.transaction_id, "transaction_id")?;
        if self.mac.is_empty() {
            return Err(MessageError::EmptyList { field: "mac" });
        }
        non_blank(&self.keys, "keys")
    }
}

impl CancelContent {
    pub fn validate(&self) -> Result<(), MessageError> {
        non_blank(&self.transaction_id, "transaction_id")?;
        non_blank(self.code.as_wire(), "code")
    }
}

impl DoneContent {
    pub fn validate(&self) -> Result<(), MessageError> {
        non_blank(&self.transaction_id, "transaction_id")
    }
}

impl VerificationContent {
    /// The flow id correlating all messages of one verification attempt.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::Request(c) => &c.transaction_id,
            Self::Ready(c) => &c.transaction_id,
            Self::Start(c) => &c.transaction_id,
            Self::Accept(c) => &c.transaction_id,
            Self::Key(c) => &c.transaction_id,
            Self::Mac(c) => &c.transaction_id,
            Self::Cancel(c) => &c.transaction_id,
            Self::Done(c) => &c.transaction_id,
        }
    }

    /// Short name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Ready(_) => "ready",
            Self::Start(_) => "start",
            Self::Accept(_) => "accept",
            Self::Key(_) => "key",
            Self::Mac(_) => "mac",
            Self::Cancel(_) => "cancel",
            Self::Done(_) => "done",
        }
    }

    /// Structural validation. A message failing this must be dropped without
    /// creating or mutating any flow state.
    pub fn validate(&self) -> Result<(), MessageError> {
        match self {
            Self::Request(c) => c.validate(),
            Self::Ready(c) => c.validate(),
            Self::Start(c) => c.validate(),
            Self::Accept(c) => c.validate(),
            Self::Key(c) => c.validate(),
            Self::Mac(c) => c.validate(),
            Self::Cancel(c) => c.validate(),
            Self::Done(c) => c.validate(),
        }
    }
}
