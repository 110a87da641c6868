//! `Vouch` Verification Wire Protocol
//!
//! Message model for the interactive device-verification protocol:
//! - Typed content structs for every verification message
//!   (request/ready/start/accept/key/mac/cancel/done)
//! - Structural validation, applied before any message reaches a state machine
//! - Cancellation codes and verification method identifiers with their wire names
//! - Canonical JSON used for commitment computation

pub mod algorithm;
pub mod cancel;
pub mod canonical;
pub mod error;
pub mod messages;
pub mod method;

pub use cancel::CancelCode;
pub use canonical::canonical_json;
pub use error::MessageError;
pub use messages::{
    AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, ReadyContent,
    RequestContent, SasStartLists, StartContent, VerificationContent,
};
pub use method::VerificationMethod;
