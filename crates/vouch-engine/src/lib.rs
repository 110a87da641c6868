//! `Vouch` Verification Engine
//!
//! Async state machines for interactive device verification:
//! - Request lifecycle from `m.key.verification.request` to the hand-off
//!   into a concrete transaction
//! - Short authentication string transactions with decimal and emoji codes
//! - QR reciprocation transactions for the showing and the scanning side
//! - A registry that routes incoming messages, executes user decisions and
//!   publishes immutable snapshots over a broadcast channel
//!
//! The engine is transport agnostic. Implement [`MessageTransport`] on
//! whatever carries `m.key.verification.*` payloads between devices and
//! feed inbound messages into [`VerificationRegistry::route_incoming`].

pub mod config;
pub mod error;
pub mod event;
pub mod qr;
mod registry;
mod request;
mod sas;
pub mod store;
pub mod transport;

pub use config::EngineConfig;
pub use error::{Result, VerificationError};
pub use event::{
    CancelInfo, QrPhase, QrSnapshot, RequestPhase, RequestSnapshot, SasPhase, SasSnapshot,
    TransactionSnapshot, VerificationEvent,
};
pub use qr::{QR_PREFIX, QrPayload, QrPayloadError};
pub use registry::VerificationRegistry;
#[cfg(any(test, feature = "test-utils"))]
pub use store::FixedClock;
pub use store::{Clock, DeviceStore, InMemoryDeviceStore, SystemClock};
pub use transport::{MessageTransport, TransportError};

pub use vouch_crypto::Emoji;
pub use vouch_proto::{CancelCode, VerificationContent, VerificationMethod};
