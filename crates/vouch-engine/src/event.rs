//! Observable state changes.
//!
//! Every transition of a request or transaction is published as an
//! immutable snapshot over a broadcast channel. Consumers render UI from
//! snapshots alone; there is no mutable handle to reach back into the
//! engine with.

use vouch_crypto::Emoji;
use vouch_proto::{CancelCode, VerificationMethod};

/// How and why a flow was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelInfo {
    pub code: CancelCode,
    pub reason: String,
    /// True when this side initiated the cancel.
    pub cancelled_by_us: bool,
}

impl CancelInfo {
    pub(crate) fn local(code: CancelCode) -> Self {
        let reason = code.human_readable().to_owned();
        Self { code, reason, cancelled_by_us: true }
    }

    pub(crate) fn remote(code: CancelCode, reason: String) -> Self {
        Self { code, reason, cancelled_by_us: false }
    }
}

/// Lifecycle of a verification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Sent or received, not yet answered.
    Requested,
    /// Both sides exchanged their supported methods.
    Ready,
    /// A concrete transaction took over.
    Started,
    Done,
    Cancelled,
    /// Another of our sessions answered this request.
    HandledByOtherSession,
}

/// Point-in-time view of a verification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub flow_id: String,
    pub other_user_id: String,
    /// Unknown until the peer answered with a ready.
    pub other_device_id: Option<String>,
    /// True when this side sent the request.
    pub we_started: bool,
    pub phase: RequestPhase,
    pub our_methods: Vec<VerificationMethod>,
    pub their_methods: Option<Vec<VerificationMethod>>,
    pub cancel_info: Option<CancelInfo>,
}

/// Lifecycle of a short-code transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasPhase {
    Started,
    Accepted,
    /// Both ephemeral keys arrived; codes are being derived.
    KeyExchanged,
    /// Codes can be shown to the user.
    ShortCodeReady,
    /// We confirmed and sent our MAC, waiting for theirs.
    MacSent,
    Done,
    Cancelled,
}

/// Point-in-time view of a short-code transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasSnapshot {
    pub flow_id: String,
    pub other_user_id: String,
    pub other_device_id: String,
    /// True when this side sent the start.
    pub we_started: bool,
    pub phase: SasPhase,
    /// Present from `ShortCodeReady` on.
    pub decimal: Option<[u16; 3]>,
    /// Present from `ShortCodeReady` on, when emoji was negotiated.
    pub emoji: Option<[Emoji; 7]>,
    pub have_we_confirmed: bool,
    pub has_other_confirmed: bool,
    pub cancel_info: Option<CancelInfo>,
}

/// Lifecycle of a QR reciprocation transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrPhase {
    Started,
    /// The peer scanned our code; waiting for local confirmation.
    Scanned,
    Done,
    Cancelled,
}

/// Point-in-time view of a QR transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrSnapshot {
    pub flow_id: String,
    pub other_user_id: String,
    pub other_device_id: String,
    /// True when this side scanned the other's code.
    pub we_scanned: bool,
    pub phase: QrPhase,
    pub cancel_info: Option<CancelInfo>,
}

/// Snapshot of whichever transaction kind a flow is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionSnapshot {
    Sas(SasSnapshot),
    Qr(QrSnapshot),
}

impl TransactionSnapshot {
    #[must_use]
    pub fn flow_id(&self) -> &str {
        match self {
            Self::Sas(snapshot) => &snapshot.flow_id,
            Self::Qr(snapshot) => &snapshot.flow_id,
        }
    }

    #[must_use]
    pub fn cancel_info(&self) -> Option<&CancelInfo> {
        match self {
            Self::Sas(snapshot) => snapshot.cancel_info.as_ref(),
            Self::Qr(snapshot) => snapshot.cancel_info.as_ref(),
        }
    }
}

/// A state change published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationEvent {
    RequestCreated(RequestSnapshot),
    RequestUpdated(RequestSnapshot),
    TransactionCreated(TransactionSnapshot),
    TransactionUpdated(TransactionSnapshot),
}
