//! QR reciprocation transaction.
//!
//! One device renders a payload carrying both fingerprint keys and a
//! random secret; the other scans it and echoes the secret in a
//! reciprocate start. Returning the secret proves physical access to the
//! displayed code, so no further cryptographic exchange is needed.

use crate::event::{CancelInfo, QrPhase, QrSnapshot};

/// Version tag leading every encoded payload.
pub const QR_PREFIX: &str = "VOUCH1";

const SEGMENT_COUNT: usize = 6;

/// Why a scanned string could not be decoded into a [`QrPayload`].
#[derive(Debug, thiserror::Error)]
pub enum QrPayloadError {
    #[error("QR payload does not start with {QR_PREFIX}")]
    WrongPrefix,
    #[error("QR payload has {actual} segments, expected {SEGMENT_COUNT}")]
    WrongSegmentCount { actual: usize },
    #[error("QR payload field {field} is blank")]
    BlankField { field: &'static str },
}

/// Everything a displayed QR code carries.
///
/// The keys let the scanner check it is talking to the device it thinks,
/// and the secret is what the scanner must echo back to prove the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPayload {
    pub flow_id: String,
    /// User showing the code.
    pub shower_user_id: String,
    /// Fingerprint key of the showing device, unpadded base64.
    pub shower_device_key: String,
    /// Fingerprint key of the device expected to scan, unpadded base64.
    pub scanner_device_key: String,
    /// Random reciprocation secret, unpadded base64.
    pub secret: String,
}

impl QrPayload {
    /// Render the payload into the string embedded in the QR image.
    ///
    /// Fields are pipe-separated; none of them can contain a pipe (user
    /// ids by grammar, the rest being base64 or a UUID).
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{QR_PREFIX}|{}|{}|{}|{}|{}",
            self.flow_id,
            self.shower_user_id,
            self.shower_device_key,
            self.scanner_device_key,
            self.secret,
        )
    }

    pub fn parse(scanned: &str) -> Result<Self, QrPayloadError> {
        let segments: Vec<&str> = scanned.split('|').collect();
        if segments.len() != SEGMENT_COUNT {
            return Err(QrPayloadError::WrongSegmentCount { actual: segments.len() });
        }
        if segments[0] != QR_PREFIX {
            return Err(QrPayloadError::WrongPrefix);
        }
        let field = |index: usize, name: &'static str| {
            let value = segments[index];
            if value.trim().is_empty() {
                Err(QrPayloadError::BlankField { field: name })
            } else {
                Ok(value.to_owned())
            }
        };
        Ok(Self {
            flow_id: field(1, "flow_id")?,
            shower_user_id: field(2, "shower_user_id")?,
            shower_device_key: field(3, "shower_device_key")?,
            scanner_device_key: field(4, "scanner_device_key")?,
            secret: field(5, "secret")?,
        })
    }
}

#[derive(Debug)]
enum QrState {
    /// Scanner side: reciprocation sent, waiting for the shower's done.
    WaitingForDone,
    /// Shower side: a valid reciprocation arrived, awaiting the local
    /// user's confirmation.
    Scanned,
    Done,
    Cancelled(CancelInfo),
}

#[derive(Debug)]
pub(crate) struct QrTransaction {
    pub(crate) flow_id: String,
    pub(crate) other_user_id: String,
    pub(crate) other_device_id: String,
    pub(crate) we_scanned: bool,
    state: QrState,
}

impl QrTransaction {
    pub(crate) fn new_scanner(
        flow_id: String,
        other_user_id: String,
        other_device_id: String,
    ) -> Self {
        Self {
            flow_id,
            other_user_id,
            other_device_id,
            we_scanned: true,
            state: QrState::WaitingForDone,
        }
    }

    pub(crate) fn new_shower(
        flow_id: String,
        other_user_id: String,
        other_device_id: String,
    ) -> Self {
        Self {
            flow_id,
            other_user_id,
            other_device_id,
            we_scanned: false,
            state: QrState::Scanned,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, QrState::Done | QrState::Cancelled(_))
    }

    pub(crate) fn phase(&self) -> QrPhase {
        match &self.state {
            QrState::WaitingForDone => QrPhase::Started,
            QrState::Scanned => QrPhase::Scanned,
            QrState::Done => QrPhase::Done,
            QrState::Cancelled(_) => QrPhase::Cancelled,
        }
    }

    /// Scanner side: the shower confirmed our reciprocation.
    pub(crate) fn on_done(&mut self) -> bool {
        if matches!(self.state, QrState::WaitingForDone) {
            self.state = QrState::Done;
            true
        } else {
            false
        }
    }

    /// Shower side: the user confirmed the scan really happened.
    pub(crate) fn confirm_scanned(&mut self) -> bool {
        if matches!(self.state, QrState::Scanned) {
            self.state = QrState::Done;
            true
        } else {
            false
        }
    }

    pub(crate) fn cancel(&mut self, info: CancelInfo) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = QrState::Cancelled(info);
        true
    }

    pub(crate) fn snapshot(&self) -> QrSnapshot {
        self.snapshot_with_phase(self.phase())
    }

    /// Snapshot under an explicit phase, for the created notification of
    /// a shower transaction that is born already scanned.
    pub(crate) fn snapshot_with_phase(&self, phase: QrPhase) -> QrSnapshot {
        let cancel_info = match &self.state {
            QrState::Cancelled(info) => Some(info.clone()),
            _ => None,
        };
        QrSnapshot {
            flow_id: self.flow_id.clone(),
            other_user_id: self.other_user_id.clone(),
            other_device_id: self.other_device_id.clone(),
            we_scanned: self.we_scanned,
            phase,
            cancel_info,
        }
    }
}
