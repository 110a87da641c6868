//! Verification request lifecycle.
//!
//! A request brackets the whole interactive verification with one user:
//! it carries the method negotiation and hands over to a concrete
//! transaction once one side starts. All transitions are pure; sending
//! and event publication happen in the registry.

use vouch_proto::VerificationMethod;

use crate::event::{CancelInfo, RequestPhase, RequestSnapshot};

/// Which transaction kind took over a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionKind {
    Sas,
    Qr,
}

#[derive(Debug)]
enum RequestState {
    /// We sent the request and wait for a ready.
    SentRequest,
    /// The peer asked and we have not answered yet.
    ReceivedRequest {
        their_device: String,
        their_methods: Vec<VerificationMethod>,
    },
    /// Both sides exchanged method lists.
    Ready {
        their_device: String,
        their_methods: Vec<VerificationMethod>,
    },
    /// A transaction is driving the flow.
    Started {
        their_device: String,
        their_methods: Vec<VerificationMethod>,
        kind: TransactionKind,
    },
    Done {
        their_device: Option<String>,
    },
    Cancelled {
        their_device: Option<String>,
        info: CancelInfo,
    },
    HandledByOtherSession,
}

#[derive(Debug)]
pub(crate) struct VerificationRequest {
    pub(crate) flow_id: String,
    pub(crate) other_user_id: String,
    pub(crate) we_started: bool,
    our_methods: Vec<VerificationMethod>,
    state: RequestState,
}

impl VerificationRequest {
    pub(crate) fn new_outgoing(
        flow_id: String,
        other_user_id: String,
        our_methods: Vec<VerificationMethod>,
    ) -> Self {
        Self {
            flow_id,
            other_user_id,
            we_started: true,
            our_methods,
            state: RequestState::SentRequest,
        }
    }

    pub(crate) fn new_incoming(
        flow_id: String,
        other_user_id: String,
        their_device: String,
        their_methods: Vec<VerificationMethod>,
    ) -> Self {
        Self {
            flow_id,
            other_user_id,
            we_started: false,
            our_methods: Vec::new(),
            state: RequestState::ReceivedRequest { their_device, their_methods },
        }
    }

    /// Request that starts out owning a transaction, for peers that send
    /// a bare start without the request phase.
    pub(crate) fn new_direct_start(
        flow_id: String,
        other_user_id: String,
        their_device: String,
        kind: TransactionKind,
    ) -> Self {
        Self {
            flow_id,
            other_user_id,
            we_started: false,
            our_methods: Vec::new(),
            state: RequestState::Started {
                their_device,
                their_methods: Vec::new(),
                kind,
            },
        }
    }

    pub(crate) fn their_device(&self) -> Option<&str> {
        match &self.state {
            RequestState::SentRequest | RequestState::HandledByOtherSession => None,
            RequestState::ReceivedRequest { their_device, .. }
            | RequestState::Ready { their_device, .. }
            | RequestState::Started { their_device, .. } => Some(their_device),
            RequestState::Done { their_device } | RequestState::Cancelled { their_device, .. } => {
                their_device.as_deref()
            }
        }
    }

    pub(crate) fn their_methods(&self) -> Option<&[VerificationMethod]> {
        match &self.state {
            RequestState::ReceivedRequest { their_methods, .. }
            | RequestState::Ready { their_methods, .. }
            | RequestState::Started { their_methods, .. } => Some(their_methods),
            _ => None,
        }
    }

    pub(crate) fn phase(&self) -> RequestPhase {
        match &self.state {
            RequestState::SentRequest | RequestState::ReceivedRequest { .. } => {
                RequestPhase::Requested
            }
            RequestState::Ready { .. } => RequestPhase::Ready,
            RequestState::Started { .. } => RequestPhase::Started,
            RequestState::Done { .. } => RequestPhase::Done,
            RequestState::Cancelled { .. } => RequestPhase::Cancelled,
            RequestState::HandledByOtherSession => RequestPhase::HandledByOtherSession,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            RequestState::Done { .. }
                | RequestState::Cancelled { .. }
                | RequestState::HandledByOtherSession
        )
    }

    /// Whether the flow still waits on our side to answer the request.
    pub(crate) fn awaiting_our_ready(&self) -> bool {
        matches!(self.state, RequestState::ReceivedRequest { .. })
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.state, RequestState::Ready { .. })
    }

    /// The peer answered our request with their supported methods.
    pub(crate) fn on_ready_received(
        &mut self,
        their_device: String,
        their_methods: Vec<VerificationMethod>,
    ) -> bool {
        if matches!(self.state, RequestState::SentRequest) {
            self.state = RequestState::Ready { their_device, their_methods };
            true
        } else {
            false
        }
    }

    /// We answered the peer's request; record what we advertised.
    pub(crate) fn mark_ready_sent(&mut self, our_methods: Vec<VerificationMethod>) -> bool {
        let state = std::mem::replace(&mut self.state, RequestState::HandledByOtherSession);
        match state {
            RequestState::ReceivedRequest { their_device, their_methods } => {
                self.our_methods = our_methods;
                self.state = RequestState::Ready { their_device, their_methods };
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    pub(crate) fn mark_started(&mut self, kind: TransactionKind) -> bool {
        let state = std::mem::replace(&mut self.state, RequestState::HandledByOtherSession);
        match state {
            RequestState::Ready { their_device, their_methods } => {
                self.state = RequestState::Started { their_device, their_methods, kind };
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    pub(crate) fn mark_done(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        let their_device = self.their_device().map(ToOwned::to_owned);
        self.state = RequestState::Done { their_device };
        true
    }

    pub(crate) fn mark_cancelled(&mut self, info: CancelInfo) -> bool {
        if self.is_terminal() {
            return false;
        }
        let their_device = self.their_device().map(ToOwned::to_owned);
        self.state = RequestState::Cancelled { their_device, info };
        true
    }

    /// Another of our sessions answered this request.
    pub(crate) fn mark_handled_by_other_session(&mut self) -> bool {
        match self.state {
            RequestState::SentRequest
            | RequestState::ReceivedRequest { .. }
            | RequestState::Ready { .. } => {
                self.state = RequestState::HandledByOtherSession;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn snapshot(&self) -> RequestSnapshot {
        let cancel_info = match &self.state {
            RequestState::Cancelled { info, .. } => Some(info.clone()),
            _ => None,
        };
        RequestSnapshot {
            flow_id: self.flow_id.clone(),
            other_user_id: self.other_user_id.clone(),
            other_device_id: self.their_device().map(ToOwned::to_owned),
            we_started: self.we_started,
            phase: self.phase(),
            our_methods: self.our_methods.clone(),
            their_methods: self.their_methods().map(<[VerificationMethod]>::to_vec),
            cancel_info,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use vouch_proto::CancelCode;

    use super::*;

    fn methods() -> Vec<VerificationMethod> {
        vec![VerificationMethod::SasV1, VerificationMethod::QrShowV1]
    }

    #[test]
    fn outgoing_request_becomes_ready_on_peer_answer() {
        let mut request = VerificationRequest::new_outgoing(
            "flow-1".into(),
            "@bob:example.org".into(),
            methods(),
        );
        assert_eq!(request.phase(), RequestPhase::Requested);
        assert_eq!(request.their_device(), None);

        assert!(request.on_ready_received("BOBDEV".into(), methods()));
        assert_eq!(request.phase(), RequestPhase::Ready);
        assert_eq!(request.their_device(), Some("BOBDEV"));

        // A second ready does not transition again.
        assert!(!request.on_ready_received("OTHERDEV".into(), methods()));
        assert_eq!(request.their_device(), Some("BOBDEV"));
    }

    #[test]
    fn incoming_request_becomes_ready_when_we_answer() {
        let mut request = VerificationRequest::new_incoming(
            "flow-2".into(),
            "@alice:example.org".into(),
            "ALICEDEV".into(),
            methods(),
        );
        assert!(request.awaiting_our_ready());

        assert!(request.mark_ready_sent(vec![VerificationMethod::SasV1]));
        assert!(request.is_ready());
        assert!(!request.mark_ready_sent(vec![VerificationMethod::SasV1]));

        assert!(request.mark_started(TransactionKind::Sas));
        assert_eq!(request.phase(), RequestPhase::Started);
    }

    #[test]
    fn cancel_is_sticky() {
        let mut request = VerificationRequest::new_outgoing(
            "flow-3".into(),
            "@bob:example.org".into(),
            methods(),
        );
        assert!(request.mark_cancelled(CancelInfo::local(CancelCode::User)));
        assert!(request.is_terminal());

        assert!(!request.mark_done());
        assert!(!request.mark_cancelled(CancelInfo::local(CancelCode::Timeout)));
        assert!(!request.mark_handled_by_other_session());

        let snapshot = request.snapshot();
        assert_eq!(snapshot.phase, RequestPhase::Cancelled);
        assert_eq!(
            snapshot.cancel_info.map(|info| info.code),
            Some(CancelCode::User)
        );
    }

    #[test]
    fn handled_elsewhere_only_before_start() {
        let mut request = VerificationRequest::new_incoming(
            "flow-4".into(),
            "@alice:example.org".into(),
            "ALICEDEV".into(),
            methods(),
        );
        assert!(request.mark_ready_sent(methods()));
        assert!(request.mark_started(TransactionKind::Qr));
        assert!(!request.mark_handled_by_other_session());

        let mut fresh = VerificationRequest::new_incoming(
            "flow-5".into(),
            "@alice:example.org".into(),
            "ALICEDEV".into(),
            methods(),
        );
        assert!(fresh.mark_handled_by_other_session());
        assert_eq!(fresh.phase(), RequestPhase::HandledByOtherSession);
    }
}
