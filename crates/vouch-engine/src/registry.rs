//! Flow registry and message router.
//!
//! One registry instance represents the local device. It owns every live
//! verification flow, keyed by peer user and flow id, routes incoming
//! messages into the right state machine and executes user decisions.
//! Each flow sits behind its own mutex; the outer map is only ever locked
//! to look up or insert handles, never across a flow lock.
//!
//! Failures follow one policy: anything the protocol can express is
//! resolved by cancelling the flow, sending `m.key.verification.cancel`
//! and publishing the cancelled snapshot. Registry methods only return
//! errors when an operation cannot be matched to a flow at all.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vouch_crypto::{constant_time_eq, random_secret};
use vouch_proto::{
    AcceptContent, CancelCode, CancelContent, DoneContent, KeyContent, MacContent, ReadyContent,
    RequestContent, StartContent, VerificationContent, VerificationMethod,
};

use crate::config::EngineConfig;
use crate::error::{Result, VerificationError};
use crate::event::{
    CancelInfo, QrPhase, RequestSnapshot, SasPhase, TransactionSnapshot, VerificationEvent,
};
use crate::qr::{QrPayload, QrTransaction};
use crate::request::{TransactionKind, VerificationRequest};
use crate::sas::{self, SasStep, SasTransaction};
use crate::store::{Clock, DeviceStore, SystemClock};
use crate::transport::MessageTransport;

type FlowKey = (String, String);

#[derive(Debug)]
enum Transaction {
    Sas(SasTransaction),
    Qr(QrTransaction),
}

impl Transaction {
    fn cancel(&mut self, info: CancelInfo) -> bool {
        match self {
            Self::Sas(transaction) => transaction.cancel(info),
            Self::Qr(transaction) => transaction.cancel(info),
        }
    }

    fn snapshot(&self) -> TransactionSnapshot {
        match self {
            Self::Sas(transaction) => TransactionSnapshot::Sas(transaction.snapshot()),
            Self::Qr(transaction) => TransactionSnapshot::Qr(transaction.snapshot()),
        }
    }
}

/// All state of one verification attempt with one peer device.
#[derive(Debug)]
struct Flow {
    request: VerificationRequest,
    transaction: Option<Transaction>,
    /// Payload behind the QR code we are currently displaying, kept to
    /// check the secret a scanner echoes back.
    shown_qr: Option<QrPayload>,
}

/// What to do with an incoming SAS start, decided before any mutation.
enum StartDisposition {
    /// Both sides started concurrently; the tie break applies.
    TieBreak,
    /// A transaction of another kind is running; protocol violation.
    CancelConflict,
    /// Duplicate or late start, drop it.
    Drop,
    /// No transaction yet, take the responder role.
    Fresh,
}

/// Entry point of the verification engine for one local device.
pub struct VerificationRegistry<T: MessageTransport> {
    local_user_id: String,
    local_device_id: String,
    transport: Arc<T>,
    store: Arc<dyn DeviceStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    flows: Arc<RwLock<HashMap<FlowKey, Arc<Mutex<Flow>>>>>,
    /// Flow ids consumed by a completed or cancelled verification. Ids are
    /// never reused, so late or replayed messages die here.
    finished: Arc<RwLock<HashSet<FlowKey>>>,
    events: broadcast::Sender<VerificationEvent>,
}

impl<T: MessageTransport> VerificationRegistry<T> {
    pub fn new(
        local_user_id: &str,
        local_device_id: &str,
        transport: Arc<T>,
        store: Arc<dyn DeviceStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            local_user_id: local_user_id.to_owned(),
            local_device_id: local_device_id.to_owned(),
            transport,
            store,
            clock,
            config,
            flows: Arc::new(RwLock::new(HashMap::new())),
            finished: Arc::new(RwLock::new(HashSet::new())),
            events,
        }
    }

    /// Registry with the system clock and default configuration.
    pub fn with_defaults(
        local_user_id: &str,
        local_device_id: &str,
        transport: Arc<T>,
        store: Arc<dyn DeviceStore>,
    ) -> Self {
        Self::new(
            local_user_id,
            local_device_id,
            transport,
            store,
            Arc::new(SystemClock),
            EngineConfig::default(),
        )
    }

    /// Subscribe to state change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VerificationEvent> {
        self.events.subscribe()
    }

    /// Feed a verification message received from `from_user` into the
    /// engine. Structurally invalid messages and messages for finished
    /// flows are dropped here, before touching any state.
    pub async fn route_incoming(&self, from_user: &str, content: VerificationContent) {
        if let Err(error) = content.validate() {
            warn!(
                from_user = %from_user,
                flow_id = %content.flow_id(),
                kind = content.kind(),
                error = %error,
                "Dropping structurally invalid message"
            );
            return;
        }
        let flow_id = content.flow_id().to_owned();
        if self.is_finished(from_user, &flow_id).await {
            debug!(
                from_user = %from_user,
                flow_id = %flow_id,
                kind = content.kind(),
                "Dropping message for a finished flow"
            );
            return;
        }
        // Requests and readies fan out to all of a user's devices, so in
        // self verification our own copies come back to us.
        let from_our_device = from_user == self.local_user_id
            && match &content {
                VerificationContent::Request(c) => c.from_device == self.local_device_id,
                VerificationContent::Ready(c) => c.from_device == self.local_device_id,
                VerificationContent::Start(c) => c.from_device == self.local_device_id,
                _ => false,
            };
        if from_our_device {
            debug!(flow_id = %flow_id, kind = content.kind(), "Ignoring our own echo");
            return;
        }
        match content {
            VerificationContent::Request(request) => self.handle_request(from_user, request).await,
            VerificationContent::Ready(ready) => self.handle_ready(from_user, ready).await,
            VerificationContent::Start(start) => self.handle_start(from_user, start).await,
            VerificationContent::Accept(accept) => self.handle_accept(from_user, accept).await,
            VerificationContent::Key(key) => self.handle_key(from_user, key).await,
            VerificationContent::Mac(mac) => self.handle_mac(from_user, mac).await,
            VerificationContent::Cancel(cancel) => self.handle_cancel(from_user, cancel).await,
            VerificationContent::Done(done) => self.handle_done(from_user, done).await,
        }
    }

    /// Ask `other_user_id` to verify, advertising `methods`. At most one
    /// live verification per peer: if one exists it is cancelled and this
    /// call fails, so a retry starts from a clean slate.
    pub async fn request_verification(
        &self,
        other_user_id: &str,
        methods: Vec<VerificationMethod>,
    ) -> Result<RequestSnapshot> {
        if self.cancel_all_with(other_user_id).await {
            warn!(
                other_user = %other_user_id,
                "Verification already in progress, cancelled it instead of starting another"
            );
            return Err(VerificationError::ExistingVerification {
                other_user: other_user_id.to_owned(),
            });
        }

        let flow_id = Uuid::new_v4().to_string();
        let request = VerificationRequest::new_outgoing(
            flow_id.clone(),
            other_user_id.to_owned(),
            methods.clone(),
        );
        let created = request.snapshot();
        let handle = Arc::new(Mutex::new(Flow { request, transaction: None, shown_qr: None }));
        self.flows
            .write()
            .await
            .insert((other_user_id.to_owned(), flow_id.clone()), Arc::clone(&handle));
        info!(other_user = %other_user_id, flow_id = %flow_id, "Requesting verification");
        self.emit(VerificationEvent::RequestCreated(created));

        let mut flow = handle.lock().await;
        let content = VerificationContent::Request(RequestContent {
            from_device: self.local_device_id.clone(),
            transaction_id: flow_id,
            methods,
            timestamp: self.clock.now_ms(),
        });
        self.send_all(&mut flow, vec![content]).await;
        Ok(flow.request.snapshot())
    }

    /// Answer an incoming request, advertising the methods this device is
    /// willing to perform.
    pub async fn accept_with_methods(
        &self,
        other_user_id: &str,
        flow_id: &str,
        methods: Vec<VerificationMethod>,
    ) -> Result<()> {
        let handle = self.user_flow(other_user_id, flow_id).await?;
        let mut flow = handle.lock().await;
        if !flow.request.mark_ready_sent(methods.clone()) {
            warn!(flow_id = %flow_id, "No incoming request awaiting an answer");
            return Ok(());
        }
        info!(other_user = %other_user_id, flow_id = %flow_id, "Accepting verification request");
        self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
        let content = VerificationContent::Ready(ReadyContent {
            from_device: self.local_device_id.clone(),
            transaction_id: flow_id.to_owned(),
            methods,
        });
        self.send_all(&mut flow, vec![content]).await;
        Ok(())
    }

    /// Start the short code exchange on a ready flow.
    pub async fn start_sas(&self, other_user_id: &str, flow_id: &str) -> Result<()> {
        let handle = self.user_flow(other_user_id, flow_id).await?;
        let mut flow = handle.lock().await;
        if !flow.request.is_ready() {
            warn!(flow_id = %flow_id, "Cannot start SAS before the request is ready");
            return Ok(());
        }
        let supported = flow
            .request
            .their_methods()
            .is_some_and(|methods| methods.contains(&VerificationMethod::SasV1));
        if !supported {
            return Err(VerificationError::UnsupportedMethod {
                method: VerificationMethod::SasV1,
            });
        }
        let Some(their_device) = flow.request.their_device().map(ToOwned::to_owned) else {
            warn!(flow_id = %flow_id, "Ready flow without a peer device");
            return Ok(());
        };

        let start = sas::build_start_content(&self.local_device_id, flow_id);
        let Ok(canonical) = sas::canonical_start(&start) else {
            self.cancel_flow(&mut flow, CancelInfo::local(CancelCode::UserError), true).await;
            return Ok(());
        };
        let transaction = SasTransaction::new_initiator(
            flow_id.to_owned(),
            self.local_user_id.clone(),
            self.local_device_id.clone(),
            other_user_id.to_owned(),
            their_device,
            canonical,
        );
        flow.request.mark_started(TransactionKind::Sas);
        let snapshot = transaction.snapshot();
        flow.transaction = Some(Transaction::Sas(transaction));
        info!(other_user = %other_user_id, flow_id = %flow_id, "Starting SAS verification");
        self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
        self.emit(VerificationEvent::TransactionCreated(TransactionSnapshot::Sas(snapshot)));
        self.send_all(&mut flow, vec![VerificationContent::Start(start)]).await;
        Ok(())
    }

    /// Accept the peer's SAS start, committing to our ephemeral key.
    pub async fn accept_sas(&self, other_user_id: &str, flow_id: &str) -> Result<()> {
        let handle = self.user_flow(other_user_id, flow_id).await?;
        let mut flow = handle.lock().await;
        let accept = match flow.transaction.as_mut() {
            Some(Transaction::Sas(transaction)) => transaction.accept(),
            _ => None,
        };
        let Some(accept) = accept else {
            warn!(flow_id = %flow_id, "No SAS start awaiting acceptance");
            return Ok(());
        };
        info!(other_user = %other_user_id, flow_id = %flow_id, "Accepted SAS start");
        self.emit_transaction_update(&flow);
        self.send_all(&mut flow, vec![VerificationContent::Accept(accept)]).await;
        Ok(())
    }

    /// The user compared the short codes and they match.
    pub async fn confirm_short_code(&self, other_user_id: &str, flow_id: &str) -> Result<()> {
        let handle = self.user_flow(other_user_id, flow_id).await?;
        let mut flow = handle.lock().await;
        let step = match flow.transaction.as_mut() {
            Some(Transaction::Sas(transaction)) => transaction.confirm(self.store.as_ref()),
            _ => {
                warn!(flow_id = %flow_id, "No SAS transaction to confirm");
                return Ok(());
            }
        };
        self.apply_sas_step(&mut flow, step, false).await;
        Ok(())
    }

    /// The user compared the short codes and they differ.
    pub async fn short_code_mismatch(&self, other_user_id: &str, flow_id: &str) -> Result<()> {
        self.cancel_verification(other_user_id, flow_id, CancelCode::MismatchedSas).await
    }

    /// Build the payload to render as a QR code for the peer to scan.
    ///
    /// Requires a ready flow whose peer advertised
    /// `m.qr_code.scan.v1`, and fingerprint keys for both devices.
    /// Repeated calls return the same payload.
    pub async fn generate_qr_payload(
        &self,
        other_user_id: &str,
        flow_id: &str,
    ) -> Result<QrPayload> {
        let handle = self.user_flow(other_user_id, flow_id).await?;
        let mut flow = handle.lock().await;
        if !flow.request.is_ready() {
            return Err(VerificationError::NotReady { flow_id: flow_id.to_owned() });
        }
        let can_scan = flow
            .request
            .their_methods()
            .is_some_and(|methods| methods.contains(&VerificationMethod::QrScanV1));
        if !can_scan {
            return Err(VerificationError::UnsupportedMethod {
                method: VerificationMethod::QrScanV1,
            });
        }
        if let Some(shown) = &flow.shown_qr {
            return Ok(shown.clone());
        }

        let our_key = self
            .store
            .device_key(&self.local_user_id, &self.local_device_id)
            .ok_or_else(|| VerificationError::MissingDeviceKey {
                user_id: self.local_user_id.clone(),
                device_id: self.local_device_id.clone(),
            })?;
        let their_device = flow.request.their_device().unwrap_or_default().to_owned();
        let their_key = self.store.device_key(other_user_id, &their_device).ok_or_else(|| {
            VerificationError::MissingDeviceKey {
                user_id: other_user_id.to_owned(),
                device_id: their_device.clone(),
            }
        })?;

        let payload = QrPayload {
            flow_id: flow_id.to_owned(),
            shower_user_id: self.local_user_id.clone(),
            shower_device_key: our_key,
            scanner_device_key: their_key,
            secret: random_secret(),
        };
        flow.shown_qr = Some(payload.clone());
        info!(other_user = %other_user_id, flow_id = %flow_id, "Generated QR verification payload");
        Ok(payload)
    }

    /// The user scanned the peer's QR code; `scanned` is its raw string
    /// content. A payload that does not match this flow and the known
    /// fingerprint keys cancels the verification.
    pub async fn scan_qr_code(
        &self,
        other_user_id: &str,
        flow_id: &str,
        scanned: &str,
    ) -> Result<()> {
        let handle = self.user_flow(other_user_id, flow_id).await?;
        let mut flow = handle.lock().await;
        if !flow.request.is_ready() {
            warn!(flow_id = %flow_id, "Cannot reciprocate before the request is ready");
            return Ok(());
        }
        let shows = flow
            .request
            .their_methods()
            .is_some_and(|methods| methods.contains(&VerificationMethod::QrShowV1));
        if !shows {
            return Err(VerificationError::UnsupportedMethod {
                method: VerificationMethod::QrShowV1,
            });
        }

        let payload = match QrPayload::parse(scanned) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(flow_id = %flow_id, error = %error, "Scanned payload failed to parse");
                self.cancel_flow(&mut flow, CancelInfo::local(CancelCode::QrCodeInvalid), true)
                    .await;
                return Ok(());
            }
        };
        if let Some(code) = self.vet_scanned_payload(&flow, other_user_id, flow_id, &payload) {
            self.cancel_flow(&mut flow, CancelInfo::local(code), true).await;
            return Ok(());
        }
        let Some(their_device) = flow.request.their_device().map(ToOwned::to_owned) else {
            warn!(flow_id = %flow_id, "Ready flow without a peer device");
            return Ok(());
        };

        let transaction = QrTransaction::new_scanner(
            flow_id.to_owned(),
            other_user_id.to_owned(),
            their_device,
        );
        flow.request.mark_started(TransactionKind::Qr);
        let snapshot = transaction.snapshot();
        flow.transaction = Some(Transaction::Qr(transaction));
        info!(other_user = %other_user_id, flow_id = %flow_id, "Scanned QR code, reciprocating");
        self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
        self.emit(VerificationEvent::TransactionCreated(TransactionSnapshot::Qr(snapshot)));

        let start = VerificationContent::Start(StartContent {
            from_device: self.local_device_id.clone(),
            method: VerificationMethod::ReciprocateV1,
            transaction_id: flow_id.to_owned(),
            key_agreement_protocols: None,
            hashes: None,
            message_authentication_codes: None,
            short_authentication_string: None,
            secret: Some(payload.secret),
        });
        self.send_all(&mut flow, vec![start]).await;
        Ok(())
    }

    /// The user confirmed the peer really scanned the displayed code.
    /// Completes the flow on this side and tells the scanner.
    pub async fn confirm_scanned(&self, other_user_id: &str, flow_id: &str) -> Result<()> {
        let handle = self.user_flow(other_user_id, flow_id).await?;
        let mut flow = handle.lock().await;
        let confirmed_device = match flow.transaction.as_mut() {
            Some(Transaction::Qr(transaction)) => {
                transaction.confirm_scanned().then(|| transaction.other_device_id.clone())
            }
            _ => None,
        };
        let Some(device_id) = confirmed_device else {
            warn!(flow_id = %flow_id, "No scanned QR code awaiting confirmation");
            return Ok(());
        };

        self.store.mark_verified(other_user_id, &device_id);
        info!(
            other_user = %other_user_id,
            device_id = %device_id,
            flow_id = %flow_id,
            "QR verification succeeded"
        );
        self.emit_transaction_update(&flow);
        if flow.request.mark_done() {
            self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
        }
        let done = VerificationContent::Done(DoneContent { transaction_id: flow_id.to_owned() });
        self.send_all(&mut flow, vec![done]).await;
        self.retire(other_user_id, flow_id).await;
        Ok(())
    }

    /// Cancel a live flow with the given code and notify the peer.
    /// Cancelling an already finished flow is a no-op.
    pub async fn cancel_verification(
        &self,
        other_user_id: &str,
        flow_id: &str,
        code: CancelCode,
    ) -> Result<()> {
        if self.is_finished(other_user_id, flow_id).await {
            return Ok(());
        }
        let Some(handle) = self.flow_handle(other_user_id, flow_id).await else {
            return Err(VerificationError::UnknownFlow {
                other_user: other_user_id.to_owned(),
                flow_id: flow_id.to_owned(),
            });
        };
        let mut flow = handle.lock().await;
        info!(other_user = %other_user_id, flow_id = %flow_id, code = %code, "Cancelling verification");
        self.cancel_flow(&mut flow, CancelInfo::local(code), true).await;
        Ok(())
    }

    /// Current snapshot of a live request, if any.
    pub async fn get_existing_verification_request(
        &self,
        other_user_id: &str,
        flow_id: &str,
    ) -> Option<RequestSnapshot> {
        let handle = self.flow_handle(other_user_id, flow_id).await?;
        let flow = handle.lock().await;
        Some(flow.request.snapshot())
    }

    /// Current snapshot of a live transaction, if one started.
    pub async fn get_existing_transaction(
        &self,
        other_user_id: &str,
        flow_id: &str,
    ) -> Option<TransactionSnapshot> {
        let handle = self.flow_handle(other_user_id, flow_id).await?;
        let flow = handle.lock().await;
        flow.transaction.as_ref().map(Transaction::snapshot)
    }

    async fn handle_request(&self, from_user: &str, request: RequestContent) {
        let now = self.clock.now_ms();
        let max_age = duration_ms(self.config.request_max_age);
        let max_skew = duration_ms(self.config.request_max_skew);
        if now.saturating_sub(request.timestamp) > max_age
            || request.timestamp.saturating_sub(now) > max_skew
        {
            debug!(
                from_user = %from_user,
                flow_id = %request.transaction_id,
                timestamp = request.timestamp,
                "Dropping request outside the freshness window"
            );
            return;
        }
        if self.flow_handle(from_user, &request.transaction_id).await.is_some() {
            debug!(
                from_user = %from_user,
                flow_id = %request.transaction_id,
                "Dropping duplicate verification request"
            );
            return;
        }
        // A second verification attempt while one is live kills both, so
        // neither side can be tricked into confirming the wrong one.
        if self.cancel_all_with(from_user).await {
            warn!(
                from_user = %from_user,
                flow_id = %request.transaction_id,
                "Verification collision, cancelling both attempts"
            );
            self.send_cancel_with_retry(
                from_user.to_owned(),
                Some(request.from_device),
                request.transaction_id.clone(),
                CancelCode::UnexpectedMessage,
            );
            self.finished
                .write()
                .await
                .insert((from_user.to_owned(), request.transaction_id));
            return;
        }

        let flow_id = request.transaction_id.clone();
        let incoming = VerificationRequest::new_incoming(
            request.transaction_id,
            from_user.to_owned(),
            request.from_device,
            request.methods,
        );
        let snapshot = incoming.snapshot();
        self.flows.write().await.insert(
            (from_user.to_owned(), flow_id.clone()),
            Arc::new(Mutex::new(Flow { request: incoming, transaction: None, shown_qr: None })),
        );
        info!(from_user = %from_user, flow_id = %flow_id, "Incoming verification request");
        self.emit(VerificationEvent::RequestCreated(snapshot));
    }

    async fn handle_ready(&self, from_user: &str, ready: ReadyContent) {
        let Some(handle) = self.flow_handle(from_user, &ready.transaction_id).await else {
            debug!(from_user = %from_user, flow_id = %ready.transaction_id, "Dropping ready for unknown flow");
            return;
        };
        let mut flow = handle.lock().await;
        if flow.request.on_ready_received(ready.from_device, ready.methods) {
            info!(from_user = %from_user, flow_id = %ready.transaction_id, "Verification request is ready");
            self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
        } else {
            warn!(
                from_user = %from_user,
                flow_id = %ready.transaction_id,
                "Ignoring ready outside the requested phase"
            );
        }
    }

    async fn handle_start(&self, from_user: &str, start: StartContent) {
        let Some(handle) = self.flow_handle(from_user, &start.transaction_id).await else {
            self.handle_direct_start(from_user, start).await;
            return;
        };
        let mut flow = handle.lock().await;
        if flow.request.is_terminal() {
            debug!(from_user = %from_user, flow_id = %start.transaction_id, "Dropping start for finished request");
            return;
        }
        match &start.method {
            VerificationMethod::SasV1 => self.handle_sas_start(&mut flow, from_user, start).await,
            VerificationMethod::ReciprocateV1 => {
                self.handle_reciprocate_start(&mut flow, from_user, start).await;
            }
            other => {
                warn!(
                    from_user = %from_user,
                    flow_id = %start.transaction_id,
                    method = %other,
                    "Start names a method we cannot perform"
                );
                self.cancel_flow(&mut flow, CancelInfo::local(CancelCode::UnknownMethod), true)
                    .await;
            }
        }
    }

    async fn handle_sas_start(&self, flow: &mut Flow, from_user: &str, start: StartContent) {
        let disposition = match &flow.transaction {
            Some(Transaction::Sas(existing)) if existing.we_started && !existing.is_terminal() => {
                StartDisposition::TieBreak
            }
            Some(Transaction::Sas(_)) => StartDisposition::Drop,
            Some(Transaction::Qr(_)) => StartDisposition::CancelConflict,
            None => StartDisposition::Fresh,
        };
        match disposition {
            StartDisposition::TieBreak => {
                if !self.their_start_wins(from_user, &start.from_device) {
                    debug!(
                        from_user = %from_user,
                        flow_id = %start.transaction_id,
                        "Concurrent starts, keeping ours"
                    );
                    return;
                }
                info!(
                    from_user = %from_user,
                    flow_id = %start.transaction_id,
                    "Concurrent starts, adopting theirs"
                );
                match self.responder_transaction(from_user, &start) {
                    Ok(transaction) => {
                        let snapshot = transaction.snapshot();
                        flow.transaction = Some(Transaction::Sas(transaction));
                        self.emit(VerificationEvent::TransactionUpdated(
                            TransactionSnapshot::Sas(snapshot),
                        ));
                    }
                    Err(code) => {
                        self.cancel_flow(flow, CancelInfo::local(code), true).await;
                    }
                }
            }
            StartDisposition::Drop => {
                debug!(
                    from_user = %from_user,
                    flow_id = %start.transaction_id,
                    "Dropping start for a transaction already in progress"
                );
            }
            StartDisposition::CancelConflict => {
                warn!(
                    from_user = %from_user,
                    flow_id = %start.transaction_id,
                    "SAS start while another transaction is running"
                );
                self.cancel_flow(flow, CancelInfo::local(CancelCode::UnexpectedMessage), true)
                    .await;
            }
            StartDisposition::Fresh => {
                if !flow.request.is_ready() {
                    warn!(
                        from_user = %from_user,
                        flow_id = %start.transaction_id,
                        "Start before the request was ready"
                    );
                    self.cancel_flow(flow, CancelInfo::local(CancelCode::UnexpectedMessage), true)
                        .await;
                    return;
                }
                match self.responder_transaction(from_user, &start) {
                    Ok(transaction) => {
                        flow.request.mark_started(TransactionKind::Sas);
                        let snapshot = transaction.snapshot();
                        flow.transaction = Some(Transaction::Sas(transaction));
                        info!(from_user = %from_user, flow_id = %start.transaction_id, "Peer started SAS");
                        self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
                        self.emit(VerificationEvent::TransactionCreated(
                            TransactionSnapshot::Sas(snapshot),
                        ));
                    }
                    Err(code) => {
                        warn!(
                            from_user = %from_user,
                            flow_id = %start.transaction_id,
                            code = %code,
                            "Rejecting SAS start"
                        );
                        self.cancel_flow(flow, CancelInfo::local(code), true).await;
                    }
                }
            }
        }
    }

    /// Negotiate against an incoming SAS start and build the responder
    /// side transaction.
    fn responder_transaction(
        &self,
        from_user: &str,
        start: &StartContent,
    ) -> std::result::Result<SasTransaction, CancelCode> {
        let lists = start.sas_lists().ok_or(CancelCode::UnknownMethod)?;
        let agreed = sas::negotiate(&lists)?;
        let canonical = sas::canonical_start(start).map_err(|_| CancelCode::UserError)?;
        Ok(SasTransaction::new_responder(
            start.transaction_id.clone(),
            self.local_user_id.clone(),
            self.local_device_id.clone(),
            from_user.to_owned(),
            start.from_device.clone(),
            agreed,
            canonical,
        ))
    }

    async fn handle_reciprocate_start(
        &self,
        flow: &mut Flow,
        from_user: &str,
        start: StartContent,
    ) {
        if flow.transaction.is_some() {
            warn!(
                from_user = %from_user,
                flow_id = %start.transaction_id,
                "Reciprocation while another transaction is running"
            );
            self.cancel_flow(flow, CancelInfo::local(CancelCode::UnexpectedMessage), true).await;
            return;
        }
        if !flow.request.is_ready() {
            warn!(
                from_user = %from_user,
                flow_id = %start.transaction_id,
                "Reciprocation before the request was ready"
            );
            self.cancel_flow(flow, CancelInfo::local(CancelCode::UnexpectedMessage), true).await;
            return;
        }
        let Some(shown) = flow.shown_qr.clone() else {
            warn!(
                from_user = %from_user,
                flow_id = %start.transaction_id,
                "Reciprocation for a QR code we never displayed"
            );
            self.cancel_flow(flow, CancelInfo::local(CancelCode::UnexpectedMessage), true).await;
            return;
        };

        let transaction = QrTransaction::new_shower(
            start.transaction_id.clone(),
            from_user.to_owned(),
            start.from_device.clone(),
        );
        flow.request.mark_started(TransactionKind::Qr);
        self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
        self.emit(VerificationEvent::TransactionCreated(TransactionSnapshot::Qr(
            transaction.snapshot_with_phase(QrPhase::Started),
        )));

        let secret_matches = start
            .secret
            .as_deref()
            .is_some_and(|secret| constant_time_eq(secret, &shown.secret));
        flow.transaction = Some(Transaction::Qr(transaction));
        if secret_matches {
            info!(
                from_user = %from_user,
                flow_id = %start.transaction_id,
                "Peer returned our QR secret, awaiting local confirmation"
            );
            self.emit_transaction_update(flow);
        } else {
            warn!(
                from_user = %from_user,
                flow_id = %start.transaction_id,
                "Reciprocation secret does not match the displayed code"
            );
            self.cancel_flow(flow, CancelInfo::local(CancelCode::MismatchedSas), true).await;
        }
    }

    /// A start without a preceding request opens a flow of its own, for
    /// peers speaking the transaction-only dialect.
    async fn handle_direct_start(&self, from_user: &str, start: StartContent) {
        if !matches!(start.method, VerificationMethod::SasV1) {
            warn!(
                from_user = %from_user,
                flow_id = %start.transaction_id,
                method = %start.method,
                "Dropping bare start we cannot honor"
            );
            let code = if matches!(start.method, VerificationMethod::ReciprocateV1) {
                CancelCode::UnexpectedMessage
            } else {
                CancelCode::UnknownMethod
            };
            self.send_cancel_with_retry(
                from_user.to_owned(),
                Some(start.from_device),
                start.transaction_id.clone(),
                code,
            );
            self.finished.write().await.insert((from_user.to_owned(), start.transaction_id));
            return;
        }
        match self.responder_transaction(from_user, &start) {
            Ok(transaction) => {
                let request = VerificationRequest::new_direct_start(
                    start.transaction_id.clone(),
                    from_user.to_owned(),
                    start.from_device,
                    TransactionKind::Sas,
                );
                let request_snapshot = request.snapshot();
                let transaction_snapshot = transaction.snapshot();
                self.flows.write().await.insert(
                    (from_user.to_owned(), start.transaction_id.clone()),
                    Arc::new(Mutex::new(Flow {
                        request,
                        transaction: Some(Transaction::Sas(transaction)),
                        shown_qr: None,
                    })),
                );
                info!(from_user = %from_user, flow_id = %start.transaction_id, "Peer started SAS directly");
                self.emit(VerificationEvent::RequestCreated(request_snapshot));
                self.emit(VerificationEvent::TransactionCreated(TransactionSnapshot::Sas(
                    transaction_snapshot,
                )));
            }
            Err(code) => {
                warn!(
                    from_user = %from_user,
                    flow_id = %start.transaction_id,
                    code = %code,
                    "Rejecting bare SAS start"
                );
                self.send_cancel_with_retry(
                    from_user.to_owned(),
                    Some(start.from_device),
                    start.transaction_id.clone(),
                    code,
                );
                self.finished.write().await.insert((from_user.to_owned(), start.transaction_id));
            }
        }
    }

    async fn handle_accept(&self, from_user: &str, accept: AcceptContent) {
        let Some(handle) = self.flow_handle(from_user, &accept.transaction_id).await else {
            debug!(from_user = %from_user, flow_id = %accept.transaction_id, "Dropping accept for unknown flow");
            return;
        };
        let mut flow = handle.lock().await;
        let step = match flow.transaction.as_mut() {
            Some(Transaction::Sas(transaction)) => transaction.on_accept(&accept),
            _ => {
                debug!(flow_id = %accept.transaction_id, "Dropping accept without a SAS transaction");
                return;
            }
        };
        self.apply_sas_step(&mut flow, step, false).await;
    }

    async fn handle_key(&self, from_user: &str, key: KeyContent) {
        let Some(handle) = self.flow_handle(from_user, &key.transaction_id).await else {
            debug!(from_user = %from_user, flow_id = %key.transaction_id, "Dropping key for unknown flow");
            return;
        };
        let mut flow = handle.lock().await;
        let step = match flow.transaction.as_mut() {
            Some(Transaction::Sas(transaction)) => transaction.on_key(&key),
            _ => {
                debug!(flow_id = %key.transaction_id, "Dropping key without a SAS transaction");
                return;
            }
        };
        self.apply_sas_step(&mut flow, step, true).await;
    }

    async fn handle_mac(&self, from_user: &str, mac: MacContent) {
        let Some(handle) = self.flow_handle(from_user, &mac.transaction_id).await else {
            debug!(from_user = %from_user, flow_id = %mac.transaction_id, "Dropping mac for unknown flow");
            return;
        };
        let mut flow = handle.lock().await;
        let step = match flow.transaction.as_mut() {
            Some(Transaction::Sas(transaction)) => transaction.on_mac(mac, self.store.as_ref()),
            _ => {
                debug!(from_user = %from_user, "Dropping mac without a SAS transaction");
                return;
            }
        };
        self.apply_sas_step(&mut flow, step, false).await;
    }

    async fn handle_cancel(&self, from_user: &str, cancel: CancelContent) {
        let Some(handle) = self.flow_handle(from_user, &cancel.transaction_id).await else {
            debug!(from_user = %from_user, flow_id = %cancel.transaction_id, "Dropping cancel for unknown flow");
            return;
        };
        let mut flow = handle.lock().await;
        // The requester tells our other sessions one of them took over.
        if cancel.code == CancelCode::AcceptedByAnotherDevice
            && !flow.request.we_started
            && flow.request.mark_handled_by_other_session()
        {
            info!(flow_id = %cancel.transaction_id, "Request was handled by another of our sessions");
            self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
            self.retire(from_user, &cancel.transaction_id).await;
            return;
        }
        info!(
            from_user = %from_user,
            flow_id = %cancel.transaction_id,
            code = %cancel.code,
            "Peer cancelled verification"
        );
        self.cancel_flow(&mut flow, CancelInfo::remote(cancel.code, cancel.reason), false).await;
    }

    async fn handle_done(&self, from_user: &str, done: DoneContent) {
        let Some(handle) = self.flow_handle(from_user, &done.transaction_id).await else {
            debug!(from_user = %from_user, flow_id = %done.transaction_id, "Dropping done for unknown flow");
            return;
        };
        let mut flow = handle.lock().await;
        let completed_device = match flow.transaction.as_mut() {
            Some(Transaction::Qr(transaction)) => {
                transaction.on_done().then(|| transaction.other_device_id.clone())
            }
            Some(Transaction::Sas(_)) => {
                debug!(flow_id = %done.transaction_id, "SAS completion rides on MACs, ignoring done");
                None
            }
            None => {
                debug!(flow_id = %done.transaction_id, "Dropping done without a transaction");
                None
            }
        };
        let Some(device_id) = completed_device else {
            return;
        };

        // The code owner confirmed our reciprocation; they are who the
        // scanned payload said.
        self.store.mark_verified(&flow.request.other_user_id, &device_id);
        info!(
            other_user = %flow.request.other_user_id,
            device_id = %device_id,
            flow_id = %done.transaction_id,
            "QR verification succeeded"
        );
        self.emit_transaction_update(&flow);
        if flow.request.mark_done() {
            self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
        }
        let reply = VerificationContent::Done(DoneContent {
            transaction_id: done.transaction_id.clone(),
        });
        self.send_all(&mut flow, vec![reply]).await;
        self.retire(from_user, &done.transaction_id).await;
    }

    /// Act on a SAS state machine result: publish snapshots, send
    /// replies, record trust or cancel. `from_key_exchange` marks steps
    /// produced by an incoming key, which pass through the transient
    /// key-exchanged phase before the codes become presentable.
    async fn apply_sas_step(&self, flow: &mut Flow, step: SasStep, from_key_exchange: bool) {
        match step {
            SasStep::Send(messages) => {
                if from_key_exchange {
                    self.emit_key_exchanged(flow);
                }
                self.emit_transaction_update(flow);
                self.send_all(flow, messages).await;
            }
            SasStep::Advanced => {
                if from_key_exchange {
                    self.emit_key_exchanged(flow);
                }
                self.emit_transaction_update(flow);
            }
            SasStep::Completed { send, verified_devices } => {
                for device_id in &verified_devices {
                    self.store.mark_verified(&flow.request.other_user_id, device_id);
                }
                info!(
                    other_user = %flow.request.other_user_id,
                    flow_id = %flow.request.flow_id,
                    devices = ?verified_devices,
                    "SAS verification succeeded"
                );
                self.emit_transaction_update(flow);
                if flow.request.mark_done() {
                    self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
                }
                self.send_all(flow, send).await;
                let other_user = flow.request.other_user_id.clone();
                let flow_id = flow.request.flow_id.clone();
                self.retire(&other_user, &flow_id).await;
            }
            SasStep::Ignored { reason } => {
                debug!(flow_id = %flow.request.flow_id, reason, "Ignoring out-of-place SAS message");
            }
            SasStep::Fail(code) => {
                warn!(flow_id = %flow.request.flow_id, code = %code, "SAS failure, cancelling");
                self.cancel_flow(flow, CancelInfo::local(code), true).await;
            }
        }
    }

    fn emit_key_exchanged(&self, flow: &Flow) {
        if let Some(Transaction::Sas(transaction)) = &flow.transaction {
            if transaction.phase() == SasPhase::ShortCodeReady {
                self.emit(VerificationEvent::TransactionUpdated(TransactionSnapshot::Sas(
                    transaction.snapshot_with_phase(SasPhase::KeyExchanged),
                )));
            }
        }
    }

    fn emit_transaction_update(&self, flow: &Flow) {
        if let Some(transaction) = &flow.transaction {
            self.emit(VerificationEvent::TransactionUpdated(transaction.snapshot()));
        }
    }

    fn emit(&self, event: VerificationEvent) {
        // Nobody subscribed is fine.
        let _ = self.events.send(event);
    }

    /// Look up a live flow handle. The map lock is released before the
    /// caller locks the flow itself.
    async fn flow_handle(&self, other_user: &str, flow_id: &str) -> Option<Arc<Mutex<Flow>>> {
        self.flows
            .read()
            .await
            .get(&(other_user.to_owned(), flow_id.to_owned()))
            .cloned()
    }

    /// Flow handle for a user-initiated operation, distinguishing unknown
    /// ids from ids burned by a finished verification.
    async fn user_flow(&self, other_user: &str, flow_id: &str) -> Result<Arc<Mutex<Flow>>> {
        if let Some(handle) = self.flow_handle(other_user, flow_id).await {
            return Ok(handle);
        }
        if self.is_finished(other_user, flow_id).await {
            return Err(VerificationError::FlowIdReused { flow_id: flow_id.to_owned() });
        }
        Err(VerificationError::UnknownFlow {
            other_user: other_user.to_owned(),
            flow_id: flow_id.to_owned(),
        })
    }

    async fn is_finished(&self, other_user: &str, flow_id: &str) -> bool {
        self.finished
            .read()
            .await
            .contains(&(other_user.to_owned(), flow_id.to_owned()))
    }

    /// Drop a flow from the live map and burn its id.
    async fn retire(&self, other_user: &str, flow_id: &str) {
        let key = (other_user.to_owned(), flow_id.to_owned());
        self.flows.write().await.remove(&key);
        self.finished.write().await.insert(key);
    }

    /// Cancel every non-terminal flow with a user. Returns whether any
    /// was live.
    async fn cancel_all_with(&self, other_user: &str) -> bool {
        let handles: Vec<Arc<Mutex<Flow>>> = self
            .flows
            .read()
            .await
            .iter()
            .filter(|((user, _), _)| user == other_user)
            .map(|(_, handle)| Arc::clone(handle))
            .collect();
        let mut any = false;
        for handle in handles {
            let mut flow = handle.lock().await;
            if flow.request.is_terminal() {
                continue;
            }
            any = true;
            self.cancel_flow(&mut flow, CancelInfo::local(CancelCode::UnexpectedMessage), true)
                .await;
        }
        any
    }

    /// Move a flow to cancelled, publish the final snapshots, notify the
    /// peer when the cancel originates here, and retire the flow.
    async fn cancel_flow(&self, flow: &mut Flow, info: CancelInfo, notify_peer: bool) {
        let transaction_changed = flow
            .transaction
            .as_mut()
            .is_some_and(|transaction| transaction.cancel(info.clone()));
        let request_changed = flow.request.mark_cancelled(info.clone());
        if !request_changed && !transaction_changed {
            return;
        }
        if transaction_changed {
            self.emit_transaction_update(flow);
        }
        if request_changed {
            self.emit(VerificationEvent::RequestUpdated(flow.request.snapshot()));
        }
        if notify_peer {
            self.send_cancel_with_retry(
                flow.request.other_user_id.clone(),
                flow.request.their_device().map(ToOwned::to_owned),
                flow.request.flow_id.clone(),
                info.code,
            );
        }
        let other_user = flow.request.other_user_id.clone();
        let flow_id = flow.request.flow_id.clone();
        self.retire(&other_user, &flow_id).await;
    }

    /// Send messages to the flow's peer device. A transport failure
    /// degrades the flow into a local user-error cancel; the messages
    /// after the failed one are not attempted.
    async fn send_all(&self, flow: &mut Flow, messages: Vec<VerificationContent>) {
        let to_user = flow.request.other_user_id.clone();
        let to_device = flow.request.their_device().map(ToOwned::to_owned);
        for message in messages {
            let kind = message.kind();
            if let Err(error) =
                self.transport.send_verification(&to_user, to_device.as_deref(), message).await
            {
                warn!(
                    to_user = %to_user,
                    kind,
                    error = %error,
                    "Send failed, cancelling verification"
                );
                self.cancel_flow(flow, CancelInfo::local(CancelCode::UserError), true).await;
                return;
            }
        }
    }

    /// Fire-and-forget cancel delivery. The flow is already terminal
    /// locally, so delivery failures only cost the peer a timeout; still,
    /// a few attempts are made.
    fn send_cancel_with_retry(
        &self,
        to_user: String,
        to_device: Option<String>,
        flow_id: String,
        code: CancelCode,
    ) {
        let transport = Arc::clone(&self.transport);
        let attempts = self.config.cancel_retry_attempts.max(1);
        let content = VerificationContent::Cancel(CancelContent {
            transaction_id: flow_id.clone(),
            reason: code.human_readable().to_owned(),
            code,
        });
        tokio::spawn(async move {
            for attempt in 1..=attempts {
                match transport
                    .send_verification(&to_user, to_device.as_deref(), content.clone())
                    .await
                {
                    Ok(()) => return,
                    Err(error) => {
                        warn!(
                            to_user = %to_user,
                            flow_id = %flow_id,
                            attempt,
                            error = %error,
                            "Failed to send cancel"
                        );
                    }
                }
            }
        });
    }

    /// Concurrent-start tie break: the start from the lexicographically
    /// smaller user survives, falling back to the device id between a
    /// user's own devices.
    fn their_start_wins(&self, other_user_id: &str, other_device_id: &str) -> bool {
        match other_user_id.cmp(self.local_user_id.as_str()) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => other_device_id < self.local_device_id.as_str(),
        }
    }

    fn vet_scanned_payload(
        &self,
        flow: &Flow,
        other_user_id: &str,
        flow_id: &str,
        payload: &QrPayload,
    ) -> Option<CancelCode> {
        if payload.flow_id != flow_id {
            warn!(flow_id = %flow_id, scanned_flow = %payload.flow_id, "Scanned code belongs to another flow");
            return Some(CancelCode::QrCodeInvalid);
        }
        if payload.shower_user_id != other_user_id {
            warn!(
                flow_id = %flow_id,
                scanned_user = %payload.shower_user_id,
                "Scanned code was issued by a different user"
            );
            return Some(CancelCode::MismatchedUser);
        }
        let Some(their_device) = flow.request.their_device() else {
            return Some(CancelCode::QrCodeInvalid);
        };
        let Some(their_key) = self.store.device_key(other_user_id, their_device) else {
            warn!(flow_id = %flow_id, device_id = %their_device, "No fingerprint key for the code owner");
            return Some(CancelCode::MismatchedKeys);
        };
        if !constant_time_eq(&payload.shower_device_key, &their_key) {
            warn!(flow_id = %flow_id, "Scanned code carries an unexpected owner key");
            return Some(CancelCode::MismatchedKeys);
        }
        let Some(our_key) = self.store.device_key(&self.local_user_id, &self.local_device_id)
        else {
            return Some(CancelCode::MismatchedKeys);
        };
        if !constant_time_eq(&payload.scanner_device_key, &our_key) {
            warn!(flow_id = %flow_id, "Scanned code was meant for a different scanner");
            return Some(CancelCode::MismatchedKeys);
        }
        None
    }
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
