#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Request lifecycle behaviour that sits above any one transaction kind.
//!
//! Covers crossing requests, bare starts without a preceding request,
//! requests answered by another session, out-of-phase user operations,
//! transport failure and the handling of junk traffic.

use vouch_engine::{
    CancelCode, RequestPhase, SasPhase, TransactionSnapshot, VerificationError, VerificationMethod,
};
use vouch_proto::{
    CancelContent, DoneContent, KeyContent, ReadyContent, StartContent, VerificationContent,
    algorithm,
};

mod common;
use common::{ALICE, BOB, BOB_DEVICE, TestPair, drain_events, request_cancels};

/// A well-formed SAS start for flows that never saw a request.
fn bare_sas_start(flow_id: &str) -> VerificationContent {
    VerificationContent::Start(StartContent {
        from_device: BOB_DEVICE.to_owned(),
        method: VerificationMethod::SasV1,
        transaction_id: flow_id.to_owned(),
        key_agreement_protocols: Some(vec![
            algorithm::KEY_AGREEMENT_CURVE25519_HKDF_SHA256.to_owned(),
        ]),
        hashes: Some(vec![algorithm::HASH_SHA256.to_owned()]),
        message_authentication_codes: Some(vec![algorithm::MAC_HKDF_HMAC_SHA256.to_owned()]),
        short_authentication_string: Some(vec![
            algorithm::SHORT_CODE_DECIMAL.to_owned(),
            algorithm::SHORT_CODE_EMOJI.to_owned(),
        ]),
        secret: None,
    })
}

#[tokio::test]
async fn crossing_requests_cancel_cleanly() {
    let mut pair = TestPair::new();
    let snapshot =
        pair.alice.request_verification(BOB, vec![VerificationMethod::SasV1]).await.unwrap();
    pair.pump().await;

    // Bob now holds alice's request; starting his own is refused and the
    // stale one is swept away on both sides.
    let error = pair
        .bob
        .request_verification(ALICE, vec![VerificationMethod::SasV1])
        .await
        .unwrap_err();
    assert!(matches!(error, VerificationError::ExistingVerification { .. }));
    pair.pump().await;

    assert!(pair.alice.get_existing_verification_request(BOB, &snapshot.flow_id).await.is_none());
    assert!(pair.bob.get_existing_verification_request(ALICE, &snapshot.flow_id).await.is_none());
    let alice_cancels = request_cancels(&mut pair.alice_events);
    assert!(
        alice_cancels.contains(&(CancelCode::UnexpectedMessage, false)),
        "got {alice_cancels:?}"
    );
}

#[tokio::test]
async fn bare_start_opens_a_flow_without_a_request() {
    let mut pair = TestPair::new();
    pair.alice.route_incoming(BOB, bare_sas_start("legacy-1")).await;

    let request = pair.alice.get_existing_verification_request(BOB, "legacy-1").await.unwrap();
    assert_eq!(request.phase, RequestPhase::Started);
    assert!(!request.we_started);
    let TransactionSnapshot::Sas(transaction) =
        pair.alice.get_existing_transaction(BOB, "legacy-1").await.unwrap()
    else {
        panic!("expected a SAS transaction");
    };
    assert_eq!(transaction.phase, SasPhase::Started);
    assert!(!transaction.we_started);

    // Accepting answers the starting device directly.
    assert!(pair.drain_alice_outbox().is_empty());
    pair.alice.accept_sas(BOB, "legacy-1").await.unwrap();
    let deliveries = pair.drain_alice_outbox();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].to_device.as_deref(), Some(BOB_DEVICE));
    assert!(matches!(deliveries[0].content, VerificationContent::Accept(_)));
}

#[tokio::test]
async fn request_accepted_by_another_session_parks_quietly() {
    let mut pair = TestPair::new();
    let snapshot =
        pair.alice.request_verification(BOB, vec![VerificationMethod::SasV1]).await.unwrap();
    pair.pump().await;
    drain_events(&mut pair.bob_events);

    // Another of bob's sessions answered; this one steps aside.
    pair.bob
        .route_incoming(
            ALICE,
            VerificationContent::Cancel(CancelContent {
                transaction_id: snapshot.flow_id.clone(),
                code: CancelCode::AcceptedByAnotherDevice,
                reason: "accepted by another device".to_owned(),
            }),
        )
        .await;

    let phases: Vec<RequestPhase> = drain_events(&mut pair.bob_events)
        .iter()
        .filter_map(|event| match event {
            vouch_engine::VerificationEvent::RequestUpdated(snapshot) => Some(snapshot.phase),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec![RequestPhase::HandledByOtherSession]);
    assert!(pair.bob.get_existing_verification_request(ALICE, &snapshot.flow_id).await.is_none());

    // Stepping aside is silent and leaves alice's request untouched.
    assert!(pair.drain_bob_outbox().is_empty());
    let request =
        pair.alice.get_existing_verification_request(BOB, &snapshot.flow_id).await.unwrap();
    assert_eq!(request.phase, RequestPhase::Requested);
}

#[tokio::test]
async fn out_of_phase_operations_are_noops() {
    let mut pair = TestPair::new();
    let snapshot =
        pair.alice.request_verification(BOB, vec![VerificationMethod::SasV1]).await.unwrap();
    let flow_id = snapshot.flow_id;

    // None of these make sense before the peer answered; all are
    // swallowed without disturbing the request.
    pair.alice.start_sas(BOB, &flow_id).await.unwrap();
    pair.alice.accept_sas(BOB, &flow_id).await.unwrap();
    pair.alice.confirm_short_code(BOB, &flow_id).await.unwrap();
    pair.alice.confirm_scanned(BOB, &flow_id).await.unwrap();
    pair.alice.scan_qr_code(BOB, &flow_id, "VOUCH1|a|b|c|d|e").await.unwrap();
    pair.alice.accept_with_methods(BOB, &flow_id, vec![VerificationMethod::SasV1]).await.unwrap();

    let request = pair.alice.get_existing_verification_request(BOB, &flow_id).await.unwrap();
    assert_eq!(request.phase, RequestPhase::Requested);
    assert!(pair.alice.get_existing_transaction(BOB, &flow_id).await.is_none());
}

#[tokio::test]
async fn transport_failure_degrades_into_a_local_cancel() {
    let mut pair = TestPair::new();
    let flow_id = pair.ready_flow(vec![VerificationMethod::SasV1]).await;

    pair.alice_transport.set_failing(true);
    pair.alice.start_sas(BOB, &flow_id).await.unwrap();
    pair.pump().await;

    assert!(pair.alice.get_existing_verification_request(BOB, &flow_id).await.is_none());
    let alice_cancels = request_cancels(&mut pair.alice_events);
    assert!(alice_cancels.contains(&(CancelCode::UserError, true)), "got {alice_cancels:?}");
}

#[tokio::test]
async fn messages_for_unknown_flows_are_dropped() {
    let mut pair = TestPair::new();

    pair.alice
        .route_incoming(
            BOB,
            VerificationContent::Key(KeyContent {
                transaction_id: "ghost".to_owned(),
                key: "AAAA".to_owned(),
            }),
        )
        .await;
    pair.alice
        .route_incoming(
            BOB,
            VerificationContent::Done(DoneContent { transaction_id: "ghost".to_owned() }),
        )
        .await;
    pair.alice
        .route_incoming(
            BOB,
            VerificationContent::Cancel(CancelContent {
                transaction_id: "ghost".to_owned(),
                code: CancelCode::User,
                reason: "cancelled by user".to_owned(),
            }),
        )
        .await;

    assert!(drain_events(&mut pair.alice_events).is_empty());
    assert!(pair.alice.get_existing_verification_request(BOB, "ghost").await.is_none());
}

#[tokio::test]
async fn structurally_invalid_messages_never_touch_state() {
    let mut pair = TestPair::new();
    let snapshot =
        pair.alice.request_verification(BOB, vec![VerificationMethod::SasV1]).await.unwrap();
    pair.pump().await;
    drain_events(&mut pair.alice_events);

    // A ready advertising no methods at all is dropped at the door.
    pair.alice
        .route_incoming(
            BOB,
            VerificationContent::Ready(ReadyContent {
                from_device: BOB_DEVICE.to_owned(),
                transaction_id: snapshot.flow_id.clone(),
                methods: vec![],
            }),
        )
        .await;

    assert!(drain_events(&mut pair.alice_events).is_empty());
    let request =
        pair.alice.get_existing_verification_request(BOB, &snapshot.flow_id).await.unwrap();
    assert_eq!(request.phase, RequestPhase::Requested);
}
