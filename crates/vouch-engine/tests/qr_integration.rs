#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! QR reciprocation flows between a showing and a scanning device.
//!
//! Covers the show/scan/confirm happy path, payload vetting against the
//! device store, tampered and malformed codes, and method gating.

use vouch_engine::{
    CancelCode, DeviceStore, QrPhase, TransactionSnapshot, VerificationError, VerificationMethod,
};
use vouch_proto::{StartContent, VerificationContent};

mod common;
use common::{ALICE, ALICE_DEVICE, BOB, BOB_DEVICE, TestPair, request_cancels};

fn qr_methods() -> Vec<VerificationMethod> {
    vec![
        VerificationMethod::QrShowV1,
        VerificationMethod::QrScanV1,
        VerificationMethod::ReciprocateV1,
    ]
}

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test]
async fn qr_show_and_scan_verifies_both_devices() {
    let mut pair = TestPair::new();
    let flow_id = pair.ready_flow(qr_methods()).await;

    // Alice renders the code. Asking twice must not rotate the secret.
    let payload = pair.alice.generate_qr_payload(BOB, &flow_id).await.unwrap();
    let again = pair.alice.generate_qr_payload(BOB, &flow_id).await.unwrap();
    assert_eq!(payload, again);
    assert!(payload.encode().starts_with("VOUCH1|"));

    pair.bob.scan_qr_code(ALICE, &flow_id, &payload.encode()).await.unwrap();
    pair.pump().await;

    // The shower saw the reciprocation and waits for the user to confirm.
    let TransactionSnapshot::Qr(alice_tx) =
        pair.alice.get_existing_transaction(BOB, &flow_id).await.unwrap()
    else {
        panic!("expected a QR transaction on alice's side");
    };
    assert_eq!(alice_tx.phase, QrPhase::Scanned);
    assert!(!alice_tx.we_scanned);
    assert!(!pair.bob_store.is_verified(ALICE, ALICE_DEVICE));

    // Confirming completes the shower side immediately.
    pair.alice.confirm_scanned(BOB, &flow_id).await.unwrap();
    assert!(pair.alice_store.is_verified(BOB, BOB_DEVICE));

    // The done closes the scanner side.
    pair.pump().await;
    assert!(pair.bob_store.is_verified(ALICE, ALICE_DEVICE));
    assert!(pair.alice.get_existing_verification_request(BOB, &flow_id).await.is_none());
    assert!(pair.bob.get_existing_verification_request(ALICE, &flow_id).await.is_none());
}

// =========================================================================
// Vetting and tampering
// =========================================================================

#[tokio::test]
async fn altered_secret_is_rejected_by_the_shower() {
    let mut pair = TestPair::new();
    let flow_id = pair.ready_flow(qr_methods()).await;
    let payload = pair.alice.generate_qr_payload(BOB, &flow_id).await.unwrap();

    // The scanner cannot tell the secret is wrong; the shower can.
    let mut tampered = payload.clone();
    tampered.secret = "bm90LXRoZS1zZWNyZXQ".to_owned();
    pair.bob.scan_qr_code(ALICE, &flow_id, &tampered.encode()).await.unwrap();
    pair.pump().await;

    let alice_cancels = request_cancels(&mut pair.alice_events);
    assert!(
        alice_cancels.contains(&(CancelCode::MismatchedSas, true)),
        "got {alice_cancels:?}"
    );
    let bob_cancels = request_cancels(&mut pair.bob_events);
    assert!(bob_cancels.contains(&(CancelCode::MismatchedSas, false)), "got {bob_cancels:?}");
    assert!(!pair.alice_store.is_verified(BOB, BOB_DEVICE));
    assert!(!pair.bob_store.is_verified(ALICE, ALICE_DEVICE));
}

#[tokio::test]
async fn code_for_another_user_is_rejected_by_the_scanner() {
    let mut pair = TestPair::new();
    let flow_id = pair.ready_flow(qr_methods()).await;
    let payload = pair.alice.generate_qr_payload(BOB, &flow_id).await.unwrap();

    let mut forged = payload.clone();
    forged.shower_user_id = "@carol:example.org".to_owned();
    pair.bob.scan_qr_code(ALICE, &flow_id, &forged.encode()).await.unwrap();
    pair.pump().await;

    let bob_cancels = request_cancels(&mut pair.bob_events);
    assert!(bob_cancels.contains(&(CancelCode::MismatchedUser, true)), "got {bob_cancels:?}");
    assert!(pair.bob.get_existing_transaction(ALICE, &flow_id).await.is_none());
    assert!(pair.bob.get_existing_verification_request(ALICE, &flow_id).await.is_none());
    let alice_cancels = request_cancels(&mut pair.alice_events);
    assert!(
        alice_cancels.contains(&(CancelCode::MismatchedUser, false)),
        "got {alice_cancels:?}"
    );
}

#[tokio::test]
async fn forged_fingerprint_key_is_rejected_by_the_scanner() {
    let mut pair = TestPair::new();
    let flow_id = pair.ready_flow(qr_methods()).await;
    let payload = pair.alice.generate_qr_payload(BOB, &flow_id).await.unwrap();

    let mut forged = payload.clone();
    forged.shower_device_key = "some-other-key".to_owned();
    pair.bob.scan_qr_code(ALICE, &flow_id, &forged.encode()).await.unwrap();
    pair.pump().await;

    let bob_cancels = request_cancels(&mut pair.bob_events);
    assert!(bob_cancels.contains(&(CancelCode::MismatchedKeys, true)), "got {bob_cancels:?}");
    assert!(!pair.alice_store.is_verified(BOB, BOB_DEVICE));
    assert!(!pair.bob_store.is_verified(ALICE, ALICE_DEVICE));
}

#[tokio::test]
async fn unparseable_scan_cancels_the_flow() {
    let mut pair = TestPair::new();
    let flow_id = pair.ready_flow(qr_methods()).await;
    pair.alice.generate_qr_payload(BOB, &flow_id).await.unwrap();

    pair.bob.scan_qr_code(ALICE, &flow_id, "https://example.org/?x=1").await.unwrap();
    pair.pump().await;

    let bob_cancels = request_cancels(&mut pair.bob_events);
    assert!(bob_cancels.contains(&(CancelCode::QrCodeInvalid, true)), "got {bob_cancels:?}");
    assert!(pair.bob.get_existing_verification_request(ALICE, &flow_id).await.is_none());
}

#[tokio::test]
async fn reciprocation_without_a_displayed_code_is_rejected() {
    let mut pair = TestPair::new();
    let flow_id = pair.ready_flow(qr_methods()).await;

    // Alice never rendered a code, so no secret can possibly match.
    let start = VerificationContent::Start(StartContent {
        from_device: BOB_DEVICE.to_owned(),
        method: VerificationMethod::ReciprocateV1,
        transaction_id: flow_id.clone(),
        key_agreement_protocols: None,
        hashes: None,
        message_authentication_codes: None,
        short_authentication_string: None,
        secret: Some("c2VjcmV0".to_owned()),
    });
    pair.alice.route_incoming(BOB, start).await;
    pair.pump().await;

    let alice_cancels = request_cancels(&mut pair.alice_events);
    assert!(
        alice_cancels.contains(&(CancelCode::UnexpectedMessage, true)),
        "got {alice_cancels:?}"
    );
    assert!(pair.alice.get_existing_verification_request(BOB, &flow_id).await.is_none());
}

// =========================================================================
// Method gating
// =========================================================================

#[tokio::test]
async fn qr_payloads_require_a_ready_flow_and_a_scanning_peer() {
    // Before the peer answers there is nothing to bind a code to.
    let mut pair = TestPair::new();
    let snapshot = pair.alice.request_verification(BOB, qr_methods()).await.unwrap();
    let error = pair.alice.generate_qr_payload(BOB, &snapshot.flow_id).await.unwrap_err();
    assert!(matches!(error, VerificationError::NotReady { .. }));

    // A SAS-only peer cannot scan anything we show.
    let mut pair = TestPair::new();
    let flow_id = pair.ready_flow(vec![VerificationMethod::SasV1]).await;
    let error = pair.alice.generate_qr_payload(BOB, &flow_id).await.unwrap_err();
    assert!(matches!(
        error,
        VerificationError::UnsupportedMethod { method: VerificationMethod::QrScanV1 }
    ));
}
