//! Short authentication string transaction.
//!
//! Implements the commit-reveal SAS exchange: the initiator proposes
//! parameter lists, the accepter commits to an ephemeral key before the
//! initiator reveals theirs, both derive six SAS bytes from the ECDH
//! secret and compare short codes out of band, then exchange MACs over
//! their device keys.
//!
//! Transitions are pure state moves returning a [`SasStep`]; the registry
//! owns sending, event publication and cancellation.

use std::collections::BTreeMap;

use tracing::warn;

use vouch_crypto::{
    CryptoError, EphemeralSas, SasIdentity, SharedSecret, calculate_mac, calculate_mac_long_kdf,
    compute_commitment, constant_time_eq, decimal_code, derive_sas_bytes, emoji_code, mac_info,
    sas_info, validate_public_key,
};
use vouch_crypto::{Emoji, sas::SAS_BYTES_LEN};
use vouch_proto::{
    AcceptContent, CancelCode, DoneContent, KeyContent, MacContent, SasStartLists, StartContent,
    VerificationContent, VerificationMethod, algorithm, canonical_json,
};

use crate::event::{CancelInfo, SasPhase, SasSnapshot};
use crate::store::DeviceStore;

/// Key id under which the MAC over the sorted key-id list travels.
const KEY_IDS_MAC_ID: &str = "KEY_IDS";

/// Parameters both sides agreed on for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AgreedProtocols {
    pub key_agreement: String,
    pub hash: String,
    pub mac: String,
    /// Mutually renderable short code formats, initiator order.
    pub short_codes: Vec<String>,
}

/// The parameter lists we put in an outgoing SAS start.
pub(crate) fn build_start_content(local_device_id: &str, flow_id: &str) -> StartContent {
    StartContent {
        from_device: local_device_id.to_owned(),
        method: VerificationMethod::SasV1,
        transaction_id: flow_id.to_owned(),
        key_agreement_protocols: Some(vec![
            algorithm::KEY_AGREEMENT_CURVE25519_HKDF_SHA256.to_owned(),
        ]),
        hashes: Some(vec![algorithm::HASH_SHA256.to_owned()]),
        message_authentication_codes: Some(vec![
            algorithm::MAC_HKDF_HMAC_SHA256.to_owned(),
            algorithm::MAC_HMAC_SHA256.to_owned(),
        ]),
        short_authentication_string: Some(vec![
            algorithm::SHORT_CODE_DECIMAL.to_owned(),
            algorithm::SHORT_CODE_EMOJI.to_owned(),
        ]),
        secret: None,
    }
}

/// Canonical JSON of a start content, the commitment input. Both sides
/// must compute it from the identical struct, so the accepter uses the
/// received content as-is.
pub(crate) fn canonical_start(start: &StartContent) -> Result<String, serde_json::Error> {
    Ok(canonical_json(&serde_json::to_value(start)?))
}

fn first_supported(proposed: &[String], known: &[&str]) -> Option<String> {
    proposed
        .iter()
        .find(|candidate| known.contains(&candidate.as_str()))
        .cloned()
}

/// Pick parameters from an initiator's proposal: the first mutually
/// supported entry of each list, in the initiator's order. The short code
/// list keeps every format both sides can render and must include
/// decimal, which every implementation can display.
pub(crate) fn negotiate(lists: &SasStartLists) -> Result<AgreedProtocols, CancelCode> {
    let key_agreement =
        first_supported(&lists.key_agreement_protocols, algorithm::KNOWN_KEY_AGREEMENTS)
            .ok_or(CancelCode::UnknownMethod)?;
    let hash =
        first_supported(&lists.hashes, algorithm::KNOWN_HASHES).ok_or(CancelCode::UnknownMethod)?;
    let mac = first_supported(&lists.message_authentication_codes, algorithm::KNOWN_MACS)
        .ok_or(CancelCode::UnknownMethod)?;

    let short_codes: Vec<String> = lists
        .short_authentication_string
        .iter()
        .filter(|code| algorithm::KNOWN_SHORT_CODES.contains(&code.as_str()))
        .cloned()
        .collect();
    if !short_codes.iter().any(|code| code == algorithm::SHORT_CODE_DECIMAL) {
        return Err(CancelCode::UnknownMethod);
    }

    Ok(AgreedProtocols { key_agreement, hash, mac, short_codes })
}

/// Check an accepter's parameter choice against what we can do.
pub(crate) fn validate_accept(accept: &AcceptContent) -> Result<AgreedProtocols, CancelCode> {
    if !algorithm::KNOWN_KEY_AGREEMENTS.contains(&accept.key_agreement_protocol.as_str())
        || !algorithm::KNOWN_HASHES.contains(&accept.hash.as_str())
        || !algorithm::KNOWN_MACS.contains(&accept.message_authentication_code.as_str())
    {
        return Err(CancelCode::UnknownMethod);
    }

    let short_codes: Vec<String> = accept
        .short_authentication_string
        .iter()
        .filter(|code| algorithm::KNOWN_SHORT_CODES.contains(&code.as_str()))
        .cloned()
        .collect();
    if short_codes.is_empty() {
        return Err(CancelCode::UnknownMethod);
    }

    Ok(AgreedProtocols {
        key_agreement: accept.key_agreement_protocol.clone(),
        hash: accept.hash.clone(),
        mac: accept.message_authentication_code.clone(),
        short_codes,
    })
}

/// What a transition produced, for the registry to act on.
#[derive(Debug)]
pub(crate) enum SasStep {
    /// Messages to send to the peer, in order.
    Send(Vec<VerificationContent>),
    /// State advanced without anything to send.
    Advanced,
    /// The transaction finished; these devices verified successfully.
    Completed {
        send: Vec<VerificationContent>,
        verified_devices: Vec<String>,
    },
    /// The message does not fit the current state and was dropped.
    Ignored { reason: &'static str },
    /// Protocol failure; the flow must be cancelled with this code.
    Fail(CancelCode),
}

#[derive(Debug)]
enum SasState {
    /// We sent a start and wait for the accept.
    StartSent {
        our_sas: EphemeralSas,
        start_canonical_json: String,
    },
    /// Their start arrived and negotiation succeeded; the user has not
    /// accepted yet.
    StartReceived {
        agreed: AgreedProtocols,
        start_canonical_json: String,
    },
    /// We accepted and committed to our key, waiting for theirs.
    AcceptSent {
        our_sas: EphemeralSas,
        agreed: AgreedProtocols,
    },
    /// Their accept arrived; our key went out, commitment check pending
    /// until their key reveals.
    AcceptReceived {
        our_sas: EphemeralSas,
        agreed: AgreedProtocols,
        start_canonical_json: String,
        their_commitment: String,
    },
    /// Both keys exchanged; codes are derivable and MACs may flow.
    ShortCodeReady {
        shared: SharedSecret,
        sas_bytes: [u8; SAS_BYTES_LEN],
        agreed: AgreedProtocols,
        have_we_confirmed: bool,
        their_mac: Option<MacContent>,
    },
    Done,
    Cancelled(CancelInfo),
}

#[derive(Debug)]
pub(crate) struct SasTransaction {
    pub(crate) flow_id: String,
    local_user_id: String,
    local_device_id: String,
    pub(crate) other_user_id: String,
    pub(crate) other_device_id: String,
    pub(crate) we_started: bool,
    state: SasState,
}

/// The identities a MAC transcript is computed over.
struct MacScope<'a> {
    flow_id: &'a str,
    sender_user: &'a str,
    sender_device: &'a str,
    receiver_user: &'a str,
    receiver_device: &'a str,
}

fn mac_for(
    agreed: &AgreedProtocols,
    shared: &SharedSecret,
    info: &str,
    message: &str,
) -> Result<String, CryptoError> {
    if agreed.mac == algorithm::MAC_HKDF_HMAC_SHA256 {
        calculate_mac(shared, info, message)
    } else {
        calculate_mac_long_kdf(shared, info, message)
    }
}

/// Build the MAC message authenticating our own device key.
fn build_mac_content(
    scope: &MacScope<'_>,
    agreed: &AgreedProtocols,
    shared: &SharedSecret,
    store: &dyn DeviceStore,
) -> Result<MacContent, CancelCode> {
    let Some(own_key) = store.device_key(scope.sender_user, scope.sender_device) else {
        warn!(
            user_id = %scope.sender_user,
            device_id = %scope.sender_device,
            "Own device key missing, cannot authenticate"
        );
        return Err(CancelCode::UserError);
    };

    let key_id = format!("ed25519:{}", scope.sender_device);
    let info = mac_info(
        scope.sender_user,
        scope.sender_device,
        scope.receiver_user,
        scope.receiver_device,
        scope.flow_id,
        &key_id,
    );
    let key_mac = mac_for(agreed, shared, &info, &own_key).map_err(|_| CancelCode::UserError)?;

    let keys_info = mac_info(
        scope.sender_user,
        scope.sender_device,
        scope.receiver_user,
        scope.receiver_device,
        scope.flow_id,
        KEY_IDS_MAC_ID,
    );
    let keys_mac =
        mac_for(agreed, shared, &keys_info, &key_id).map_err(|_| CancelCode::UserError)?;

    let mut mac = BTreeMap::new();
    mac.insert(key_id, key_mac);
    Ok(MacContent {
        transaction_id: scope.flow_id.to_owned(),
        mac,
        keys: keys_mac,
    })
}

/// Check a received MAC message and return the device ids it proved.
///
/// Key ids naming devices we do not know are skipped, so a peer may MAC
/// more keys than we can check. A MAC that fails for a known key, a bad
/// key-id list MAC, or zero verifiable entries all reject the message.
fn verify_mac_content(
    scope: &MacScope<'_>,
    agreed: &AgreedProtocols,
    shared: &SharedSecret,
    their: &MacContent,
    store: &dyn DeviceStore,
) -> Result<Vec<String>, CancelCode> {
    let mut verified = Vec::new();
    for (key_id, claimed) in &their.mac {
        let Some(device_id) = key_id.strip_prefix("ed25519:") else {
            warn!(key_id = %key_id, "Skipping MAC with unsupported key id scheme");
            continue;
        };
        let Some(device_key) = store.device_key(scope.sender_user, device_id) else {
            warn!(
                user_id = %scope.sender_user,
                device_id = %device_id,
                "Skipping MAC for unknown device"
            );
            continue;
        };
        let info = mac_info(
            scope.sender_user,
            scope.sender_device,
            scope.receiver_user,
            scope.receiver_device,
            scope.flow_id,
            key_id,
        );
        let expected =
            mac_for(agreed, shared, &info, &device_key).map_err(|_| CancelCode::UserError)?;
        if !constant_time_eq(&expected, claimed) {
            return Err(CancelCode::MismatchedKeys);
        }
        verified.push(device_id.to_owned());
    }

    // The key-id list MAC stops a middleman from dropping entries.
    let joined = their.mac.keys().map(String::as_str).collect::<Vec<_>>().join(",");
    let keys_info = mac_info(
        scope.sender_user,
        scope.sender_device,
        scope.receiver_user,
        scope.receiver_device,
        scope.flow_id,
        KEY_IDS_MAC_ID,
    );
    let expected =
        mac_for(agreed, shared, &keys_info, &joined).map_err(|_| CancelCode::UserError)?;
    if !constant_time_eq(&expected, &their.keys) {
        return Err(CancelCode::MismatchedKeys);
    }

    if verified.is_empty() {
        return Err(CancelCode::MismatchedKeys);
    }
    Ok(verified)
}

impl SasTransaction {
    pub(crate) fn new_initiator(
        flow_id: String,
        local_user_id: String,
        local_device_id: String,
        other_user_id: String,
        other_device_id: String,
        start_canonical_json: String,
    ) -> Self {
        Self {
            flow_id,
            local_user_id,
            local_device_id,
            other_user_id,
            other_device_id,
            we_started: true,
            state: SasState::StartSent {
                our_sas: EphemeralSas::new(),
                start_canonical_json,
            },
        }
    }

    pub(crate) fn new_responder(
        flow_id: String,
        local_user_id: String,
        local_device_id: String,
        other_user_id: String,
        other_device_id: String,
        agreed: AgreedProtocols,
        start_canonical_json: String,
    ) -> Self {
        Self {
            flow_id,
            local_user_id,
            local_device_id,
            other_user_id,
            other_device_id,
            we_started: false,
            state: SasState::StartReceived { agreed, start_canonical_json },
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, SasState::Done | SasState::Cancelled(_))
    }

    pub(crate) fn phase(&self) -> SasPhase {
        match &self.state {
            SasState::StartSent { .. } | SasState::StartReceived { .. } => SasPhase::Started,
            SasState::AcceptSent { .. } | SasState::AcceptReceived { .. } => SasPhase::Accepted,
            SasState::ShortCodeReady { have_we_confirmed: false, .. } => SasPhase::ShortCodeReady,
            SasState::ShortCodeReady { have_we_confirmed: true, .. } => SasPhase::MacSent,
            SasState::Done => SasPhase::Done,
            SasState::Cancelled(_) => SasPhase::Cancelled,
        }
    }

    /// Accept their start: commit to a fresh ephemeral key.
    pub(crate) fn accept(&mut self) -> Option<AcceptContent> {
        let state = std::mem::replace(&mut self.state, SasState::Done);
        match state {
            SasState::StartReceived { agreed, start_canonical_json } => {
                let our_sas = EphemeralSas::new();
                let commitment = compute_commitment(&our_sas.public_key(), &start_canonical_json);
                let content = AcceptContent {
                    transaction_id: self.flow_id.clone(),
                    key_agreement_protocol: agreed.key_agreement.clone(),
                    hash: agreed.hash.clone(),
                    message_authentication_code: agreed.mac.clone(),
                    short_authentication_string: agreed.short_codes.clone(),
                    commitment,
                };
                self.state = SasState::AcceptSent { our_sas, agreed };
                Some(content)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Their accept answers our start: validate the choice and reveal our
    /// key. The commitment is kept for checking once their key arrives.
    pub(crate) fn on_accept(&mut self, accept: &AcceptContent) -> SasStep {
        let state = std::mem::replace(&mut self.state, SasState::Done);
        match state {
            SasState::StartSent { our_sas, start_canonical_json } => {
                match validate_accept(accept) {
                    Ok(agreed) => {
                        let our_public = our_sas.public_key();
                        self.state = SasState::AcceptReceived {
                            our_sas,
                            agreed,
                            start_canonical_json,
                            their_commitment: accept.commitment.clone(),
                        };
                        SasStep::Send(vec![VerificationContent::Key(KeyContent {
                            transaction_id: self.flow_id.clone(),
                            key: our_public,
                        })])
                    }
                    Err(code) => {
                        self.state = SasState::StartSent { our_sas, start_canonical_json };
                        SasStep::Fail(code)
                    }
                }
            }
            other => {
                self.state = other;
                SasStep::Ignored { reason: "accept outside start stage" }
            }
        }
    }

    /// Their ephemeral key arrived: check the commitment where one is
    /// pending, run the exchange and derive the SAS bytes.
    pub(crate) fn on_key(&mut self, key: &KeyContent) -> SasStep {
        let state = std::mem::replace(&mut self.state, SasState::Done);
        match state {
            SasState::AcceptReceived {
                our_sas,
                agreed,
                start_canonical_json,
                their_commitment,
            } => {
                let expected = compute_commitment(&key.key, &start_canonical_json);
                if !constant_time_eq(&expected, &their_commitment) {
                    self.state = SasState::AcceptReceived {
                        our_sas,
                        agreed,
                        start_canonical_json,
                        their_commitment,
                    };
                    return SasStep::Fail(CancelCode::MismatchedCommitment);
                }
                if validate_public_key(&key.key).is_err() {
                    self.state = SasState::AcceptReceived {
                        our_sas,
                        agreed,
                        start_canonical_json,
                        their_commitment,
                    };
                    return SasStep::Fail(CancelCode::InvalidMessage);
                }

                let our_public = our_sas.public_key();
                let Ok(shared) = our_sas.diffie_hellman(&key.key) else {
                    self.state = SasState::Cancelled(CancelInfo::local(CancelCode::UserError));
                    return SasStep::Fail(CancelCode::UserError);
                };
                let info = sas_info(
                    &SasIdentity {
                        user_id: &self.local_user_id,
                        device_id: &self.local_device_id,
                        public_key: &our_public,
                    },
                    &SasIdentity {
                        user_id: &self.other_user_id,
                        device_id: &self.other_device_id,
                        public_key: &key.key,
                    },
                    &self.flow_id,
                );
                let Ok(sas_bytes) = derive_sas_bytes(&shared, &info) else {
                    self.state = SasState::Cancelled(CancelInfo::local(CancelCode::UserError));
                    return SasStep::Fail(CancelCode::UserError);
                };
                self.state = SasState::ShortCodeReady {
                    shared,
                    sas_bytes,
                    agreed,
                    have_we_confirmed: false,
                    their_mac: None,
                };
                SasStep::Advanced
            }
            SasState::AcceptSent { our_sas, agreed } => {
                if validate_public_key(&key.key).is_err() {
                    self.state = SasState::AcceptSent { our_sas, agreed };
                    return SasStep::Fail(CancelCode::InvalidMessage);
                }
                let our_public = our_sas.public_key();
                let Ok(shared) = our_sas.diffie_hellman(&key.key) else {
                    self.state = SasState::Cancelled(CancelInfo::local(CancelCode::UserError));
                    return SasStep::Fail(CancelCode::UserError);
                };
                // They initiated, so their identity leads the transcript.
                let info = sas_info(
                    &SasIdentity {
                        user_id: &self.other_user_id,
                        device_id: &self.other_device_id,
                        public_key: &key.key,
                    },
                    &SasIdentity {
                        user_id: &self.local_user_id,
                        device_id: &self.local_device_id,
                        public_key: &our_public,
                    },
                    &self.flow_id,
                );
                let Ok(sas_bytes) = derive_sas_bytes(&shared, &info) else {
                    self.state = SasState::Cancelled(CancelInfo::local(CancelCode::UserError));
                    return SasStep::Fail(CancelCode::UserError);
                };
                self.state = SasState::ShortCodeReady {
                    shared,
                    sas_bytes,
                    agreed,
                    have_we_confirmed: false,
                    their_mac: None,
                };
                SasStep::Send(vec![VerificationContent::Key(KeyContent {
                    transaction_id: self.flow_id.clone(),
                    key: our_public,
                })])
            }
            other => {
                self.state = other;
                SasStep::Ignored { reason: "key outside exchange stage" }
            }
        }
    }

    /// The user confirmed the codes match: send our MAC, and finish if
    /// theirs already arrived and checks out.
    pub(crate) fn confirm(&mut self, store: &dyn DeviceStore) -> SasStep {
        let (our_mac, verified_devices) = match &mut self.state {
            SasState::ShortCodeReady { shared, agreed, have_we_confirmed, their_mac, .. } => {
                if *have_we_confirmed {
                    return SasStep::Ignored { reason: "short code already confirmed" };
                }
                let outbound = MacScope {
                    flow_id: &self.flow_id,
                    sender_user: &self.local_user_id,
                    sender_device: &self.local_device_id,
                    receiver_user: &self.other_user_id,
                    receiver_device: &self.other_device_id,
                };
                let our_mac = match build_mac_content(&outbound, agreed, shared, store) {
                    Ok(mac) => mac,
                    Err(code) => return SasStep::Fail(code),
                };
                if let Some(their) = their_mac.as_ref() {
                    let inbound = MacScope {
                        flow_id: &self.flow_id,
                        sender_user: &self.other_user_id,
                        sender_device: &self.other_device_id,
                        receiver_user: &self.local_user_id,
                        receiver_device: &self.local_device_id,
                    };
                    match verify_mac_content(&inbound, agreed, shared, their, store) {
                        Ok(verified) => (our_mac, verified),
                        Err(code) => return SasStep::Fail(code),
                    }
                } else {
                    *have_we_confirmed = true;
                    return SasStep::Send(vec![VerificationContent::Mac(our_mac)]);
                }
            }
            _ => return SasStep::Ignored { reason: "confirm before the short code stage" },
        };

        self.state = SasState::Done;
        SasStep::Completed {
            send: vec![
                VerificationContent::Mac(our_mac),
                VerificationContent::Done(DoneContent { transaction_id: self.flow_id.clone() }),
            ],
            verified_devices,
        }
    }

    /// Their MAC arrived. Before our own confirmation it is parked; after,
    /// it is checked and completes the transaction.
    pub(crate) fn on_mac(&mut self, mac: MacContent, store: &dyn DeviceStore) -> SasStep {
        let verified_devices = match &mut self.state {
            SasState::ShortCodeReady { shared, agreed, have_we_confirmed, their_mac, .. } => {
                if their_mac.is_some() {
                    return SasStep::Ignored { reason: "mac already received" };
                }
                if *have_we_confirmed {
                    let inbound = MacScope {
                        flow_id: &self.flow_id,
                        sender_user: &self.other_user_id,
                        sender_device: &self.other_device_id,
                        receiver_user: &self.local_user_id,
                        receiver_device: &self.local_device_id,
                    };
                    match verify_mac_content(&inbound, agreed, shared, &mac, store) {
                        Ok(verified) => verified,
                        Err(code) => return SasStep::Fail(code),
                    }
                } else {
                    *their_mac = Some(mac);
                    return SasStep::Advanced;
                }
            }
            _ => return SasStep::Ignored { reason: "mac outside the short code stage" },
        };

        self.state = SasState::Done;
        SasStep::Completed {
            send: vec![VerificationContent::Done(DoneContent {
                transaction_id: self.flow_id.clone(),
            })],
            verified_devices,
        }
    }

    pub(crate) fn cancel(&mut self, info: CancelInfo) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = SasState::Cancelled(info);
        true
    }

    fn short_codes(&self) -> (Option<[u16; 3]>, Option<[Emoji; 7]>) {
        match &self.state {
            SasState::ShortCodeReady { sas_bytes, agreed, .. } => {
                let wants = |format: &str| agreed.short_codes.iter().any(|code| code == format);
                (
                    wants(algorithm::SHORT_CODE_DECIMAL).then(|| decimal_code(sas_bytes)),
                    wants(algorithm::SHORT_CODE_EMOJI).then(|| emoji_code(sas_bytes)),
                )
            }
            _ => (None, None),
        }
    }

    pub(crate) fn snapshot(&self) -> SasSnapshot {
        self.snapshot_with_phase(self.phase())
    }

    /// Snapshot reported under an explicit phase, used for the transient
    /// key-exchanged notification where codes are not yet presentable.
    pub(crate) fn snapshot_with_phase(&self, phase: SasPhase) -> SasSnapshot {
        let (decimal, emoji) = match phase {
            SasPhase::ShortCodeReady | SasPhase::MacSent => self.short_codes(),
            _ => (None, None),
        };
        let (have_we_confirmed, has_other_confirmed) = match &self.state {
            SasState::ShortCodeReady { have_we_confirmed, their_mac, .. } => {
                (*have_we_confirmed, their_mac.is_some())
            }
            SasState::Done => (true, true),
            _ => (false, false),
        };
        let cancel_info = match &self.state {
            SasState::Cancelled(info) => Some(info.clone()),
            _ => None,
        };
        SasSnapshot {
            flow_id: self.flow_id.clone(),
            other_user_id: self.other_user_id.clone(),
            other_device_id: self.other_device_id.clone(),
            we_started: self.we_started,
            phase,
            decimal,
            emoji,
            have_we_confirmed,
            has_other_confirmed,
            cancel_info,
        }
    }
}
