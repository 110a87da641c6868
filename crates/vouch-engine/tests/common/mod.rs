//! Two-device harness used by the engine integration tests.
//!
//! Wires two registries back to back through in-memory channel
//! transports. Messages are not delivered until the test pumps them, so
//! crossing messages and in-flight tampering can be exercised.

#![allow(dead_code)] // Not every test binary uses every helper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use vouch_engine::{
    CancelCode, DeviceStore, InMemoryDeviceStore, MessageTransport, TransportError,
    VerificationContent, VerificationEvent, VerificationMethod, VerificationRegistry,
};

pub const ALICE: &str = "@alice:example.org";
pub const ALICE_DEVICE: &str = "ALICEDEV";
pub const ALICE_KEY: &str = "alice-fingerprint-key";
pub const BOB: &str = "@bob:example.org";
pub const BOB_DEVICE: &str = "BOBDEV";
pub const BOB_KEY: &str = "bob-fingerprint-key";

/// A message on its way to the peer.
pub struct Delivery {
    pub to_user: String,
    pub to_device: Option<String>,
    pub content: VerificationContent,
}

/// Transport that parks every message on a channel for the test to
/// deliver, inspect or drop.
pub struct ChannelTransport {
    outbox: mpsc::UnboundedSender<Delivery>,
    fail: AtomicBool,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (outbox, deliveries) = mpsc::unbounded_channel();
        (Arc::new(Self { outbox, fail: AtomicBool::new(false) }), deliveries)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

impl MessageTransport for ChannelTransport {
    fn send_verification(
        &self,
        to_user: &str,
        to_device: Option<&str>,
        content: VerificationContent,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send {
        let result = if self.fail.load(Ordering::SeqCst) {
            Err(TransportError::SendFailed { reason: "test transport set to fail".to_owned() })
        } else {
            let delivery = Delivery {
                to_user: to_user.to_owned(),
                to_device: to_device.map(ToOwned::to_owned),
                content,
            };
            self.outbox.send(delivery).map_err(|_| TransportError::Closed)
        };
        async move { result }
    }
}

/// Two registries, their transports, stores and event streams.
pub struct TestPair {
    pub alice: VerificationRegistry<ChannelTransport>,
    pub alice_transport: Arc<ChannelTransport>,
    pub alice_store: Arc<InMemoryDeviceStore>,
    pub alice_events: broadcast::Receiver<VerificationEvent>,
    alice_outbox: mpsc::UnboundedReceiver<Delivery>,
    pub bob: VerificationRegistry<ChannelTransport>,
    pub bob_transport: Arc<ChannelTransport>,
    pub bob_store: Arc<InMemoryDeviceStore>,
    pub bob_events: broadcast::Receiver<VerificationEvent>,
    bob_outbox: mpsc::UnboundedReceiver<Delivery>,
}

fn seeded_store() -> Arc<InMemoryDeviceStore> {
    let store = Arc::new(InMemoryDeviceStore::new());
    store.add_device(ALICE, ALICE_DEVICE, ALICE_KEY);
    store.add_device(BOB, BOB_DEVICE, BOB_KEY);
    store
}

/// Surface engine traces in test output when `RUST_LOG` asks for them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

impl TestPair {
    pub fn new() -> Self {
        init_tracing();
        let (alice_transport, alice_outbox) = ChannelTransport::new();
        let (bob_transport, bob_outbox) = ChannelTransport::new();
        let alice_store = seeded_store();
        let bob_store = seeded_store();
        let alice = VerificationRegistry::with_defaults(
            ALICE,
            ALICE_DEVICE,
            Arc::clone(&alice_transport),
            Arc::clone(&alice_store) as Arc<dyn DeviceStore>,
        );
        let bob = VerificationRegistry::with_defaults(
            BOB,
            BOB_DEVICE,
            Arc::clone(&bob_transport),
            Arc::clone(&bob_store) as Arc<dyn DeviceStore>,
        );
        let alice_events = alice.subscribe();
        let bob_events = bob.subscribe();
        Self {
            alice,
            alice_transport,
            alice_store,
            alice_events,
            alice_outbox,
            bob,
            bob_transport,
            bob_store,
            bob_events,
            bob_outbox,
        }
    }

    /// Deliver queued messages in both directions until the wire goes
    /// quiet. Returns how many messages were delivered.
    pub async fn pump(&mut self) -> usize {
        let mut delivered = 0;
        let mut quiet_rounds = 0;
        while quiet_rounds < 4 {
            tokio::task::yield_now().await;
            let mut moved = false;
            while let Ok(delivery) = self.alice_outbox.try_recv() {
                self.bob.route_incoming(ALICE, delivery.content).await;
                delivered += 1;
                moved = true;
            }
            while let Ok(delivery) = self.bob_outbox.try_recv() {
                self.alice.route_incoming(BOB, delivery.content).await;
                delivered += 1;
                moved = true;
            }
            if moved {
                quiet_rounds = 0;
            } else {
                quiet_rounds += 1;
            }
        }
        delivered
    }

    /// Pull Alice's queued messages without delivering them.
    pub fn drain_alice_outbox(&mut self) -> Vec<Delivery> {
        let mut queued = Vec::new();
        while let Ok(delivery) = self.alice_outbox.try_recv() {
            queued.push(delivery);
        }
        queued
    }

    /// Pull Bob's queued messages without delivering them.
    pub fn drain_bob_outbox(&mut self) -> Vec<Delivery> {
        let mut queued = Vec::new();
        while let Ok(delivery) = self.bob_outbox.try_recv() {
            queued.push(delivery);
        }
        queued
    }

    /// Drive both sides to the ready phase, both advertising `methods`,
    /// and return the flow id.
    pub async fn ready_flow(&mut self, methods: Vec<VerificationMethod>) -> String {
        let snapshot = self
            .alice
            .request_verification(BOB, methods.clone())
            .await
            .expect("requesting verification");
        self.pump().await;
        self.bob
            .accept_with_methods(ALICE, &snapshot.flow_id, methods)
            .await
            .expect("accepting the request");
        self.pump().await;
        snapshot.flow_id
    }
}

impl Default for TestPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a receiver has queued up.
pub fn drain_events(
    events: &mut broadcast::Receiver<VerificationEvent>,
) -> Vec<VerificationEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Cancel codes surfaced on request snapshots, with who cancelled.
pub fn request_cancels(
    events: &mut broadcast::Receiver<VerificationEvent>,
) -> Vec<(CancelCode, bool)> {
    drain_events(events)
        .iter()
        .filter_map(|event| match event {
            VerificationEvent::RequestUpdated(snapshot) => snapshot
                .cancel_info
                .as_ref()
                .map(|info| (info.code.clone(), info.cancelled_by_us)),
            _ => None,
        })
        .collect()
}
