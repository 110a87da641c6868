//! Device identity lookup and trust recording.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Access to device fingerprint keys and the trust they earn.
///
/// The engine reads keys when computing and checking MACs and QR
/// payloads, and records trust once a flow completes. Persistence is the
/// application's concern.
pub trait DeviceStore: Send + Sync {
    /// Ed25519 fingerprint key of a device, unpadded base64.
    fn device_key(&self, user_id: &str, device_id: &str) -> Option<String>;

    /// Record that a device passed interactive verification.
    fn mark_verified(&self, user_id: &str, device_id: &str);

    /// Whether a device has passed interactive verification.
    fn is_verified(&self, user_id: &str, device_id: &str) -> bool;
}

/// Map-backed [`DeviceStore`] for tests and small deployments.
#[derive(Debug, Default)]
pub struct InMemoryDeviceStore {
    keys: RwLock<HashMap<(String, String), String>>,
    verified: RwLock<HashSet<(String, String)>>,
}

impl InMemoryDeviceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device fingerprint key.
    pub fn add_device(&self, user_id: &str, device_id: &str, key: &str) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert((user_id.to_owned(), device_id.to_owned()), key.to_owned());
        }
    }
}

impl DeviceStore for InMemoryDeviceStore {
    fn device_key(&self, user_id: &str, device_id: &str) -> Option<String> {
        self.keys
            .read()
            .ok()?
            .get(&(user_id.to_owned(), device_id.to_owned()))
            .cloned()
    }

    fn mark_verified(&self, user_id: &str, device_id: &str) {
        if let Ok(mut verified) = self.verified.write() {
            verified.insert((user_id.to_owned(), device_id.to_owned()));
        }
    }

    fn is_verified(&self, user_id: &str, device_id: &str) -> bool {
        self.verified
            .read()
            .is_ok_and(|verified| verified.contains(&(user_id.to_owned(), device_id.to_owned())))
    }
}

/// Source of wall-clock time, injectable for tests.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// [`Clock`] backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

/// [`Clock`] that reports a manually controlled instant.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct FixedClock {
    now_ms: std::sync::atomic::AtomicU64,
}

#[cfg(any(test, feature = "test-utils"))]
impl FixedClock {
    #[must_use]
    pub fn at(now_ms: u64) -> Self {
        Self { now_ms: std::sync::atomic::AtomicU64::new(now_ms) }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn store_round_trips_keys_and_trust() {
        let store = InMemoryDeviceStore::new();
        store.add_device("@alice:example.org", "AAAA", "alice-key");

        assert_eq!(
            store.device_key("@alice:example.org", "AAAA").as_deref(),
            Some("alice-key")
        );
        assert_eq!(store.device_key("@alice:example.org", "BBBB"), None);

        assert!(!store.is_verified("@alice:example.org", "AAAA"));
        store.mark_verified("@alice:example.org", "AAAA");
        assert!(store.is_verified("@alice:example.org", "AAAA"));
    }

    #[test]
    fn trust_survives_without_a_stored_key() {
        let store = InMemoryDeviceStore::new();
        store.mark_verified("@bob:example.org", "CCCC");
        assert!(store.is_verified("@bob:example.org", "CCCC"));
        assert_eq!(store.device_key("@bob:example.org", "CCCC"), None);
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::at(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
    }
}
