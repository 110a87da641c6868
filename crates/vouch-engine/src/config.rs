//! Registry tuning knobs.

use std::time::Duration;

/// Configuration for a [`VerificationRegistry`](crate::VerificationRegistry).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Incoming requests older than this are dropped as stale.
    pub request_max_age: Duration,
    /// Tolerated forward clock skew on incoming request timestamps.
    pub request_max_skew: Duration,
    /// How many times an outbound cancel is attempted before giving up.
    pub cancel_retry_attempts: u32,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_max_age: Duration::from_secs(10 * 60),
            request_max_skew: Duration::from_secs(5 * 60),
            cancel_retry_attempts: 3,
            event_capacity: 256,
        }
    }
}
