//! Outbound message delivery seam.

use std::future::Future;

use vouch_proto::VerificationContent;

/// Failure to hand a message to the underlying channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Transport is closed")]
    Closed,
}

/// Delivers verification messages to another device.
///
/// The engine does not care how messages travel. Implementations wrap
/// whatever channel the application already has and address the payload
/// to `to_user`, either to one device or, when `to_device` is `None`,
/// to all of that user's devices.
pub trait MessageTransport: Send + Sync + 'static {
    fn send_verification(
        &self,
        to_user: &str,
        to_device: Option<&str>,
        content: VerificationContent,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
