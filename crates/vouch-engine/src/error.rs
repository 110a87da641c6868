//! Errors surfaced by user-facing registry operations.
//!
//! Protocol failures are never returned from these calls. They resolve
//! into a `cancel` on the affected flow and reach the caller as a
//! [`VerificationEvent`](crate::event::VerificationEvent) carrying the
//! cancel code. The variants here cover the cases where an operation
//! cannot even be applied to a flow.

use vouch_proto::VerificationMethod;

/// Why a registry operation could not be applied.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// No live verification flow matches the given user and flow id.
    #[error("No verification flow with {other_user} under id {flow_id}")]
    UnknownFlow { other_user: String, flow_id: String },

    /// The flow id belongs to a verification that already finished.
    #[error("Flow id {flow_id} was already consumed by a finished verification")]
    FlowIdReused { flow_id: String },

    /// A non-terminal verification with this user already exists.
    #[error("A verification with {other_user} is already in progress")]
    ExistingVerification { other_user: String },

    /// The peer did not advertise the requested method.
    #[error("The other device does not support {method}")]
    UnsupportedMethod { method: VerificationMethod },

    /// The request has not reached the ready phase yet.
    #[error("Flow {flow_id} has not been answered with a ready")]
    NotReady { flow_id: String },

    /// The device store holds no identity key for this device.
    #[error("No identity key known for device {device_id} of {user_id}")]
    MissingDeviceKey { user_id: String, device_id: String },
}

pub type Result<T> = std::result::Result<T, VerificationError>;
