//! Protocol message error types.

/// Errors raised while validating or serializing wire messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Field must not be blank: {field}")]
    BlankField { field: &'static str },

    #[error("Field must not be empty: {field}")]
    EmptyList { field: &'static str },

    #[error("Missing field for method {method}: {field}")]
    MissingField { method: String, field: &'static str },
}
