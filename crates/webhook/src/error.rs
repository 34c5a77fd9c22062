//! Payload parse error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadParseError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("{op} payload has inconsistent data: {reason}")]
    InconsistentData { op: String, reason: String },
}
