use thiserror::Error;

/// A serialized tracking token that failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackingTokenFormatError {
    #[error("tracking token is empty")]
    Empty,

    #[error("unsupported tracking token version '{0}'")]
    UnsupportedVersion(String),

    #[error("tracking token has {0} segments, expected 4")]
    SegmentCount(usize),

    #[error("tracking token field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Configuration could not be resolved.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
