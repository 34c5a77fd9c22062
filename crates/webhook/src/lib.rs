//! Webhook payload normalization.
//!
//! Turns the raw JSON body delivered by the database event trigger into a
//! typed [`ChangeEvent`](changeflow_core::ChangeEvent).

pub mod error;
pub mod parser;
pub mod wire;

pub use error::PayloadParseError;
pub use parser::{parse_payload, parse_value};
