use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest caller-supplied correlation id that is accepted as-is.
pub const MAX_CORRELATION_ID_LEN: usize = 128;

/// Identifier shared by every detector, handler, job and hook call of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Reuse `supplied` when it is well-formed, otherwise generate a new id.
    pub fn resolve(supplied: Option<&str>) -> Self {
        match supplied {
            Some(id) if Self::is_well_formed(id) => Self(id.to_string()),
            Some(id) => {
                tracing::warn!(supplied = %id, "ignoring malformed correlation id");
                Self::generate()
            }
            None => Self::generate(),
        }
    }

    /// Parse a caller-supplied id, rejecting malformed input.
    pub fn parse(id: &str) -> Option<Self> {
        Self::is_well_formed(id).then(|| Self(id.to_string()))
    }

    /// Non-empty, bounded, and limited to `[A-Za-z0-9._:-]`.
    pub fn is_well_formed(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= MAX_CORRELATION_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
