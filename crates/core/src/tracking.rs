//! Lineage tokens stamped into downstream mutations.
//!
//! A job that writes back to the database stamps a [`TrackingToken`] into the
//! row (typically an `updated_by` column). When that write fires another
//! webhook, the next invocation decodes the token and can tell which job
//! caused it. Tokens travel as `v1|source|correlation_id|job_execution_id`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::change_event::{ChangeEvent, Record};
use crate::correlation::CorrelationId;
use crate::error::TrackingTokenFormatError;

/// Current encoding version prefix.
pub const TOKEN_VERSION: &str = "v1";

const SEPARATOR: char = '|';
const MAX_FIELD_LEN: usize = 256;

/// Structured lineage value: who started the chain, under which invocation, by which job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingToken {
    pub source: String,
    pub correlation_id: String,
    pub job_execution_id: String,
}

impl TrackingToken {
    /// Build a token, validating every field.
    pub fn new(
        source: impl Into<String>,
        correlation_id: impl Into<String>,
        job_execution_id: impl Into<String>,
    ) -> Result<Self, TrackingTokenFormatError> {
        let token = Self {
            source: source.into(),
            correlation_id: correlation_id.into(),
            job_execution_id: job_execution_id.into(),
        };
        token.validate()?;
        Ok(token)
    }

    /// Serialize to the opaque wire form.
    pub fn encode(&self) -> String {
        format!(
            "{TOKEN_VERSION}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.source, self.correlation_id, self.job_execution_id
        )
    }

    /// Parse and validate the wire form.
    pub fn decode(raw: &str) -> Result<Self, TrackingTokenFormatError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TrackingTokenFormatError::Empty);
        }

        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        if parts[0] != TOKEN_VERSION {
            return Err(TrackingTokenFormatError::UnsupportedVersion(parts[0].to_string()));
        }
        if parts.len() != 4 {
            return Err(TrackingTokenFormatError::SegmentCount(parts.len()));
        }

        Self::new(parts[1], parts[2], parts[3])
    }

    /// Cheap check for whether `raw` would decode.
    pub fn is_valid(raw: &str) -> bool {
        Self::decode(raw).is_ok()
    }

    /// Extract a token stamped into `column` of `record`, if one is present and valid.
    pub fn from_record(record: &Record, column: &str) -> Option<Self> {
        match record.get(column) {
            Some(Value::String(raw)) => match Self::decode(raw) {
                Ok(token) => Some(token),
                Err(e) => {
                    tracing::debug!(column, error = %e, "column does not hold a tracking token");
                    None
                }
            },
            _ => None,
        }
    }

    /// Same lineage, new job.
    pub fn with_job_execution_id(&self, job_execution_id: impl Into<String>) -> Self {
        Self {
            source: self.source.clone(),
            correlation_id: self.correlation_id.clone(),
            job_execution_id: job_execution_id.into(),
        }
    }

    fn validate(&self) -> Result<(), TrackingTokenFormatError> {
        validate_field("source", &self.source)?;
        validate_field("correlation_id", &self.correlation_id)?;
        validate_field("job_execution_id", &self.job_execution_id)?;
        if !CorrelationId::is_well_formed(&self.correlation_id) {
            return Err(TrackingTokenFormatError::InvalidField {
                field: "correlation_id",
                reason: "not a well-formed correlation id".to_string(),
            });
        }
        Ok(())
    }
}

fn validate_field(field: &'static str, value: &str) -> Result<(), TrackingTokenFormatError> {
    let reason = if value.is_empty() {
        "empty"
    } else if value.len() > MAX_FIELD_LEN {
        "too long"
    } else if value.contains(SEPARATOR) {
        "contains separator"
    } else if value.chars().any(char::is_whitespace) {
        "contains whitespace"
    } else {
        return Ok(());
    };
    Err(TrackingTokenFormatError::InvalidField {
        field,
        reason: reason.to_string(),
    })
}

impl fmt::Display for TrackingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for TrackingToken {
    type Err = TrackingTokenFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

// ── Tracking manager ──────────────────────────────────────────

/// Issues tracking tokens for the jobs of one invocation.
///
/// This is the only place lineage continuation is decided; jobs obtain
/// their token through it instead of assembling one by hand.
#[derive(Debug, Clone)]
pub struct TrackingManager {
    correlation_id: CorrelationId,
}

impl TrackingManager {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self { correlation_id }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Fresh id for one job execution.
    pub fn new_job_execution_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Token for a job.
    ///
    /// A valid `source_tracking_token` continues its lineage (source and
    /// correlation id kept, job id replaced). Anything else starts a new
    /// lineage rooted at `fallback_source`, or at the event's table when the
    /// fallback itself is not a usable source.
    pub fn for_job(
        &self,
        event: &ChangeEvent,
        source_tracking_token: Option<&str>,
        fallback_source: &str,
        job_execution_id: &str,
    ) -> TrackingToken {
        if let Some(raw) = source_tracking_token {
            match TrackingToken::decode(raw) {
                Ok(parent) => return parent.with_job_execution_id(job_execution_id),
                Err(e) => {
                    tracing::warn!(
                        correlation_id = %self.correlation_id,
                        error = %e,
                        "source tracking token rejected, starting new lineage"
                    );
                }
            }
        }

        TrackingToken::new(fallback_source, self.correlation_id.as_str(), job_execution_id)
            .unwrap_or_else(|_| TrackingToken {
                source: sanitize_field(&event.table.to_string()),
                correlation_id: self.correlation_id.to_string(),
                job_execution_id: sanitize_field(job_execution_id),
            })
    }
}

/// Coerce `value` into something [`validate_field`] accepts.
fn sanitize_field(value: &str) -> String {
    let mut cleaned = String::with_capacity(value.len().min(MAX_FIELD_LEN));
    for c in value.chars() {
        let c = if c == SEPARATOR || c.is_whitespace() { '_' } else { c };
        if cleaned.len() + c.len_utf8() > MAX_FIELD_LEN {
            break;
        }
        cleaned.push(c);
    }
    if cleaned.is_empty() {
        cleaned.push_str("unknown");
    }
    cleaned
}
