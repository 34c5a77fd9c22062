use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use changeflow_core::TrackingToken;

use crate::options::ProcessOptions;

use super::traits::{HookError, Plugin};

/// Continues an existing lineage when the changed row carries a tracking token.
///
/// If the new image (or, for deletes, the old image) holds a valid token in
/// the configured column, its correlation id becomes the invocation's
/// correlation id and the whole token is handed to jobs as their source
/// token. An explicit `correlation_id` in the options always wins.
#[derive(Debug, Clone)]
pub struct TrackingTokenPlugin {
    column: String,
}

impl TrackingTokenPlugin {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    fn token_in(&self, payload: &Value) -> Option<TrackingToken> {
        ["/event/data/new", "/event/data/old"]
            .iter()
            .filter_map(|pointer| payload.pointer(pointer))
            .filter_map(Value::as_object)
            .find_map(|record| TrackingToken::from_record(record, &self.column))
    }
}

impl Default for TrackingTokenPlugin {
    fn default() -> Self {
        Self::new("updated_by")
    }
}

#[async_trait]
impl Plugin for TrackingTokenPlugin {
    fn name(&self) -> &str {
        "tracking-token"
    }

    async fn on_pre_configure(
        &self,
        payload: &Value,
        mut options: ProcessOptions,
    ) -> Result<ProcessOptions, HookError> {
        if options.correlation_id.is_some() {
            return Ok(options);
        }

        if let Some(token) = self.token_in(payload) {
            debug!(
                column = %self.column,
                source = %token.source,
                correlation_id = %token.correlation_id,
                "Continuing lineage from row tracking token"
            );
            options.correlation_id = Some(token.correlation_id.clone());
            if options.source_tracking_token.is_none() {
                options.source_tracking_token = Some(token.encode());
            }
        }
        Ok(options)
    }
}
