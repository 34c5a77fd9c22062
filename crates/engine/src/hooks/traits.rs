use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use changeflow_core::{CorrelationId, InvocationResult, JobExecutionResult, LogEntry};

use crate::options::ProcessOptions;

/// Errors returned by plugin hooks.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),

    #[error("plugin '{plugin}' panicked: {message}")]
    Panicked { plugin: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Invocation-scoped values passed to every hook after configuration.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub correlation_id: CorrelationId,
    pub source_id: String,
    /// Opaque caller metadata.
    pub context: Arc<Value>,
}

/// Job about to start.
#[derive(Debug, Clone, Serialize)]
pub struct JobStart {
    pub event_name: String,
    pub job_name: String,
    pub job_execution_id: String,
    pub correlation_id: CorrelationId,
    /// Effective timeout after clipping to the invocation budget. `None` when unlimited.
    pub timeout_ms: Option<u64>,
    pub attempt_limit: u32,
}

/// Observer of pipeline lifecycle events.
///
/// Every hook has a no-op default. Hooks run in registration order; an error
/// or panic is logged and otherwise ignored, except in
/// [`on_pre_configure`](Plugin::on_pre_configure), where it aborts the call
/// before any detection work starts.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Transform the call's options before the pipeline starts.
    async fn on_pre_configure(
        &self,
        _payload: &Value,
        options: ProcessOptions,
    ) -> Result<ProcessOptions, HookError> {
        Ok(options)
    }

    async fn on_job_start(&self, _ctx: &HookContext, _job: &JobStart) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_job_end(
        &self,
        _ctx: &HookContext,
        _result: &JobExecutionResult,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_log(&self, _ctx: &HookContext, _entry: &LogEntry) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_invocation_complete(
        &self,
        _ctx: &HookContext,
        _result: &InvocationResult,
    ) -> Result<(), HookError> {
        Ok(())
    }
}
