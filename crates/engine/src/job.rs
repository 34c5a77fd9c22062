//! Job trait, static job options, and the per-execution job context.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use changeflow_core::{
    ChangeEvent, CorrelationId, LogEntry, LogLevel, TrackingManager, TrackingToken,
};

/// Errors a job can report.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("job observed cancellation")]
    Cancelled,

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One unit of side-effect work.
///
/// Jobs should watch [`JobContext::cancel`] and return early once it fires.
/// Cancellation is advisory: a job that never checks the token keeps running
/// until it resolves or is abandoned at the invocation's hard stop.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError>;
}

/// Job backed by an async closure. Built with [`job_fn`].
pub struct FnJob<F>(F);

/// Wrap an async closure as a [`Job`].
pub fn job_fn<F, Fut>(f: F) -> FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    FnJob(f)
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        (self.0)(ctx).await
    }
}

// ── Options & descriptor ─────────────────────────────────────────────

/// Static options declared alongside a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub name: Option<String>,
    /// Overrides the default per-job timeout.
    pub timeout_ms: Option<u64>,
    /// Extra attempts after a failure, while budget remains.
    #[serde(default)]
    pub retries: u32,
    /// Lineage token of the mutation that led to this job, if any.
    pub source_tracking_token: Option<String>,
}

/// A job reference plus its static options, as returned by a handler.
#[derive(Clone)]
pub struct JobDescriptor {
    pub job: Arc<dyn Job>,
    pub options: JobOptions,
}

impl JobDescriptor {
    pub fn new(job: impl Job + 'static) -> Self {
        Self {
            job: Arc::new(job),
            options: JobOptions::default(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.options.retries = retries;
        self
    }

    pub fn source_tracking_token(mut self, token: impl Into<String>) -> Self {
        self.options.source_tracking_token = Some(token.into());
        self
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// ── Logger ───────────────────────────────────────────────────────────

/// Structured logger injected into every job.
///
/// Entries go to `tracing` immediately and are kept so the orchestrator can
/// attach them to the job result and forward them to `on_log` hooks.
#[derive(Debug, Clone)]
pub struct JobLogger {
    event_name: String,
    job_name: String,
    job_execution_id: String,
    correlation_id: CorrelationId,
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl JobLogger {
    pub fn new(
        event_name: impl Into<String>,
        job_name: impl Into<String>,
        job_execution_id: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            job_name: job_name.into(),
            job_execution_id: job_execution_id.into(),
            correlation_id,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into());
    }

    pub fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!(
                correlation_id = %self.correlation_id,
                event = %self.event_name,
                job = %self.job_name,
                "{message}"
            ),
            LogLevel::Info => tracing::info!(
                correlation_id = %self.correlation_id,
                event = %self.event_name,
                job = %self.job_name,
                "{message}"
            ),
            LogLevel::Warn => tracing::warn!(
                correlation_id = %self.correlation_id,
                event = %self.event_name,
                job = %self.job_name,
                "{message}"
            ),
            LogLevel::Error => tracing::error!(
                correlation_id = %self.correlation_id,
                event = %self.event_name,
                job = %self.job_name,
                "{message}"
            ),
        }

        let entry = LogEntry {
            level,
            message,
            timestamp: Utc::now(),
            event_name: self.event_name.clone(),
            job_name: self.job_name.clone(),
            job_execution_id: self.job_execution_id.clone(),
            correlation_id: self.correlation_id.clone(),
        };
        // A panicking attempt may poison the lock; its entries are still wanted.
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Take every entry written so far.
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *entries)
    }
}

// ── Context ──────────────────────────────────────────────────────────

/// Everything a job receives for one execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub event_name: String,
    pub job_name: String,
    pub job_execution_id: String,
    pub correlation_id: CorrelationId,
    pub event: Arc<ChangeEvent>,
    /// Opaque caller metadata passed through unchanged.
    pub context: Arc<Value>,
    pub options: JobOptions,
    /// Fires when the job's own timeout elapses or the invocation is cancelled.
    pub cancel: CancellationToken,
    pub log: JobLogger,
    /// 1-based attempt number.
    pub attempt: u32,
    pub(crate) tracking: TrackingManager,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Lineage token to stamp into any row this job writes.
    ///
    /// Continues the lineage of `options.source_tracking_token` when it is
    /// valid; otherwise roots a new lineage at this event's name.
    pub fn tracking_token(&self) -> TrackingToken {
        self.tracking_token_from(&self.event_name)
    }

    /// As [`tracking_token`](Self::tracking_token) with an explicit fallback source.
    pub fn tracking_token_from(&self, fallback_source: &str) -> TrackingToken {
        self.tracking.for_job(
            &self.event,
            self.options.source_tracking_token.as_deref(),
            fallback_source,
            &self.job_execution_id,
        )
    }
}
