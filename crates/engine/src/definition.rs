//! Event definitions: a named detector predicate paired with a job handler.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use changeflow_core::{ChangeEvent, CorrelationId};

use crate::job::JobDescriptor;

/// A detector predicate failed.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A handler could not produce its job list.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Invocation-scoped values handed to detectors and handlers.
#[derive(Debug, Clone)]
pub struct DetectionContext {
    pub correlation_id: CorrelationId,
    /// Opaque caller metadata passed through unchanged.
    pub context: Arc<Value>,
}

/// Decides whether a change represents a named business event.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(
        &self,
        event_name: &str,
        event: &ChangeEvent,
        ctx: &DetectionContext,
    ) -> Result<bool, DetectorError>;
}

/// Produces the jobs a detected event implies.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        event_name: &str,
        event: &ChangeEvent,
        ctx: &DetectionContext,
    ) -> Result<Vec<JobDescriptor>, HandlerError>;
}

// ── Closure adapters ─────────────────────────────────────────────────

/// Detector backed by a synchronous closure. Built with [`detector_fn`].
pub struct FnDetector<F>(F);

/// Wrap a closure as a [`Detector`].
pub fn detector_fn<F>(f: F) -> FnDetector<F>
where
    F: Fn(&str, &ChangeEvent, &DetectionContext) -> Result<bool, DetectorError> + Send + Sync,
{
    FnDetector(f)
}

#[async_trait]
impl<F> Detector for FnDetector<F>
where
    F: Fn(&str, &ChangeEvent, &DetectionContext) -> Result<bool, DetectorError> + Send + Sync,
{
    async fn detect(
        &self,
        event_name: &str,
        event: &ChangeEvent,
        ctx: &DetectionContext,
    ) -> Result<bool, DetectorError> {
        (self.0)(event_name, event, ctx)
    }
}

/// Handler backed by a synchronous closure. Built with [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap a closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&str, &ChangeEvent, &DetectionContext) -> Result<Vec<JobDescriptor>, HandlerError>
        + Send
        + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&str, &ChangeEvent, &DetectionContext) -> Result<Vec<JobDescriptor>, HandlerError>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        event_name: &str,
        event: &ChangeEvent,
        ctx: &DetectionContext,
    ) -> Result<Vec<JobDescriptor>, HandlerError> {
        (self.0)(event_name, event, ctx)
    }
}

// ── EventDefinition ──────────────────────────────────────────────────

/// A named detector/handler pair.
#[derive(Clone)]
pub struct EventDefinition {
    pub name: String,
    pub detector: Arc<dyn Detector>,
    pub handler: Arc<dyn Handler>,
}

impl EventDefinition {
    pub fn new(
        name: impl Into<String>,
        detector: impl Detector + 'static,
        handler: impl Handler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            detector: Arc::new(detector),
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for EventDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
