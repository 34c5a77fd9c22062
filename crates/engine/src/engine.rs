//! `Engine`: the registry, the engine-level plugins and configuration, and
//! the single `process_event` entry point tying the pipeline together.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, instrument, warn, Span};

use changeflow_core::{ChangeEvent, Config, CorrelationId, InvocationResult};
use changeflow_webhook::{parse_value, PayloadParseError};

use crate::deadline::Deadline;
use crate::definition::{DetectionContext, Detector, EventDefinition, Handler};
use crate::detection::DetectionDispatcher;
use crate::hooks::{HookBus, HookContext, HookError, Plugin, TrackingTokenPlugin};
use crate::loader::{load_into, EventModuleLoader, LoadReport};
use crate::options::ProcessOptions;
use crate::orchestrator::JobOrchestrator;
use crate::registry::{EventRegistry, RegistryError};

/// Fatal errors of a `process_event` call. Everything else is reported
/// inside the [`InvocationResult`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid change event payload: {0}")]
    Payload(#[from] PayloadParseError),

    #[error("pre-configure hook failed: {0}")]
    Configuration(#[source] HookError),
}

pub struct Engine {
    registry: EventRegistry,
    plugins: Vec<Arc<dyn Plugin>>,
    config: Config,
    loader: Option<Arc<dyn EventModuleLoader>>,
    /// Modules found by the one lazy discovery pass.
    discovered: OnceCell<Vec<EventDefinition>>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        detector: impl Detector + 'static,
        handler: impl Handler + 'static,
    ) -> Result<(), RegistryError> {
        self.registry.register(name, detector, handler)
    }

    /// Eagerly register every module `loader` finds.
    pub async fn load_event_modules(
        &mut self,
        loader: &dyn EventModuleLoader,
        directory: Option<&str>,
    ) -> LoadReport {
        load_into(&mut self.registry, loader, directory).await
    }

    /// Parse `raw` as JSON, then run [`process_event`](Self::process_event).
    pub async fn process_event_str(
        &self,
        raw: &str,
        options: ProcessOptions,
    ) -> Result<InvocationResult, EngineError> {
        let value: Value = serde_json::from_str(raw).map_err(PayloadParseError::InvalidJson)?;
        self.process_event(&value, options).await
    }

    /// Detect the business events `raw` represents and run their jobs.
    ///
    /// Fails only when the payload is malformed or a plugin rejects the
    /// configuration; detector, handler and job failures and timeouts are
    /// all reported in the returned result.
    #[instrument(skip_all, fields(correlation_id = field::Empty, source_id = field::Empty))]
    pub async fn process_event(
        &self,
        raw: &Value,
        options: ProcessOptions,
    ) -> Result<InvocationResult, EngineError> {
        let started_at = Utc::now();
        let started = Instant::now();

        let event = Arc::new(parse_value(raw)?);

        let options = HookBus::new(self.plugins_for(&options))
            .pre_configure(raw, options)
            .await
            .map_err(EngineError::Configuration)?;
        let hooks = HookBus::new(self.plugins_for(&options));

        let correlation_id = CorrelationId::resolve(options.correlation_id.as_deref());
        let span = Span::current();
        span.record("correlation_id", correlation_id.as_str());
        span.record("source_id", event.source_id.as_str());

        let (settings, remaining_time) = match &options.timeout_config {
            Some(timeout) => (timeout.settings.clone(), timeout.remaining_time.clone()),
            None => (self.config.timeout.clone(), None),
        };
        let deadline = Deadline::start(&settings, remaining_time);
        let exhausted_at_start = !deadline.has_budget();
        if exhausted_at_start {
            warn!(correlation_id = %correlation_id, "Time budget exhausted before detection");
        }

        let context = Arc::new(options.context.clone());
        let hook_ctx = HookContext {
            correlation_id: correlation_id.clone(),
            source_id: event.source_id.clone(),
            context: context.clone(),
        };
        let detection_ctx = DetectionContext {
            correlation_id: correlation_id.clone(),
            context,
        };

        let candidates = self.candidates(&options).await;
        let detection = DetectionDispatcher::new(&deadline)
            .dispatch(&candidates, &event, &detection_ctx)
            .await;

        let outcomes = JobOrchestrator::new(&deadline, &settings, &hooks, &hook_ctx)
            .cancellation(options.cancellation.clone().unwrap_or_else(CancellationToken::new))
            .source_tracking_token(options.source_tracking_token.clone())
            .run(&detection.detected, event.clone(), &detection_ctx)
            .await;

        let mut timed_out = detection.timed_out || exhausted_at_start;
        let mut events = detection.results;
        for outcome in outcomes {
            timed_out |= outcome.timed_out;
            if let Some(result) = events.iter_mut().find(|r| r.event_name == outcome.event_name) {
                result.handler_error = outcome.handler_error;
                result.jobs = outcome.jobs;
            }
        }

        let result = InvocationResult {
            correlation_id,
            source_id: event.source_id.clone(),
            events,
            skipped_events: detection.skipped,
            started_at,
            total_duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
        };

        hooks.invocation_complete(&hook_ctx, &result).await;
        log_summary(&event, &result);
        Ok(result)
    }

    /// Engine plugins first, then the call's own.
    fn plugins_for(&self, options: &ProcessOptions) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .chain(options.plugins.iter())
            .cloned()
            .collect()
    }

    async fn candidates(&self, options: &ProcessOptions) -> Vec<EventDefinition> {
        let listened = options.listened_events.as_deref();
        let mut candidates = self.registry.candidates_for(listened);

        if !options.auto_load_event_modules {
            return candidates;
        }
        let Some(loader) = &self.loader else {
            debug!("Auto-load requested but no event module loader is configured");
            return candidates;
        };

        let discovered = self
            .discovered
            .get_or_init(|| self.discover(loader.as_ref(), options.event_modules_directory.as_deref()))
            .await;
        candidates.extend(
            discovered
                .iter()
                .filter(|d| listened.map_or(true, |allow| allow.iter().any(|a| a == &d.name)))
                .cloned(),
        );
        candidates
    }

    async fn discover(
        &self,
        loader: &dyn EventModuleLoader,
        directory: Option<&str>,
    ) -> Vec<EventDefinition> {
        let mut found = EventRegistry::new();
        load_into(&mut found, loader, directory).await;

        found
            .candidates()
            .iter()
            .filter(|definition| {
                let shadowed = self.registry.contains(&definition.name);
                if shadowed {
                    warn!(event = %definition.name, "Discovered module shadowed by explicit registration, skipping");
                }
                !shadowed
            })
            .cloned()
            .collect()
    }
}

fn log_summary(event: &ChangeEvent, result: &InvocationResult) {
    info!(
        correlation_id = %result.correlation_id,
        table = %event.table,
        op = %event.operation,
        evaluated = result.events.len(),
        detected = result.detected_events().len(),
        skipped = result.skipped_events.len(),
        jobs_started = result.started_job_count(),
        jobs_failed = result.failed_job_count(),
        timed_out = result.timed_out,
        duration_ms = result.total_duration_ms,
        "Invocation complete"
    );
}

// ── Builder ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct EngineBuilder {
    config: Option<Config>,
    plugins: Vec<Arc<dyn Plugin>>,
    loader: Option<Arc<dyn EventModuleLoader>>,
    track_lineage: bool,
}

impl EngineBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Engine-level plugin, notified before any per-call plugin.
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Collaborator used when a call sets `auto_load_event_modules`.
    pub fn loader(mut self, loader: impl EventModuleLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Install [`TrackingTokenPlugin`] on the configured tracking column,
    /// ahead of every other plugin.
    pub fn track_lineage(mut self) -> Self {
        self.track_lineage = true;
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config.unwrap_or_default();
        let mut plugins = self.plugins;
        if self.track_lineage {
            plugins.insert(
                0,
                Arc::new(TrackingTokenPlugin::new(config.tracking_token_column.clone())),
            );
        }

        Engine {
            registry: EventRegistry::new(),
            plugins,
            config,
            loader: self.loader,
            discovered: OnceCell::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::definition::{detector_fn, handler_fn};
    use crate::loader::{EventModule, EventModuleLoadError};

    fn payload() -> Value {
        json!({
            "event": {
                "op": "UPDATE",
                "data": {
                    "old": {"id": 1, "status": "pending"},
                    "new": {"id": 1, "status": "cancelled"}
                },
                "session_variables": {"x-hasura-role": "user"}
            },
            "table": {"schema": "public", "name": "orders"},
            "id": "evt-1",
            "created_at": "2024-05-01T10:00:00Z"
        })
    }

    struct Refuse;

    #[async_trait]
    impl Plugin for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        async fn on_pre_configure(
            &self,
            _payload: &Value,
            _options: ProcessOptions,
        ) -> Result<ProcessOptions, HookError> {
            Err(HookError::Failed("tenant not allowed".to_string()))
        }
    }

    struct CountingLoader(Arc<AtomicUsize>);

    #[async_trait]
    impl EventModuleLoader for CountingLoader {
        async fn load(
            &self,
            _directory: Option<&str>,
        ) -> Vec<Result<EventModule, EventModuleLoadError>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            vec![
                Ok(EventModule::new(
                    "events/orders_touched",
                    "orders.touched",
                    detector_fn(|_, _, _| Ok(true)),
                    handler_fn(|_, _, _| Ok(Vec::new())),
                )),
                Ok(EventModule::new(
                    "events/orders_cancelled",
                    "orders.cancelled",
                    detector_fn(|_, _, _| Ok(false)),
                    handler_fn(|_, _, _| Ok(Vec::new())),
                )),
            ]
        }
    }

    #[tokio::test]
    async fn failing_pre_configure_is_fatal() {
        let engine = Engine::builder().plugin(Refuse).build();
        let err = engine.process_event(&payload(), ProcessOptions::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_fatal() {
        let engine = Engine::new(Config::default());
        let err = engine
            .process_event_str("{not json", ProcessOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Payload(PayloadParseError::InvalidJson(_))));

        let err = engine
            .process_event(&json!({"event": {}}), ProcessOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Payload(_)));
    }

    #[tokio::test]
    async fn discovery_runs_once_and_explicit_registration_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut engine = Engine::builder().loader(CountingLoader(calls.clone())).build();
        engine
            .register(
                "orders.cancelled",
                detector_fn(|_, e, _| Ok(e.column_changed("status"))),
                handler_fn(|_, _, _| Ok(Vec::new())),
            )
            .unwrap();

        for _ in 0..2 {
            let result = engine
                .process_event(&payload(), ProcessOptions::new().auto_load(Some("events")))
                .await
                .unwrap();
            assert_eq!(result.detected_events(), vec!["orders.cancelled", "orders.touched"]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let result = engine.process_event(&payload(), ProcessOptions::new()).await.unwrap();
        assert_eq!(result.detected_events(), vec!["orders.cancelled"]);
    }

    #[tokio::test]
    async fn tracking_token_in_row_sets_correlation_id() {
        let engine = Engine::builder().track_lineage().build();
        let mut raw = payload();
        raw["event"]["data"]["new"]["updated_by"] = json!("v1|billing.refund|corr-42|job-1");

        let result = engine.process_event(&raw, ProcessOptions::new()).await.unwrap();
        assert_eq!(result.correlation_id.as_str(), "corr-42");
        assert_eq!(result.source_id, "evt-1");
    }
}
