//! Per-call options for [`Engine::process_event`](crate::Engine::process_event).

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use changeflow_core::TimeoutSettings;

use crate::deadline::RemainingTimeFn;
use crate::hooks::Plugin;

/// Time budget for one invocation.
#[derive(Clone, Default)]
pub struct TimeoutConfig {
    pub settings: TimeoutSettings,
    /// Live host callback reporting milliseconds until the process is killed.
    pub remaining_time: Option<RemainingTimeFn>,
}

impl TimeoutConfig {
    pub fn new(settings: TimeoutSettings) -> Self {
        Self {
            settings,
            remaining_time: None,
        }
    }

    pub fn with_remaining_time<F>(mut self, f: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.remaining_time = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for TimeoutConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutConfig")
            .field("settings", &self.settings)
            .field("remaining_time", &self.remaining_time.as_ref().map(|cb| cb()))
            .finish()
    }
}

/// Options recognized by one `process_event` call.
#[derive(Clone, Default)]
pub struct ProcessOptions {
    /// Run the engine's module loader once before the first dispatch.
    pub auto_load_event_modules: bool,
    /// Passed through to the module loader.
    pub event_modules_directory: Option<String>,
    /// Only these definitions are evaluated. `None` evaluates all of them.
    pub listened_events: Option<Vec<String>>,
    /// Opaque caller metadata handed to every detector, handler, job and hook.
    pub context: Value,
    /// Reused as the invocation's correlation id when well-formed.
    pub correlation_id: Option<String>,
    /// Lineage token inherited by jobs that do not declare their own.
    pub source_tracking_token: Option<String>,
    /// Observers for this call only, notified after the engine's own plugins.
    pub plugins: Vec<Arc<dyn Plugin>>,
    /// Falls back to the engine's configured settings when `None`.
    pub timeout_config: Option<TimeoutConfig>,
    /// External cancellation of the whole invocation (e.g. on shutdown).
    pub cancellation: Option<CancellationToken>,
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn listen_to<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listened_events = Some(events.into_iter().map(Into::into).collect());
        self
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout_config = Some(timeout);
        self
    }

    pub fn auto_load(mut self, directory: Option<&str>) -> Self {
        self.auto_load_event_modules = true;
        self.event_modules_directory = directory.map(str::to_string);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins: Vec<&str> = self.plugins.iter().map(|p| p.name()).collect();
        f.debug_struct("ProcessOptions")
            .field("auto_load_event_modules", &self.auto_load_event_modules)
            .field("event_modules_directory", &self.event_modules_directory)
            .field("listened_events", &self.listened_events)
            .field("context", &self.context)
            .field("correlation_id", &self.correlation_id)
            .field("source_tracking_token", &self.source_tracking_token)
            .field("plugins", &plugins)
            .field("timeout_config", &self.timeout_config)
            .finish()
    }
}
