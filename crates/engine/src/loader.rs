//! Interface to an external event-module discovery collaborator.
//!
//! The engine never touches the filesystem. A loader (a directory scanner, a
//! plugin host, a static table compiled into the binary) hands back one
//! result per module; failures are reported and skipped.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::definition::{Detector, EventDefinition, Handler};
use crate::registry::EventRegistry;

/// One event module produced by a loader.
pub struct EventModule {
    /// Where the module came from (file path, package name, ...).
    pub origin: String,
    pub definition: EventDefinition,
}

impl EventModule {
    pub fn new(
        origin: impl Into<String>,
        name: impl Into<String>,
        detector: impl Detector + 'static,
        handler: impl Handler + 'static,
    ) -> Self {
        Self {
            origin: origin.into(),
            definition: EventDefinition::new(name, detector, handler),
        }
    }
}

/// A single event module failed to load.
#[derive(Debug, thiserror::Error)]
#[error("failed to load event module from {origin}: {reason}")]
pub struct EventModuleLoadError {
    pub origin: String,
    pub reason: String,
}

impl EventModuleLoadError {
    pub fn new(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            reason: reason.into(),
        }
    }
}

/// Discovers event modules on behalf of the engine.
#[async_trait]
pub trait EventModuleLoader: Send + Sync {
    /// Load every module found under `directory` (loader default when `None`).
    async fn load(&self, directory: Option<&str>) -> Vec<Result<EventModule, EventModuleLoadError>>;
}

/// Status of a single module load attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded { event_name: String },
    Failed { error: String },
}

/// Outcome of loading a single module.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub origin: String,
    pub status: LoadStatus,
}

/// Per-module outcomes of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub results: Vec<LoadResult>,
}

impl LoadReport {
    pub fn loaded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, LoadStatus::Loaded { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.loaded()
    }
}

/// Run `loader` and register every module that loads cleanly.
///
/// A module that fails to load, or whose name collides with one already in
/// `registry`, is skipped with a warning.
pub async fn load_into(
    registry: &mut EventRegistry,
    loader: &dyn EventModuleLoader,
    directory: Option<&str>,
) -> LoadReport {
    let mut report = LoadReport::default();

    for outcome in loader.load(directory).await {
        let result = match outcome {
            Ok(module) => {
                let event_name = module.definition.name.clone();
                match registry.insert(module.definition) {
                    Ok(()) => LoadResult {
                        origin: module.origin,
                        status: LoadStatus::Loaded { event_name },
                    },
                    Err(e) => {
                        warn!(origin = %module.origin, error = %e, "Skipping event module");
                        LoadResult {
                            origin: module.origin,
                            status: LoadStatus::Failed { error: e.to_string() },
                        }
                    }
                }
            }
            Err(e) => {
                warn!(origin = %e.origin, error = %e.reason, "Skipping event module");
                LoadResult {
                    origin: e.origin.clone(),
                    status: LoadStatus::Failed { error: e.to_string() },
                }
            }
        };
        report.results.push(result);
    }

    info!(
        directory = directory.unwrap_or("(default)"),
        loaded = report.loaded(),
        failed = report.failed(),
        "Event module discovery complete"
    );
    report
}
