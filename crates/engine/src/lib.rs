//! Event detection and job orchestration engine.
//!
//! This crate provides:
//! - `EventRegistry` of named detector/handler pairs
//! - `DetectionDispatcher` evaluating detectors in registration order
//! - `JobOrchestrator` running jobs concurrently under a shrinking time budget
//! - `HookBus` fanning lifecycle notifications out to plugins
//! - `Engine::process_event`, the single entry point tying it together

pub mod deadline;
pub mod definition;
pub mod detection;
pub mod engine;
pub mod hooks;
pub mod job;
pub mod loader;
pub mod options;
pub mod orchestrator;
mod panic;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use deadline::{Deadline, RemainingTimeFn};
pub use definition::{
    detector_fn, handler_fn, DetectionContext, Detector, DetectorError, EventDefinition, Handler,
    HandlerError,
};
pub use detection::{DetectionDispatcher, DetectionOutcome};
pub use engine::{Engine, EngineBuilder, EngineError};
pub use hooks::{HookBus, HookContext, HookError, JobStart, Plugin, TrackingTokenPlugin};
pub use job::{job_fn, Job, JobContext, JobDescriptor, JobError, JobLogger, JobOptions};
pub use loader::{
    EventModule, EventModuleLoadError, EventModuleLoader, LoadReport, LoadResult, LoadStatus,
};
pub use options::{ProcessOptions, TimeoutConfig};
pub use orchestrator::{EventJobs, JobOrchestrator};
pub use registry::{EventRegistry, RegistryError};

pub use changeflow_core as core;
