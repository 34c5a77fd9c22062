//! Plugin hook bus.
//!
//! Plugins observe the pipeline: they are told when a call is configured,
//! when each job starts and ends, what jobs log, and when the invocation
//! completes. Only `on_pre_configure` can influence the pipeline.

mod bus;
mod traits;
mod tracking;

pub use bus::HookBus;
pub use traits::{HookContext, HookError, JobStart, Plugin};
pub use tracking::TrackingTokenPlugin;
