use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

use changeflow_core::{InvocationResult, JobExecutionResult, LogEntry};

use crate::deadline::Deadline;
use crate::options::ProcessOptions;
use crate::panic::panic_message;

use super::traits::{HookContext, HookError, JobStart, Plugin};

/// Ordered fan-out of lifecycle notifications to plugins.
///
/// A failing plugin never stops the others and never changes the outcome of
/// the pipeline; the one exception is [`pre_configure`](HookBus::pre_configure).
#[derive(Clone, Default)]
pub struct HookBus {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl HookBus {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Thread `options` through every plugin's `on_pre_configure` in order.
    ///
    /// The first error (or panic) aborts configuration.
    pub async fn pre_configure(
        &self,
        payload: &Value,
        mut options: ProcessOptions,
    ) -> Result<ProcessOptions, HookError> {
        for plugin in &self.plugins {
            let outcome = AssertUnwindSafe(plugin.on_pre_configure(payload, options))
                .catch_unwind()
                .await;
            options = match outcome {
                Ok(Ok(options)) => options,
                Ok(Err(e)) => {
                    warn!(plugin = plugin.name(), error = %e, "on_pre_configure failed");
                    return Err(e);
                }
                Err(panic) => {
                    let e = HookError::Panicked {
                        plugin: plugin.name().to_string(),
                        message: panic_message(panic),
                    };
                    warn!(plugin = plugin.name(), error = %e, "on_pre_configure panicked");
                    return Err(e);
                }
            };
        }
        Ok(options)
    }

    /// Each plugin is cut off once `deadline` runs out, so a slow observer
    /// cannot hold a job back past the invocation budget.
    pub async fn job_start(&self, ctx: &HookContext, job: &JobStart, deadline: &Deadline) {
        for plugin in &self.plugins {
            let call = AssertUnwindSafe(plugin.on_job_start(ctx, job)).catch_unwind();
            tokio::select! {
                biased;
                outcome = call => report("on_job_start", plugin.as_ref(), ctx, outcome),
                _ = deadline.exhausted() => warn!(
                    hook = "on_job_start",
                    plugin = plugin.name(),
                    correlation_id = %ctx.correlation_id,
                    "Plugin hook cut off by the time budget"
                ),
            }
        }
    }

    pub async fn job_end(&self, ctx: &HookContext, result: &JobExecutionResult) {
        for plugin in &self.plugins {
            let outcome = AssertUnwindSafe(plugin.on_job_end(ctx, result))
                .catch_unwind()
                .await;
            report("on_job_end", plugin.as_ref(), ctx, outcome);
        }
    }

    pub async fn log(&self, ctx: &HookContext, entry: &LogEntry) {
        for plugin in &self.plugins {
            let outcome = AssertUnwindSafe(plugin.on_log(ctx, entry))
                .catch_unwind()
                .await;
            report("on_log", plugin.as_ref(), ctx, outcome);
        }
    }

    pub async fn invocation_complete(&self, ctx: &HookContext, result: &InvocationResult) {
        for plugin in &self.plugins {
            let outcome = AssertUnwindSafe(plugin.on_invocation_complete(ctx, result))
                .catch_unwind()
                .await;
            report("on_invocation_complete", plugin.as_ref(), ctx, outcome);
        }
    }
}

fn report(
    hook: &'static str,
    plugin: &dyn Plugin,
    ctx: &HookContext,
    outcome: Result<Result<(), HookError>, Box<dyn Any + Send>>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            hook,
            plugin = plugin.name(),
            correlation_id = %ctx.correlation_id,
            error = %e,
            "Plugin hook failed"
        ),
        Err(panic) => warn!(
            hook,
            plugin = plugin.name(),
            correlation_id = %ctx.correlation_id,
            panic = %panic_message(panic),
            "Plugin hook panicked"
        ),
    }
}
