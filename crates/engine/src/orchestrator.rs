//! Concurrent job execution for detected events.
//!
//! Every detected event's handler is called, and every job it returns runs
//! concurrently on the calling task. Each job gets its own timeout, clipped
//! to what is left of the invocation budget, and a child cancellation token
//! that fires when that timeout elapses. When the invocation budget itself
//! runs out every running job is cancelled. A job that ignores cancellation
//! keeps running, and its late result is kept, until the hard stop; only
//! then is its future dropped.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use changeflow_core::{ChangeEvent, JobExecutionResult, TimeoutSettings, TrackingManager};

use crate::deadline::Deadline;
use crate::definition::{DetectionContext, EventDefinition};
use crate::hooks::{HookBus, HookContext, JobStart};
use crate::job::{JobContext, JobDescriptor, JobError, JobLogger, JobOptions};
use crate::panic::panic_message;

/// Jobs run on behalf of one detected event.
#[derive(Debug, Clone)]
pub struct EventJobs {
    pub event_name: String,
    pub handler_error: Option<String>,
    /// In the order the handler declared them.
    pub jobs: Vec<JobExecutionResult>,
    /// The invocation budget, not a job's own timeout, cut this event short.
    pub timed_out: bool,
}

/// How a single job ended, before it is turned into a result.
enum JobOutcome {
    Returned(Result<Value, JobError>),
    Abandoned,
}

pub struct JobOrchestrator<'a> {
    deadline: &'a Deadline,
    settings: &'a TimeoutSettings,
    hooks: &'a HookBus,
    hook_ctx: &'a HookContext,
    tracking: TrackingManager,
    cancel: CancellationToken,
    budget_spent: AtomicBool,
    source_tracking_token: Option<String>,
}

impl<'a> JobOrchestrator<'a> {
    pub fn new(
        deadline: &'a Deadline,
        settings: &'a TimeoutSettings,
        hooks: &'a HookBus,
        hook_ctx: &'a HookContext,
    ) -> Self {
        Self {
            deadline,
            settings,
            hooks,
            hook_ctx,
            tracking: TrackingManager::new(hook_ctx.correlation_id.clone()),
            cancel: CancellationToken::new(),
            budget_spent: AtomicBool::new(false),
            source_tracking_token: None,
        }
    }

    /// Invocation-wide token; every job token descends from it. Running out
    /// of budget cancels a child of `token`, never `token` itself.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token.child_token();
        self
    }

    /// Token inherited by jobs that do not declare their own.
    pub fn source_tracking_token(mut self, token: Option<String>) -> Self {
        self.source_tracking_token = token;
        self
    }

    /// Run the jobs of every detected event. Output follows `detected` order.
    pub async fn run(
        &self,
        detected: &[EventDefinition],
        event: Arc<ChangeEvent>,
        ctx: &DetectionContext,
    ) -> Vec<EventJobs> {
        let work = join_all(
            detected
                .iter()
                .map(|definition| self.run_event(definition, event.clone(), ctx)),
        );
        tokio::pin!(work);

        tokio::select! {
            biased;
            outcomes = &mut work => return outcomes,
            _ = self.deadline.exhausted() => {
                self.budget_spent.store(true, Ordering::SeqCst);
                warn!(
                    correlation_id = %ctx.correlation_id,
                    "Time budget exhausted, cancelling running jobs"
                );
                self.cancel.cancel();
            }
        }

        work.await
    }

    async fn run_event(
        &self,
        definition: &EventDefinition,
        event: Arc<ChangeEvent>,
        ctx: &DetectionContext,
    ) -> EventJobs {
        let event_name = definition.name.as_str();
        let mut outcome = EventJobs {
            event_name: event_name.to_string(),
            handler_error: None,
            jobs: Vec::new(),
            timed_out: false,
        };

        if !self.deadline.has_budget() {
            warn!(correlation_id = %ctx.correlation_id, event = event_name, "Time budget exhausted before handler");
            outcome.handler_error = Some("invocation time budget exhausted before handler".to_string());
            outcome.timed_out = true;
            return outcome;
        }

        let call = AssertUnwindSafe(definition.handler.handle(event_name, &event, ctx)).catch_unwind();
        let handled = tokio::select! {
            biased;
            handled = call => Some(handled),
            _ = self.deadline.exhausted() => None,
        };

        let descriptors = match handled {
            Some(Ok(Ok(descriptors))) => descriptors,
            Some(Ok(Err(e))) => {
                warn!(correlation_id = %ctx.correlation_id, event = event_name, error = %e, "Handler failed");
                outcome.handler_error = Some(e.to_string());
                return outcome;
            }
            Some(Err(panic)) => {
                let message = format!("handler panicked: {}", panic_message(panic));
                warn!(correlation_id = %ctx.correlation_id, event = event_name, error = %message, "Handler failed");
                outcome.handler_error = Some(message);
                return outcome;
            }
            None => {
                warn!(correlation_id = %ctx.correlation_id, event = event_name, "Handler timed out");
                outcome.handler_error = Some("handler timed out".to_string());
                outcome.timed_out = true;
                return outcome;
            }
        };

        debug!(
            correlation_id = %ctx.correlation_id,
            event = event_name,
            jobs = descriptors.len(),
            "Starting jobs"
        );

        let results = join_all(
            descriptors
                .iter()
                .enumerate()
                .map(|(index, descriptor)| self.run_job(event_name, index, descriptor, event.clone(), ctx)),
        )
        .await;

        for (result, budget_hit) in results {
            outcome.timed_out |= budget_hit;
            outcome.jobs.push(result);
        }
        outcome
    }

    /// Returns the job's result and whether the invocation budget cut it short.
    async fn run_job(
        &self,
        event_name: &str,
        index: usize,
        descriptor: &JobDescriptor,
        event: Arc<ChangeEvent>,
        ctx: &DetectionContext,
    ) -> (JobExecutionResult, bool) {
        let job_name = descriptor
            .options
            .name
            .clone()
            .unwrap_or_else(|| format!("{event_name}#{index}"));
        let job_execution_id = TrackingManager::new_job_execution_id();

        if !self.deadline.has_budget() {
            warn!(
                correlation_id = %ctx.correlation_id,
                event = event_name,
                job = %job_name,
                "Time budget exhausted, job not started"
            );
            let result =
                JobExecutionResult::not_started(job_name, job_execution_id, ctx.correlation_id.clone());
            self.hooks.job_end(self.hook_ctx, &result).await;
            return (result, true);
        }

        let mut options = descriptor.options.clone();
        if options.source_tracking_token.is_none() {
            options.source_tracking_token = self.source_tracking_token.clone();
        }
        let (limit, clipped) = self.job_timeout(&options);
        let cancel = self.cancel.child_token();
        let logger = JobLogger::new(
            event_name,
            job_name.as_str(),
            job_execution_id.as_str(),
            ctx.correlation_id.clone(),
        );

        let start = JobStart {
            event_name: event_name.to_string(),
            job_name: job_name.clone(),
            job_execution_id: job_execution_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            timeout_ms: limit.map(|d| d.as_millis() as u64),
            attempt_limit: options.retries.saturating_add(1),
        };
        self.hooks.job_start(self.hook_ctx, &start, self.deadline).await;

        let started_at = Utc::now();
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let expired = AtomicBool::new(false);

        let base = JobContext {
            event_name: event_name.to_string(),
            job_name: job_name.clone(),
            job_execution_id: job_execution_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            event,
            context: ctx.context.clone(),
            options,
            cancel: cancel.clone(),
            log: logger.clone(),
            attempt: 0,
            tracking: self.tracking.clone(),
        };

        let work = self.attempt(descriptor, base, &attempts);
        let watchdog = async {
            match limit {
                Some(limit) => {
                    tokio::select! {
                        _ = sleep(limit) => {
                            expired.store(true, Ordering::SeqCst);
                            cancel.cancel();
                        }
                        _ = cancel.cancelled() => {}
                    }
                }
                None => cancel.cancelled().await,
            }
            self.deadline.hard_stop_reached().await;
        };

        let outcome = tokio::select! {
            biased;
            returned = work => JobOutcome::Returned(returned),
            _ = watchdog => JobOutcome::Abandoned,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let aborted = cancel.is_cancelled();
        let expired = expired.load(Ordering::SeqCst);
        let limit_ms = limit.map(|d| d.as_millis()).unwrap_or_default();

        let mut result = JobExecutionResult {
            name: job_name,
            job_execution_id,
            correlation_id: ctx.correlation_id.clone(),
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            completed: false,
            result: None,
            error: None,
            aborted,
            attempts: attempts.load(Ordering::SeqCst),
            logs: Vec::new(),
        };

        match outcome {
            JobOutcome::Returned(Ok(value)) if !aborted => {
                result.completed = true;
                result.result = Some(value);
            }
            JobOutcome::Returned(Ok(value)) => {
                result.result = Some(value);
                result.error = Some(if expired {
                    format!("job finished after its {limit_ms}ms timeout")
                } else {
                    "job finished after the invocation was cancelled".to_string()
                });
            }
            JobOutcome::Returned(Err(e)) => {
                result.error = Some(e.to_string());
            }
            JobOutcome::Abandoned => {
                result.aborted = true;
                result.error = Some("job abandoned at the hard stop".to_string());
            }
        }

        if result.completed {
            info!(
                correlation_id = %result.correlation_id,
                event = event_name,
                job = %result.name,
                attempts = result.attempts,
                duration_ms,
                "Job completed"
            );
        } else {
            warn!(
                correlation_id = %result.correlation_id,
                event = event_name,
                job = %result.name,
                aborted = result.aborted,
                attempts = result.attempts,
                duration_ms,
                error = result.error.as_deref().unwrap_or_default(),
                "Job did not complete"
            );
        }

        result.logs = logger.drain();
        for entry in &result.logs {
            self.hooks.log(self.hook_ctx, entry).await;
        }
        self.hooks.job_end(self.hook_ctx, &result).await;

        let budget_hit =
            result.aborted && ((clipped && expired) || self.budget_spent.load(Ordering::SeqCst));
        (result, budget_hit)
    }

    /// Call the job until it succeeds, runs out of retries, or is cancelled.
    async fn attempt(
        &self,
        descriptor: &JobDescriptor,
        base: JobContext,
        attempts: &AtomicU32,
    ) -> Result<Value, JobError> {
        let retries = base.options.retries;
        loop {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let mut ctx = base.clone();
            ctx.attempt = attempt;

            let returned = match AssertUnwindSafe(descriptor.job.run(ctx)).catch_unwind().await {
                Ok(returned) => returned,
                Err(panic) => Err(JobError::Panicked(panic_message(panic))),
            };

            match returned {
                Ok(value) => return Ok(value),
                Err(e) if attempt > retries || base.is_cancelled() || !self.deadline.has_budget() => {
                    return Err(e);
                }
                Err(e) => {
                    base.log.warn(format!("attempt {attempt} failed, retrying: {e}"));
                }
            }
        }
    }

    /// Effective timeout for a job and whether the invocation budget shortened it.
    fn job_timeout(&self, options: &JobOptions) -> (Option<Duration>, bool) {
        let requested = options
            .timeout_ms
            .or_else(|| self.settings.enabled.then_some(self.settings.max_job_execution_time_ms))
            .map(Duration::from_millis);
        let remaining = self.deadline.remaining();
        match requested {
            Some(requested) if requested <= remaining => (Some(requested), false),
            Some(_) => (Some(remaining), true),
            None => (None, false),
        }
    }
}
