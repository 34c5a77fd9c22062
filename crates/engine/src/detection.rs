//! Detector evaluation in registration order under the invocation budget.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use changeflow_core::{ChangeEvent, DetectionResult};

use crate::deadline::Deadline;
use crate::definition::{DetectionContext, EventDefinition};
use crate::panic::panic_message;

/// What one detection pass produced.
#[derive(Debug, Default)]
pub struct DetectionOutcome {
    /// One result per evaluated definition, in registration order.
    pub results: Vec<DetectionResult>,
    /// Definitions whose detector matched, in registration order.
    pub detected: Vec<EventDefinition>,
    /// Names never evaluated because the budget ran out.
    pub skipped: Vec<String>,
    pub timed_out: bool,
}

/// Runs detectors one after another, stopping once the budget is spent.
///
/// A detector that errors, panics or outlives the budget yields
/// `detected = false` with the error recorded; the next detector still runs.
pub struct DetectionDispatcher<'a> {
    deadline: &'a Deadline,
}

impl<'a> DetectionDispatcher<'a> {
    pub fn new(deadline: &'a Deadline) -> Self {
        Self { deadline }
    }

    pub async fn dispatch(
        &self,
        candidates: &[EventDefinition],
        event: &ChangeEvent,
        ctx: &DetectionContext,
    ) -> DetectionOutcome {
        let mut outcome = DetectionOutcome::default();

        for (index, definition) in candidates.iter().enumerate() {
            if !self.deadline.has_budget() {
                outcome.skipped = candidates[index..].iter().map(|d| d.name.clone()).collect();
                outcome.timed_out = true;
                warn!(
                    correlation_id = %ctx.correlation_id,
                    skipped = outcome.skipped.len(),
                    "Time budget exhausted, skipping remaining detectors"
                );
                break;
            }

            let (result, timed_out) = self.detect_one(definition, event, ctx).await;
            outcome.timed_out |= timed_out;
            if result.detected {
                outcome.detected.push(definition.clone());
            }
            outcome.results.push(result);
        }

        outcome
    }

    async fn detect_one(
        &self,
        definition: &EventDefinition,
        event: &ChangeEvent,
        ctx: &DetectionContext,
    ) -> (DetectionResult, bool) {
        let name = definition.name.as_str();
        let started = Instant::now();
        let detection =
            AssertUnwindSafe(definition.detector.detect(name, event, ctx)).catch_unwind();

        let outcome = tokio::select! {
            biased;
            detected = detection => Some(detected),
            _ = self.deadline.exhausted() => None,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Some(Ok(Ok(detected))) => {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    event = name,
                    detected,
                    duration_ms,
                    "Detector evaluated"
                );
                (DetectionResult::new(name, detected, duration_ms), false)
            }
            Some(Ok(Err(e))) => {
                warn!(correlation_id = %ctx.correlation_id, event = name, error = %e, "Detector failed");
                (DetectionResult::failed(name, duration_ms, e.to_string()), false)
            }
            Some(Err(panic)) => {
                let message = format!("detector panicked: {}", panic_message(panic));
                warn!(correlation_id = %ctx.correlation_id, event = name, error = %message, "Detector failed");
                (DetectionResult::failed(name, duration_ms, message), false)
            }
            None => {
                warn!(correlation_id = %ctx.correlation_id, event = name, duration_ms, "Detector timed out");
                (DetectionResult::failed(name, duration_ms, "detector timed out"), true)
            }
        }
    }
}
