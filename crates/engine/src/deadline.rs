//! Shrinking execution-time budget for one invocation.
//!
//! The budget is `min(max_execution_time, remaining_runtime() - safety_margin)`.
//! `remaining_runtime` is a live callback supplied by the host (a serverless
//! runtime reports how long it will let the process live), so the budget is
//! re-evaluated on every query rather than fixed at start.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use changeflow_core::TimeoutSettings;

/// How often a live host callback is re-read while waiting on the budget.
const HOST_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Host callback returning milliseconds until the process is killed.
/// May go negative once the limit has passed.
pub type RemainingTimeFn = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Clone)]
pub struct Deadline {
    enabled: bool,
    started: Instant,
    max_execution: Duration,
    safety_margin: Duration,
    remaining_runtime: Option<RemainingTimeFn>,
}

impl Deadline {
    /// Start the clock now.
    pub fn start(settings: &TimeoutSettings, remaining_runtime: Option<RemainingTimeFn>) -> Self {
        Self {
            enabled: settings.enabled,
            started: Instant::now(),
            max_execution: Duration::from_millis(settings.max_execution_time_ms),
            safety_margin: Duration::from_millis(settings.safety_margin_ms),
            remaining_runtime,
        }
    }

    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self::start(&TimeoutSettings::disabled(), None)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before new work must stop. `Duration::MAX` when disabled.
    pub fn remaining(&self) -> Duration {
        if !self.enabled {
            return Duration::MAX;
        }

        let by_max = self.max_execution.saturating_sub(self.started.elapsed());
        match self.host_remaining_ms() {
            Some(host_ms) => {
                let budget_ms = host_ms - self.safety_margin.as_millis() as i64;
                if budget_ms <= 0 {
                    Duration::ZERO
                } else {
                    by_max.min(Duration::from_millis(budget_ms as u64))
                }
            }
            None => by_max,
        }
    }

    /// Whether new detectors or jobs may still be started.
    pub fn has_budget(&self) -> bool {
        !self.remaining().is_zero()
    }

    /// Time until the host limit itself, ignoring the safety margin.
    ///
    /// Jobs still running past this point are abandoned. `None` when the
    /// budget is disabled.
    pub fn hard_stop(&self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let by_max = (self.max_execution + self.safety_margin).saturating_sub(self.started.elapsed());
        Some(match self.host_remaining_ms() {
            Some(host_ms) => by_max.min(Duration::from_millis(host_ms.max(0) as u64)),
            None => by_max,
        })
    }

    /// Resolves once the budget runs out. Never resolves when disabled.
    pub async fn exhausted(&self) {
        self.wait_until_zero(Self::remaining).await
    }

    /// Resolves at the hard stop. Never resolves when disabled.
    pub async fn hard_stop_reached(&self) {
        self.wait_until_zero(|d| d.hard_stop().unwrap_or(Duration::MAX)).await
    }

    async fn wait_until_zero(&self, left: impl Fn(&Self) -> Duration) {
        if !self.enabled {
            return std::future::pending().await;
        }
        loop {
            let left = left(self);
            if left.is_zero() {
                return;
            }
            // The host callback can drop at any moment, so it is polled.
            let step = match self.remaining_runtime {
                Some(_) => left.min(HOST_POLL_INTERVAL),
                None => left,
            };
            sleep(step).await;
        }
    }

    fn host_remaining_ms(&self) -> Option<i64> {
        self.remaining_runtime.as_ref().map(|f| f())
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deadline")
            .field("enabled", &self.enabled)
            .field("elapsed", &self.elapsed())
            .field("remaining", &self.remaining())
            .finish()
    }
}
