//! Result structures produced by one invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation::CorrelationId;

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One entry written through a job's logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub event_name: String,
    pub job_name: String,
    pub job_execution_id: String,
    pub correlation_id: CorrelationId,
}

/// Outcome of a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionResult {
    pub name: String,
    pub job_execution_id: String,
    pub correlation_id: CorrelationId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub completed: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub aborted: bool,
    /// Number of times the job function was called (0 when never admitted).
    pub attempts: u32,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl JobExecutionResult {
    /// A job that was never started because the invocation ran out of budget.
    pub fn not_started(
        name: impl Into<String>,
        job_execution_id: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            job_execution_id: job_execution_id.into(),
            correlation_id,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            completed: false,
            result: None,
            error: Some("invocation time budget exhausted before job start".to_string()),
            aborted: true,
            attempts: 0,
            logs: Vec::new(),
        }
    }

    pub fn failed(&self) -> bool {
        !self.completed && !self.aborted
    }
}

/// Outcome of evaluating one event definition, with the jobs it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub event_name: String,
    pub detected: bool,
    pub detection_duration_ms: u64,
    pub error: Option<String>,
    /// Set when the detector matched but the handler failed to produce jobs.
    pub handler_error: Option<String>,
    pub jobs: Vec<JobExecutionResult>,
}

impl DetectionResult {
    pub fn new(event_name: impl Into<String>, detected: bool, detection_duration_ms: u64) -> Self {
        Self {
            event_name: event_name.into(),
            detected,
            detection_duration_ms,
            error: None,
            handler_error: None,
            jobs: Vec::new(),
        }
    }

    pub fn failed(
        event_name: impl Into<String>,
        detection_duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(event_name, false, detection_duration_ms)
        }
    }
}

/// Aggregated result of one `process_event` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub correlation_id: CorrelationId,
    pub source_id: String,
    /// One entry per evaluated definition, in registration order.
    pub events: Vec<DetectionResult>,
    /// Definitions never evaluated because the time budget ran out.
    pub skipped_events: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub timed_out: bool,
}

impl InvocationResult {
    /// Names of the events whose detector matched, in registration order.
    pub fn detected_events(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| e.detected)
            .map(|e| e.event_name.as_str())
            .collect()
    }

    pub fn event(&self, name: &str) -> Option<&DetectionResult> {
        self.events.iter().find(|e| e.event_name == name)
    }

    /// Every job result across all detected events.
    pub fn jobs(&self) -> impl Iterator<Item = &JobExecutionResult> {
        self.events.iter().flat_map(|e| e.jobs.iter())
    }

    pub fn started_job_count(&self) -> usize {
        self.jobs().filter(|j| j.attempts > 0).count()
    }

    pub fn failed_job_count(&self) -> usize {
        self.jobs().filter(|j| j.failed()).count()
    }
}
