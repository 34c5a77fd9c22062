use std::env;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => true,
        Some("0") | Some("false") | Some("FALSE") | Some("no") => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub timeout: TimeoutSettings,
    /// Row column that carries lineage tokens written by earlier jobs.
    pub tracking_token_column: String,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CHANGEFLOW_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CHANGEFLOW_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            timeout: TimeoutSettings::from_env_profiled(p),
            tracking_token_column: profiled_env_or(p, "TRACKING_TOKEN_COLUMN", "updated_by"),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  timeout:     enabled={}, max_execution={}ms, safety_margin={}ms, max_job={}ms",
            self.timeout.enabled,
            self.timeout.max_execution_time_ms,
            self.timeout.safety_margin_ms,
            self.timeout.max_job_execution_time_ms,
        );
        tracing::info!("  tracking:    column={}", self.tracking_token_column);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeout.validate()?;
        if self.tracking_token_column.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TRACKING_TOKEN_COLUMN".to_string(),
                value: self.tracking_token_column.clone(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: String::new(),
            timeout: TimeoutSettings::default(),
            tracking_token_column: "updated_by".to_string(),
        }
    }
}

// ── Timeout ───────────────────────────────────────────────────

/// Static part of the execution time budget.
///
/// The live host callback that reports remaining runtime is supplied per
/// invocation and is not part of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub enabled: bool,
    /// Stop admitting work this long before the host kills the process.
    pub safety_margin_ms: u64,
    pub max_execution_time_ms: u64,
    /// Per-job timeout when the job does not declare one.
    pub max_job_execution_time_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            safety_margin_ms: 2_000,
            max_execution_time_ms: 10_000,
            max_job_execution_time_ms: 3_000,
        }
    }
}

impl TimeoutSettings {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            enabled: profiled_env_bool(p, "TIMEOUT_ENABLED", d.enabled),
            safety_margin_ms: profiled_env_u64(p, "SAFETY_MARGIN_MS", d.safety_margin_ms),
            max_execution_time_ms: profiled_env_u64(p, "MAX_EXECUTION_TIME_MS", d.max_execution_time_ms),
            max_job_execution_time_ms: profiled_env_u64(
                p,
                "MAX_JOB_EXECUTION_TIME_MS",
                d.max_job_execution_time_ms,
            ),
        }
    }

    /// Settings with the budget switched off entirely.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.max_execution_time_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_EXECUTION_TIME_MS".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_job_execution_time_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_JOB_EXECUTION_TIME_MS".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}
