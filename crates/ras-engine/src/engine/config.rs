use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::error::RasError;
use crate::store::WorkFilter;

/// Which aspects of pending work the engine handles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    #[default]
    Combined,
    JobIdsOnly,
    ControlOperationsOnly,
}

impl ProcessingMode {
    pub fn correlates(&self) -> bool {
        matches!(self, ProcessingMode::Combined | ProcessingMode::JobIdsOnly)
    }

    pub fn dispatches(&self) -> bool {
        matches!(
            self,
            ProcessingMode::Combined | ProcessingMode::ControlOperationsOnly
        )
    }

    pub fn work_filter(&self) -> WorkFilter {
        WorkFilter {
            job_ids: self.correlates(),
            control_operations: self.dispatches(),
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessingMode::Combined => "combined",
            ProcessingMode::JobIdsOnly => "job-ids-only",
            ProcessingMode::ControlOperationsOnly => "control-operations-only",
        })
    }
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combined" => Ok(ProcessingMode::Combined),
            "job-ids-only" => Ok(ProcessingMode::JobIdsOnly),
            "control-operations-only" => Ok(ProcessingMode::ControlOperationsOnly),
            _ => Err(format!(
                "invalid processing mode `{s}`, expected one of combined, job-ids-only, control-operations-only"
            )),
        }
    }
}

/// Pending work must be at least this old before it is fetched, so that producers have
/// finished writing it.
pub const DEFAULT_DELAY_GATE: Duration = Duration::from_secs(4);
/// Cached jobs that ended more than this long ago are purged from the store.
pub const DEFAULT_JOB_EXPIRY_AGE: Duration = Duration::from_secs(30);
/// Minimum time between two purges of expired jobs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_CAP: u32 = 5;
/// Pause after the event store could not be reached.
pub const DEFAULT_RECONNECT_PAUSE: Duration = Duration::from_secs(10);
pub const DEFAULT_RECURSION_WINDOW: Duration = Duration::from_secs(5 * 60);
/// A node is in a reset recursion if more than this many reset events were logged in the window.
pub const DEFAULT_RECURSION_THRESHOLD: u64 = 1;
/// Batches with at most this many items look up job ids one by one.
pub const DEFAULT_POINT_LOOKUP_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub mode: ProcessingMode,
    pub delay_gate: Duration,
    pub job_expiry_age: Duration,
    pub sweep_interval: Duration,
    pub backoff_step: Duration,
    pub backoff_cap: u32,
    pub reconnect_pause: Duration,
    pub recursion_window: Duration,
    pub recursion_threshold: u64,
    pub point_lookup_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::default(),
            delay_gate: DEFAULT_DELAY_GATE,
            job_expiry_age: DEFAULT_JOB_EXPIRY_AGE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            backoff_step: DEFAULT_BACKOFF_STEP,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            reconnect_pause: DEFAULT_RECONNECT_PAUSE,
            recursion_window: DEFAULT_RECURSION_WINDOW,
            recursion_threshold: DEFAULT_RECURSION_THRESHOLD,
            point_lookup_limit: DEFAULT_POINT_LOOKUP_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Default configuration with overrides from `RAS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Applies overrides provided by `lookup` (durations are in milliseconds).
    /// Values that cannot be parsed are ignored.
    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        let duration = |key: &str| get_number(&lookup, key).map(Duration::from_millis);

        if let Some(value) = duration("RAS_DELAY_GATE_MS") {
            self.delay_gate = value;
        }
        if let Some(value) = duration("RAS_JOB_EXPIRY_AGE_MS") {
            self.job_expiry_age = value;
        }
        if let Some(value) = duration("RAS_SWEEP_INTERVAL_MS") {
            self.sweep_interval = value;
        }
        if let Some(value) = duration("RAS_BACKOFF_STEP_MS") {
            self.backoff_step = value;
        }
        if let Some(value) = get_number(&lookup, "RAS_BACKOFF_CAP") {
            self.backoff_cap = value;
        }
        if let Some(value) = duration("RAS_RECONNECT_PAUSE_MS") {
            self.reconnect_pause = value;
        }
        if let Some(value) = duration("RAS_RECURSION_WINDOW_MS") {
            self.recursion_window = value;
        }
        if let Some(value) = get_number(&lookup, "RAS_RECURSION_THRESHOLD") {
            self.recursion_threshold = value;
        }
        if let Some(value) = get_number(&lookup, "RAS_POINT_LOOKUP_LIMIT") {
            self.point_lookup_limit = value;
        }
    }

    /// Rejects values with which the idle loop would never pause.
    pub fn validate(&self) -> crate::Result<()> {
        if self.backoff_step.is_zero() {
            return Err(RasError::GenericError(
                "backoff step must be greater than zero".to_string(),
            ));
        }
        if self.backoff_cap == 0 {
            return Err(RasError::GenericError(
                "backoff cap must be at least 1".to_string(),
            ));
        }
        if self.reconnect_pause.is_zero() {
            return Err(RasError::GenericError(
                "reconnect pause must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn get_number<T: FromStr, F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse::<T>().ok())
}
