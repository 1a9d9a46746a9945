use std::{fmt, str::FromStr, time::Duration};

use crate::retry::policy::RetryPolicy;

/// What a worker does after a task it ran has failed.
///
/// Failures to reach the queue always stop the worker regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Record the failure on the task, then deactivate the worker.
    #[default]
    StopWorker,
    /// Record the failure on the task and keep polling.
    RecordOnly,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop-worker" | "stop" => Ok(FailurePolicy::StopWorker),
            "record-only" | "record" => Ok(FailurePolicy::RecordOnly),
            other => Err(format!("unknown failure policy '{other}' (expected stop-worker or record-only)")),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::StopWorker => f.write_str("stop-worker"),
            FailurePolicy::RecordOnly => f.write_str("record-only"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Longest a worker blocks on an empty queue before re-checking shutdown.
    pub poll_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub workers_per_type: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            failure_policy: FailurePolicy::default(),
            workers_per_type: 1,
            retry: RetryPolicy::default(),
        }
    }
}
