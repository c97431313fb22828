//! Retry policy for the stub insertion engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds for the compare-and-set retry loop
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InsertionConfig {
    /// Attempts per insertion before surfacing a conflict (>= 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Overall budget for one insertion including retries
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Base for the jittered pause between attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_deadline_ms() -> u64 {
    5000
}

fn default_backoff_ms() -> u64 {
    5
}

impl InsertionConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl Default for InsertionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            deadline_ms: default_deadline_ms(),
            backoff_ms: default_backoff_ms(),
        }
    }
}
