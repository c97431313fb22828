//! Retention sweep configuration.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Stubs recorded on or before `today - max_age_days` are purged
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    /// Seconds between sweeps (0 = run once)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_age_days() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl RetentionConfig {
    /// Inclusive cutoff date relative to `today`
    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(self.max_age_days))
            .unwrap_or(NaiveDate::MIN)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}
