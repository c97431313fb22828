//! Scenario lifecycle: explicit creation, cascading removal and retention.

mod manager;

pub use manager::{RetentionReport, ScenarioLifecycleManager, SweepReport};
