//! ScenarioLifecycleManager - scenario creation, removal and retention.
//!
//! Removing a scenario cascades to its stubs and pre-stubs. Retention purges
//! records recorded on or before a cutoff date and drops the scenario once
//! it owns no stubs.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::StubError;
use crate::repository::StubRepository;

/// Counts for one scenario's retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub stubs_deleted: usize,
    pub pre_stubs_deleted: usize,
    /// The scenario record was removed because no stubs remained
    pub scenario_removed: bool,
}

/// Outcome of a retention sweep over several scenarios
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub cutoff: Option<NaiveDate>,
    pub swept: Vec<(String, RetentionReport)>,
    /// Scenarios whose pass failed, with the error message
    pub failed: Vec<(String, String)>,
}

impl SweepReport {
    pub fn stubs_deleted(&self) -> usize {
        self.swept.iter().map(|(_, r)| r.stubs_deleted).sum()
    }

    pub fn pre_stubs_deleted(&self) -> usize {
        self.swept.iter().map(|(_, r)| r.pre_stubs_deleted).sum()
    }

    pub fn scenarios_removed(&self) -> usize {
        self.swept.iter().filter(|(_, r)| r.scenario_removed).count()
    }
}

/// Manages scenario lifecycle over a repository
pub struct ScenarioLifecycleManager {
    repo: Arc<dyn StubRepository>,
}

impl ScenarioLifecycleManager {
    pub fn new(repo: Arc<dyn StubRepository>) -> Self {
        Self { repo }
    }

    /// Register a scenario explicitly. Returns false if it already existed.
    pub fn create(&self, scenario: &str) -> Result<bool, StubError> {
        let created = self.repo.create_scenario(scenario)?;
        if created {
            info!(scenario = %scenario, "Scenario created");
        }
        Ok(created)
    }

    /// Delete every stub and pre-stub of the scenario, then the scenario.
    /// Returns false, without touching storage, if the scenario does not exist.
    pub fn remove_all(&self, scenario: &str) -> Result<bool, StubError> {
        if !self.repo.scenario_exists(scenario)? {
            warn!(
                scenario = %scenario,
                "{}",
                StubError::ScenarioNotFound(scenario.to_string())
            );
            return Ok(false);
        }

        let (stubs_deleted, pre_stubs_deleted) = self.repo.delete_all_for_scenario(scenario)?;
        info!(
            scenario = %scenario,
            stubs_deleted,
            pre_stubs_deleted,
            "Scenario removed"
        );
        Ok(true)
    }

    /// Delete stubs and pre-stubs with `recorded <= cutoff`. The scenario is
    /// removed as well once it has no stubs left.
    pub fn remove_older_than(
        &self,
        scenario: &str,
        cutoff: NaiveDate,
    ) -> Result<RetentionReport, StubError> {
        let stubs_deleted = self.repo.delete_stubs_older_than(scenario, cutoff)?;
        let pre_stubs_deleted = self.repo.delete_pre_stubs_older_than(scenario, cutoff)?;
        debug!(
            scenario = %scenario,
            %cutoff,
            "Scenario Stubs deleted: {}. Pre Scenario Stubs deleted: {}.",
            stubs_deleted,
            pre_stubs_deleted
        );

        let scenario_removed = self.repo.count_stubs(scenario)? == 0
            && self.repo.delete_scenario_if_empty(scenario)?;
        if scenario_removed {
            info!(scenario = %scenario, %cutoff, "Scenario removed by retention");
        }

        Ok(RetentionReport {
            stubs_deleted,
            pre_stubs_deleted,
            scenario_removed,
        })
    }

    /// Run retention over `scenarios`, or when `None` over every name that
    /// owns records, including names whose scenario record is already gone
    /// but which still hold pre-stubs. A failing scenario is logged and
    /// recorded in the report; the sweep carries on with the rest.
    pub fn sweep(
        &self,
        cutoff: NaiveDate,
        scenarios: Option<&[String]>,
    ) -> Result<SweepReport, StubError> {
        let names = match scenarios {
            Some(names) => names.to_vec(),
            None => self.repo.list_record_owners()?,
        };

        let mut report = SweepReport {
            cutoff: Some(cutoff),
            ..Default::default()
        };
        for name in names {
            match self.remove_older_than(&name, cutoff) {
                Ok(result) => report.swept.push((name, result)),
                Err(e) => {
                    error!(scenario = %name, %cutoff, "Retention failed: {}", e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            %cutoff,
            scenarios = report.swept.len(),
            failed = report.failed.len(),
            stubs_deleted = report.stubs_deleted(),
            pre_stubs_deleted = report.pre_stubs_deleted(),
            scenarios_removed = report.scenarios_removed(),
            "Retention sweep finished"
        );
        Ok(report)
    }
}
