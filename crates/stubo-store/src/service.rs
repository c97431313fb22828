//! StubService - the operation surface of the stub store.
//!
//! One entry point per externally visible operation. Recording, listing and
//! counting go through the insertion engine and the repository; removal and
//! retention go through the scenario lifecycle manager. All of them share a
//! single repository handle.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, InsertionConfig};
use crate::error::StubError;
use crate::repository::{create_stub_repository, StubRepository};
use crate::scenario::{RetentionReport, ScenarioLifecycleManager, SweepReport};
use crate::stub::{InsertStatus, PreStub, PreStubId, Stub, StubInsertionEngine, StubPayload};

/// Per-status counts from promoting a scenario's pre-stubs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionReport {
    pub inserted: usize,
    pub updated: usize,
    pub duplicates: usize,
    /// Pre-stubs left in place after losing every retry to concurrent writers
    pub deferred: usize,
}

impl PromotionReport {
    fn record(&mut self, status: &InsertStatus) {
        match status {
            InsertStatus::Inserted(_) => self.inserted += 1,
            InsertStatus::UpdatedStateful(_) => self.updated += 1,
            InsertStatus::DuplicateNotInserted(_) => self.duplicates += 1,
        }
    }
}

pub struct StubService {
    repo: Arc<dyn StubRepository>,
    engine: StubInsertionEngine,
    lifecycle: ScenarioLifecycleManager,
}

impl StubService {
    pub fn new(repo: Arc<dyn StubRepository>, insertion: InsertionConfig) -> Self {
        Self {
            engine: StubInsertionEngine::new(repo.clone(), insertion),
            lifecycle: ScenarioLifecycleManager::new(repo.clone()),
            repo,
        }
    }

    /// Build the service over the backend selected in `config`
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let repo = create_stub_repository(&config.store)?;
        Ok(Self::new(repo, config.insertion.clone()))
    }

    pub fn repository(&self) -> &Arc<dyn StubRepository> {
        &self.repo
    }

    pub fn create_scenario(&self, scenario: &str) -> Result<bool, StubError> {
        self.lifecycle.create(scenario)
    }

    pub fn insert_stub(
        &self,
        scenario: &str,
        payload: StubPayload,
        stateful: bool,
    ) -> Result<InsertStatus, StubError> {
        self.engine.insert_stub(scenario, payload, stateful)
    }

    pub fn insert_pre_stub(
        &self,
        scenario: &str,
        payload: StubPayload,
    ) -> Result<PreStubId, StubError> {
        self.engine.insert_pre_stub(scenario, payload)
    }

    /// Stubs ordered by `recorded`, ties by insertion order
    pub fn list_stubs(&self, scenario: &str) -> Result<Vec<Stub>, StubError> {
        Ok(self.repo.list_stubs(scenario)?)
    }

    pub fn list_pre_stubs(&self, scenario: &str) -> Result<Vec<PreStub>, StubError> {
        Ok(self.repo.list_pre_stubs(scenario)?)
    }

    pub fn stub_count(&self, scenario: &str) -> Result<usize, StubError> {
        Ok(self.repo.count_stubs(scenario)?)
    }

    /// Delete the scenario with all of its stubs and pre-stubs. Returns false
    /// for an unknown scenario.
    pub fn remove_scenario(&self, scenario: &str) -> Result<bool, StubError> {
        self.lifecycle.remove_all(scenario)
    }

    pub fn remove_older_than(
        &self,
        scenario: &str,
        cutoff: NaiveDate,
    ) -> Result<RetentionReport, StubError> {
        self.lifecycle.remove_older_than(scenario, cutoff)
    }

    /// Stubs in match-evaluation order: ascending `priority` with unprioritized
    /// stubs last, then the regular listing order.
    pub fn list_stubs_by_priority(&self, scenario: &str) -> Result<Vec<Stub>, StubError> {
        let mut stubs = self.list_stubs(scenario)?;
        // sort_by_key is stable, so the recorded/insertion order survives ties
        stubs.sort_by_key(|stub| match stub.priority() {
            Some(p) => (0, p),
            None => (1, 0),
        });
        Ok(stubs)
    }

    /// Stubs with content duplicates of an earlier stub removed.
    /// Stubs without a content hash are always kept.
    pub fn list_unique_stubs(&self, scenario: &str) -> Result<Vec<Stub>, StubError> {
        let stubs = self.list_stubs(scenario)?;
        let total = stubs.len();
        let mut seen = HashSet::new();
        let unique: Vec<Stub> = stubs
            .into_iter()
            .filter(|stub| match stub.content_hash() {
                Some(hash) => seen.insert(hash.clone()),
                None => true,
            })
            .collect();
        if unique.len() < total {
            debug!(
                scenario = %scenario,
                dropped = total - unique.len(),
                "Duplicate stubs filtered from listing"
            );
        }
        Ok(unique)
    }

    /// Replay every pre-stub of the scenario, oldest first, through the
    /// insertion engine and delete it once inserted. Storage failures abort
    /// the run; pre-stubs that lose all retries stay staged for the next run.
    pub fn promote_pre_stubs(
        &self,
        scenario: &str,
        stateful: bool,
    ) -> Result<PromotionReport, StubError> {
        let mut report = PromotionReport::default();
        for pre_stub in self.repo.list_pre_stubs(scenario)? {
            let id = pre_stub.id;
            match self.engine.insert_stub(scenario, pre_stub.payload, stateful) {
                Ok(status) => {
                    report.record(&status);
                    self.repo.delete_pre_stub(id)?;
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        scenario = %scenario,
                        pre_stub_id = %id,
                        "Pre-stub not promoted, left staged: {}",
                        e
                    );
                    report.deferred += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            scenario = %scenario,
            inserted = report.inserted,
            updated = report.updated,
            duplicates = report.duplicates,
            deferred = report.deferred,
            "Pre-stubs promoted"
        );
        Ok(report)
    }

    /// Retention over every scenario, each isolated from the others' failures
    pub fn sweep(&self, cutoff: NaiveDate) -> Result<SweepReport, StubError> {
        self.lifecycle.sweep(cutoff, None)
    }

    /// Retention over the named scenarios only
    pub fn sweep_scenarios(
        &self,
        cutoff: NaiveDate,
        scenarios: &[String],
    ) -> Result<SweepReport, StubError> {
        self.lifecycle.sweep(cutoff, Some(scenarios))
    }
}
