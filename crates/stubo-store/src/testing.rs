//! Test doubles shared by unit tests.

use crate::backends::InMemoryStubRepository;
use crate::repository::{InsertOutcome, NewStub, StubRepository, WriteOutcome};
use crate::stub::{ContentHash, MatcherKey, PreStub, PreStubId, Stub, StubId, StubPayload};
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Build a payload with one `contains` rule
pub(crate) fn payload(rule: &str, body: serde_json::Value, recorded: &str) -> StubPayload {
    serde_json::from_value(json!({
        "request": {"method": "POST", "bodyPatterns": [{"contains": [rule]}]},
        "response": {"status": 200, "body": body},
        "recorded": recorded
    }))
    .unwrap()
}

pub(crate) fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

/// In-memory repository with switchable failures
#[derive(Default)]
pub(crate) struct FaultyRepository {
    pub inner: InMemoryStubRepository,
    /// Fail every write
    pub fail_writes: bool,
    /// Report every conditional write as lost to a concurrent writer
    pub always_conflict: bool,
    /// Scenarios whose deletes fail
    pub fail_scenarios: HashSet<String>,
    pub writes: AtomicUsize,
}

impl FaultyRepository {
    fn write_guard(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            return Err(anyhow!("connection reset by peer"));
        }
        Ok(())
    }

    fn scenario_guard(&self, scenario: &str) -> Result<()> {
        if self.fail_scenarios.contains(scenario) {
            return Err(anyhow!("timed out deleting scenario {scenario}"));
        }
        Ok(())
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl StubRepository for FaultyRepository {
    fn list_scenarios(&self) -> Result<Vec<String>> {
        self.inner.list_scenarios()
    }

    fn list_record_owners(&self) -> Result<Vec<String>> {
        self.inner.list_record_owners()
    }

    fn scenario_exists(&self, scenario: &str) -> Result<bool> {
        self.inner.scenario_exists(scenario)
    }

    fn create_scenario(&self, scenario: &str) -> Result<bool> {
        self.write_guard()?;
        self.inner.create_scenario(scenario)
    }

    fn list_stubs(&self, scenario: &str) -> Result<Vec<Stub>> {
        self.inner.list_stubs(scenario)
    }

    fn list_pre_stubs(&self, scenario: &str) -> Result<Vec<PreStub>> {
        self.inner.list_pre_stubs(scenario)
    }

    fn count_stubs(&self, scenario: &str) -> Result<usize> {
        self.inner.count_stubs(scenario)
    }

    fn count_pre_stubs(&self, scenario: &str) -> Result<usize> {
        self.inner.count_pre_stubs(scenario)
    }

    fn find_by_matcher(&self, scenario: &str, matcher: &MatcherKey) -> Result<Option<Stub>> {
        if self.always_conflict {
            return Ok(None);
        }
        self.inner.find_by_matcher(scenario, matcher)
    }

    fn insert_stub(&self, scenario: &str, stub: NewStub) -> Result<InsertOutcome> {
        self.write_guard()?;
        if self.always_conflict {
            return Ok(InsertOutcome::MatcherTaken);
        }
        self.inner.insert_stub(scenario, stub)
    }

    fn update_stub_payload(
        &self,
        id: StubId,
        expected: Option<&ContentHash>,
        payload: StubPayload,
        content_hash: Option<ContentHash>,
    ) -> Result<WriteOutcome> {
        self.write_guard()?;
        if self.always_conflict {
            return Ok(WriteOutcome::Conflict);
        }
        self.inner
            .update_stub_payload(id, expected, payload, content_hash)
    }

    fn insert_pre_stub(
        &self,
        scenario: &str,
        payload: StubPayload,
        fingerprint: Option<ContentHash>,
    ) -> Result<PreStubId> {
        self.write_guard()?;
        self.inner.insert_pre_stub(scenario, payload, fingerprint)
    }

    fn delete_pre_stub(&self, id: PreStubId) -> Result<bool> {
        self.write_guard()?;
        self.inner.delete_pre_stub(id)
    }

    fn delete_stubs_older_than(&self, scenario: &str, cutoff: NaiveDate) -> Result<usize> {
        self.scenario_guard(scenario)?;
        self.write_guard()?;
        self.inner.delete_stubs_older_than(scenario, cutoff)
    }

    fn delete_pre_stubs_older_than(&self, scenario: &str, cutoff: NaiveDate) -> Result<usize> {
        self.scenario_guard(scenario)?;
        self.write_guard()?;
        self.inner.delete_pre_stubs_older_than(scenario, cutoff)
    }

    fn delete_all_for_scenario(&self, scenario: &str) -> Result<(usize, usize)> {
        self.scenario_guard(scenario)?;
        self.write_guard()?;
        self.inner.delete_all_for_scenario(scenario)
    }

    fn delete_scenario_if_empty(&self, scenario: &str) -> Result<bool> {
        self.scenario_guard(scenario)?;
        self.write_guard()?;
        self.inner.delete_scenario_if_empty(scenario)
    }
}
