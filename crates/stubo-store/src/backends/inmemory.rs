use crate::repository::{
    sort_pre_stubs, sort_stubs, InsertOutcome, NewStub, StubRepository, WriteOutcome,
};
use crate::stub::{ContentHash, MatcherKey, PreStub, PreStubId, Stub, StubId, StubPayload};
use anyhow::Result;
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// In-memory implementation of StubRepository
///
/// All collections live behind a single lock, so every trait method is
/// atomic. Useful for testing, development, and single-instance deployments.
pub struct InMemoryStubRepository {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    scenarios: BTreeSet<String>,
    /// Records by owning scenario name. Buckets outlive a deleted scenario
    /// record until their contents are removed.
    buckets: HashMap<String, Bucket>,
    stub_owner: HashMap<StubId, String>,
    pre_stub_owner: HashMap<PreStubId, String>,
    next_id: u64,
}

#[derive(Default)]
struct Bucket {
    stubs: BTreeMap<StubId, StoredStub>,
    pre_stubs: BTreeMap<PreStubId, StoredPreStub>,
    matchers: HashMap<MatcherKey, StubId>,
}

struct StoredStub {
    matcher: MatcherKey,
    payload: StubPayload,
    content_hash: Option<ContentHash>,
}

struct StoredPreStub {
    fingerprint: Option<ContentHash>,
    payload: StubPayload,
}

impl State {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn bucket(&self, scenario: &str) -> Option<&Bucket> {
        self.buckets.get(scenario)
    }

    fn bucket_mut(&mut self, scenario: &str) -> &mut Bucket {
        self.buckets.entry(scenario.to_string()).or_default()
    }

    /// Drop the bucket once nothing references it
    fn prune(&mut self, scenario: &str) {
        if self
            .buckets
            .get(scenario)
            .is_some_and(|b| b.stubs.is_empty() && b.pre_stubs.is_empty())
        {
            self.buckets.remove(scenario);
        }
    }
}

impl InMemoryStubRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }
}

impl Default for InMemoryStubRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn to_stub(scenario: &str, id: StubId, stored: &StoredStub) -> Stub {
    Stub::with_stored_hash(
        id,
        scenario,
        stored.matcher.clone(),
        stored.payload.clone(),
        stored.content_hash.clone(),
    )
}

impl StubRepository for InMemoryStubRepository {
    fn list_scenarios(&self) -> Result<Vec<String>> {
        Ok(self.state.read().scenarios.iter().cloned().collect())
    }

    fn list_record_owners(&self) -> Result<Vec<String>> {
        let state = self.state.read();
        // Empty buckets are pruned, so every bucket key owns records
        let owners: BTreeSet<&String> = state
            .scenarios
            .iter()
            .chain(state.buckets.keys())
            .collect();
        Ok(owners.into_iter().cloned().collect())
    }

    fn scenario_exists(&self, scenario: &str) -> Result<bool> {
        Ok(self.state.read().scenarios.contains(scenario))
    }

    fn create_scenario(&self, scenario: &str) -> Result<bool> {
        Ok(self.state.write().scenarios.insert(scenario.to_string()))
    }

    fn list_stubs(&self, scenario: &str) -> Result<Vec<Stub>> {
        let state = self.state.read();
        let mut stubs: Vec<Stub> = state
            .bucket(scenario)
            .map(|bucket| {
                bucket
                    .stubs
                    .iter()
                    .map(|(id, stored)| to_stub(scenario, *id, stored))
                    .collect()
            })
            .unwrap_or_default();
        sort_stubs(&mut stubs);
        Ok(stubs)
    }

    fn list_pre_stubs(&self, scenario: &str) -> Result<Vec<PreStub>> {
        let state = self.state.read();
        let mut pre_stubs: Vec<PreStub> = state
            .bucket(scenario)
            .map(|bucket| {
                bucket
                    .pre_stubs
                    .iter()
                    .map(|(id, stored)| PreStub {
                        id: *id,
                        scenario: scenario.to_string(),
                        fingerprint: stored.fingerprint.clone(),
                        payload: stored.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        sort_pre_stubs(&mut pre_stubs);
        Ok(pre_stubs)
    }

    fn count_stubs(&self, scenario: &str) -> Result<usize> {
        Ok(self
            .state
            .read()
            .bucket(scenario)
            .map_or(0, |b| b.stubs.len()))
    }

    fn count_pre_stubs(&self, scenario: &str) -> Result<usize> {
        Ok(self
            .state
            .read()
            .bucket(scenario)
            .map_or(0, |b| b.pre_stubs.len()))
    }

    fn find_by_matcher(&self, scenario: &str, matcher: &MatcherKey) -> Result<Option<Stub>> {
        let state = self.state.read();
        let found = state.bucket(scenario).and_then(|bucket| {
            let id = bucket.matchers.get(matcher)?;
            bucket.stubs.get(id).map(|stored| to_stub(scenario, *id, stored))
        });
        Ok(found)
    }

    fn insert_stub(&self, scenario: &str, stub: NewStub) -> Result<InsertOutcome> {
        let mut state = self.state.write();
        if state
            .bucket(scenario)
            .is_some_and(|b| b.matchers.contains_key(&stub.matcher))
        {
            return Ok(InsertOutcome::MatcherTaken);
        }

        let id = StubId(state.allocate_id());
        state.scenarios.insert(scenario.to_string());
        state.stub_owner.insert(id, scenario.to_string());
        let bucket = state.bucket_mut(scenario);
        bucket.matchers.insert(stub.matcher.clone(), id);
        bucket.stubs.insert(
            id,
            StoredStub {
                matcher: stub.matcher,
                payload: stub.payload,
                content_hash: stub.content_hash,
            },
        );
        Ok(InsertOutcome::Inserted(id))
    }

    fn update_stub_payload(
        &self,
        id: StubId,
        expected: Option<&ContentHash>,
        payload: StubPayload,
        content_hash: Option<ContentHash>,
    ) -> Result<WriteOutcome> {
        let mut state = self.state.write();
        let Some(scenario) = state.stub_owner.get(&id).cloned() else {
            return Ok(WriteOutcome::Missing);
        };
        let Some(stored) = state
            .buckets
            .get_mut(&scenario)
            .and_then(|b| b.stubs.get_mut(&id))
        else {
            return Ok(WriteOutcome::Missing);
        };

        if stored.content_hash.as_ref() != expected {
            return Ok(WriteOutcome::Conflict);
        }
        stored.payload = payload;
        stored.content_hash = content_hash;
        Ok(WriteOutcome::Applied)
    }

    fn insert_pre_stub(
        &self,
        scenario: &str,
        payload: StubPayload,
        fingerprint: Option<ContentHash>,
    ) -> Result<PreStubId> {
        let mut state = self.state.write();
        let id = PreStubId(state.allocate_id());
        state.scenarios.insert(scenario.to_string());
        state.pre_stub_owner.insert(id, scenario.to_string());
        state.bucket_mut(scenario).pre_stubs.insert(
            id,
            StoredPreStub {
                fingerprint,
                payload,
            },
        );
        Ok(id)
    }

    fn delete_pre_stub(&self, id: PreStubId) -> Result<bool> {
        let mut state = self.state.write();
        let Some(scenario) = state.pre_stub_owner.remove(&id) else {
            return Ok(false);
        };
        let removed = state
            .buckets
            .get_mut(&scenario)
            .is_some_and(|b| b.pre_stubs.remove(&id).is_some());
        state.prune(&scenario);
        Ok(removed)
    }

    fn delete_stubs_older_than(&self, scenario: &str, cutoff: NaiveDate) -> Result<usize> {
        let mut state = self.state.write();
        let Some(bucket) = state.buckets.get_mut(scenario) else {
            return Ok(0);
        };

        let expired: Vec<StubId> = bucket
            .stubs
            .iter()
            .filter(|(_, stored)| stored.payload.recorded <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(stored) = bucket.stubs.remove(id) {
                if bucket.matchers.get(&stored.matcher) == Some(id) {
                    bucket.matchers.remove(&stored.matcher);
                }
            }
        }
        for id in &expired {
            state.stub_owner.remove(id);
        }
        state.prune(scenario);
        Ok(expired.len())
    }

    fn delete_pre_stubs_older_than(&self, scenario: &str, cutoff: NaiveDate) -> Result<usize> {
        let mut state = self.state.write();
        let Some(bucket) = state.buckets.get_mut(scenario) else {
            return Ok(0);
        };

        let expired: Vec<PreStubId> = bucket
            .pre_stubs
            .iter()
            .filter(|(_, stored)| stored.payload.recorded <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            bucket.pre_stubs.remove(id);
        }
        for id in &expired {
            state.pre_stub_owner.remove(id);
        }
        state.prune(scenario);
        Ok(expired.len())
    }

    fn delete_all_for_scenario(&self, scenario: &str) -> Result<(usize, usize)> {
        let mut state = self.state.write();
        state.scenarios.remove(scenario);
        let Some(bucket) = state.buckets.remove(scenario) else {
            return Ok((0, 0));
        };
        for id in bucket.stubs.keys() {
            state.stub_owner.remove(id);
        }
        for id in bucket.pre_stubs.keys() {
            state.pre_stub_owner.remove(id);
        }
        Ok((bucket.stubs.len(), bucket.pre_stubs.len()))
    }

    fn delete_scenario_if_empty(&self, scenario: &str) -> Result<bool> {
        let mut state = self.state.write();
        if state.bucket(scenario).is_some_and(|b| !b.stubs.is_empty()) {
            return Ok(false);
        }
        Ok(state.scenarios.remove(scenario))
    }
}
