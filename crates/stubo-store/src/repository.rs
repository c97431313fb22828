//! Storage boundary for scenarios, stubs and pre-stubs.
//!
//! The trait is synchronous: every method is a single bounded call into the
//! document store, and the engine runs on request-handling worker threads.
//! Nothing is cached between calls; each read reflects current storage state.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use std::sync::Arc;

use crate::stub::{ContentHash, MatcherKey, PreStub, PreStubId, Stub, StubId, StubPayload};

/// Record handed to `insert_stub`
#[derive(Debug, Clone)]
pub struct NewStub {
    pub payload: StubPayload,
    pub matcher: MatcherKey,
    pub content_hash: Option<ContentHash>,
}

/// Outcome of the conditional stub insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(StubId),
    /// Another stub already owns `(scenario, matcher)`
    MatcherTaken,
}

/// Outcome of the compare-and-set payload update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The stored content hash no longer matches the expected one
    Conflict,
    /// The stub was deleted in the meantime
    Missing,
}

/// Backend-agnostic repository over the `scenarios`, `stubs` and `prestubs`
/// collections. Listing methods order records by `recorded` ascending, ties
/// broken by insertion order.
pub trait StubRepository: Send + Sync {
    /// Names of every known scenario, sorted
    fn list_scenarios(&self) -> Result<Vec<String>>;

    /// Registered scenarios plus any name that still owns stubs or pre-stubs
    /// after its scenario record was removed, sorted and deduplicated
    fn list_record_owners(&self) -> Result<Vec<String>>;

    fn scenario_exists(&self, scenario: &str) -> Result<bool>;

    /// Register a scenario; returns false if it already existed
    fn create_scenario(&self, scenario: &str) -> Result<bool>;

    fn list_stubs(&self, scenario: &str) -> Result<Vec<Stub>>;

    fn list_pre_stubs(&self, scenario: &str) -> Result<Vec<PreStub>>;

    fn count_stubs(&self, scenario: &str) -> Result<usize>;

    fn count_pre_stubs(&self, scenario: &str) -> Result<usize>;

    /// Exact lookup on the `(scenario, matcher)` index
    fn find_by_matcher(&self, scenario: &str, matcher: &MatcherKey) -> Result<Option<Stub>>;

    /// Insert a stub unless `(scenario, matcher)` is already taken. Registers
    /// the scenario in the same atomic step.
    fn insert_stub(&self, scenario: &str, stub: NewStub) -> Result<InsertOutcome>;

    /// Replace a stub's payload if its stored content hash still equals
    /// `expected`
    fn update_stub_payload(
        &self,
        id: StubId,
        expected: Option<&ContentHash>,
        payload: StubPayload,
        content_hash: Option<ContentHash>,
    ) -> Result<WriteOutcome>;

    /// Stage a recording. Registers the scenario.
    fn insert_pre_stub(
        &self,
        scenario: &str,
        payload: StubPayload,
        fingerprint: Option<ContentHash>,
    ) -> Result<PreStubId>;

    /// Returns false if the pre-stub did not exist
    fn delete_pre_stub(&self, id: PreStubId) -> Result<bool>;

    /// Delete stubs with `recorded <= cutoff`
    fn delete_stubs_older_than(&self, scenario: &str, cutoff: NaiveDate) -> Result<usize>;

    /// Delete pre-stubs with `recorded <= cutoff`
    fn delete_pre_stubs_older_than(&self, scenario: &str, cutoff: NaiveDate) -> Result<usize>;

    /// Delete every stub and pre-stub of the scenario together with the
    /// scenario record, in one atomic step; returns both record counts
    fn delete_all_for_scenario(&self, scenario: &str) -> Result<(usize, usize)>;

    /// Delete the scenario record only if it owns no stubs, atomically with
    /// respect to concurrent inserts
    fn delete_scenario_if_empty(&self, scenario: &str) -> Result<bool>;
}

/// Order records by `recorded`, then by id (insertion order)
pub(crate) fn sort_stubs(stubs: &mut [Stub]) {
    stubs.sort_by(|a, b| a.recorded().cmp(&b.recorded()).then(a.id.cmp(&b.id)));
}

pub(crate) fn sort_pre_stubs(pre_stubs: &mut [PreStub]) {
    pre_stubs.sort_by(|a, b| a.recorded().cmp(&b.recorded()).then(a.id.cmp(&b.id)));
}

/// Create a repository based on configuration
///
/// # Example
/// ```ignore
/// use stubo_store::config::StoreConfig;
/// use stubo_store::repository::create_stub_repository;
///
/// let config = StoreConfig::default(); // inmemory
/// let repo = create_stub_repository(&config)?;
/// ```
pub fn create_stub_repository(
    config: &crate::config::StoreConfig,
) -> Result<Arc<dyn StubRepository>> {
    match config.backend.as_str() {
        "inmemory" => {
            use crate::backends::InMemoryStubRepository;
            tracing::info!("Using InMemory StubRepository");
            Ok(Arc::new(InMemoryStubRepository::new()))
        }
        "redis" => {
            let redis_config = config
                .redis
                .as_ref()
                .ok_or_else(|| anyhow!("Redis backend selected but no redis config provided"))?;

            #[cfg(feature = "redis-backend")]
            {
                use crate::backends::RedisStubRepository;
                use anyhow::Context;

                let repo = RedisStubRepository::new(
                    &redis_config.url,
                    redis_config.pool_size,
                    redis_config.key_prefix.clone(),
                )
                .context("Failed to create Redis backend")?;

                tracing::info!(
                    "Using redis StubRepository (url={}, prefix={})",
                    redis_config.url,
                    redis_config.key_prefix
                );

                Ok(Arc::new(repo))
            }

            #[cfg(not(feature = "redis-backend"))]
            {
                let _ = redis_config;
                Err(anyhow!(
                    "Redis backend not available. Compile with --features redis-backend"
                ))
            }
        }
        other => Err(anyhow!("Unknown backend type: {other}")),
    }
}
