//! Stub insertion: fingerprint, lookup, then merge or insert.
//!
//! The lookup-then-write sequence is guarded by conditional writes instead of
//! an in-process lock:
//!
//! - a new stub is inserted only if no stub owns `(scenario, matcher)` yet;
//! - a stateful merge is written only if the stub's stored content hash is
//!   still the one the merge was computed from.
//!
//! A lost race re-runs lookup and merge against the latest record, up to
//! `max_attempts` times and within `deadline_ms`. The final state of a key is
//! therefore some serial order of all concurrent insertions.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::fingerprint::{compute_content_hash, compute_matcher};
use super::merge::{merge_stateful, MergeOutcome};
use super::types::{ContentHash, InsertStatus, MatcherKey, PreStubId, StubPayload};
use crate::config::InsertionConfig;
use crate::error::StubError;
use crate::repository::{InsertOutcome, NewStub, StubRepository, WriteOutcome};

/// Result of one lookup-and-write pass
enum Attempt {
    Done(InsertStatus),
    Conflict,
}

pub struct StubInsertionEngine {
    repo: Arc<dyn StubRepository>,
    config: InsertionConfig,
}

impl StubInsertionEngine {
    pub fn new(repo: Arc<dyn StubRepository>, config: InsertionConfig) -> Self {
        Self { repo, config }
    }

    /// Insert a recorded stub, merging it into an existing stub that shares
    /// its matcher.
    pub fn insert_stub(
        &self,
        scenario: &str,
        payload: StubPayload,
        stateful: bool,
    ) -> Result<InsertStatus, StubError> {
        let matcher = compute_matcher(&payload);
        let content_hash = hash_or_log(scenario, &matcher, &payload);
        let deadline = self.config.deadline();
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_insert(scenario, &matcher, &payload, content_hash.as_ref(), stateful)? {
                Attempt::Done(status) => {
                    debug!(
                        scenario = %scenario,
                        matcher = %matcher,
                        attempt,
                        "{}",
                        status.message(scenario)
                    );
                    return Ok(status);
                }
                Attempt::Conflict => {
                    warn!(
                        scenario = %scenario,
                        matcher = %matcher,
                        attempt,
                        "Concurrent write on stub, retrying"
                    );
                    if attempt >= max_attempts {
                        return Err(StubError::ConcurrentUpdateConflict {
                            scenario: scenario.to_string(),
                            matcher: matcher.to_string(),
                            attempts: attempt,
                        });
                    }
                    let elapsed = started.elapsed();
                    if elapsed >= deadline {
                        return Err(StubError::DeadlineExceeded {
                            scenario: scenario.to_string(),
                            matcher: matcher.to_string(),
                            elapsed_ms: elapsed.as_millis() as u64,
                        });
                    }
                    self.backoff(attempt, deadline - elapsed);
                }
            }
        }
    }

    /// Stage a recording as a pre-stub. The content hash doubles as its
    /// fingerprint.
    pub fn insert_pre_stub(
        &self,
        scenario: &str,
        payload: StubPayload,
    ) -> Result<PreStubId, StubError> {
        let fingerprint = match compute_content_hash(&payload) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!(scenario = %scenario, "Pre-stub stored without fingerprint: {}", e);
                None
            }
        };
        let id = self.repo.insert_pre_stub(scenario, payload, fingerprint)?;
        debug!(scenario = %scenario, pre_stub_id = %id, "Stub inserted. Scenario: {}", scenario);
        Ok(id)
    }

    fn try_insert(
        &self,
        scenario: &str,
        matcher: &MatcherKey,
        payload: &StubPayload,
        content_hash: Option<&ContentHash>,
        stateful: bool,
    ) -> Result<Attempt, StubError> {
        let Some(existing) = self.repo.find_by_matcher(scenario, matcher)? else {
            let new_stub = NewStub {
                payload: payload.clone(),
                matcher: matcher.clone(),
                content_hash: content_hash.cloned(),
            };
            return Ok(match self.repo.insert_stub(scenario, new_stub)? {
                InsertOutcome::Inserted(id) => Attempt::Done(InsertStatus::Inserted(id)),
                InsertOutcome::MatcherTaken => Attempt::Conflict,
            });
        };

        match merge_stateful(existing.payload(), payload, stateful) {
            MergeOutcome::Duplicate => Ok(Attempt::Done(InsertStatus::DuplicateNotInserted(
                existing.id,
            ))),
            MergeOutcome::StatefulUpdate(merged) => {
                let merged_hash = hash_or_log(scenario, matcher, &merged);
                let outcome = self.repo.update_stub_payload(
                    existing.id,
                    existing.content_hash(),
                    merged,
                    merged_hash,
                )?;
                Ok(match outcome {
                    WriteOutcome::Applied => {
                        Attempt::Done(InsertStatus::UpdatedStateful(existing.id))
                    }
                    WriteOutcome::Conflict | WriteOutcome::Missing => Attempt::Conflict,
                })
            }
        }
    }

    /// Sleep a jittered, growing interval, never past the remaining budget
    fn backoff(&self, attempt: u32, remaining: Duration) {
        let ceiling = self.config.backoff_ms.saturating_mul(u64::from(attempt));
        if ceiling == 0 {
            return;
        }
        let pause = Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling));
        std::thread::sleep(pause.min(remaining));
    }
}

/// Content hash of `payload`, or `None` (logged) when it cannot be computed.
/// An unhashable stub skips dedup and still goes through the matcher path.
fn hash_or_log(scenario: &str, matcher: &MatcherKey, payload: &StubPayload) -> Option<ContentHash> {
    match compute_content_hash(payload) {
        Ok(hash) => Some(hash),
        Err(e) => {
            warn!(
                scenario = %scenario,
                matcher = %matcher,
                "Stub is unhashable, dedup skipped: {}",
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStubRepository;
    use crate::testing::{payload, FaultyRepository};
    use serde_json::json;

    fn engine_with(repo: Arc<dyn StubRepository>) -> StubInsertionEngine {
        StubInsertionEngine::new(repo, InsertionConfig::default())
    }

    #[test]
    fn test_duplicate_is_not_inserted() {
        let repo = Arc::new(InMemoryStubRepository::new());
        let engine = engine_with(repo.clone());
        let p = payload("get_account", json!("r1"), "2024-01-01");

        let first = engine.insert_stub("s1", p.clone(), false).unwrap();
        let second = engine.insert_stub("s1", p, false).unwrap();

        assert!(matches!(first, InsertStatus::Inserted(_)));
        assert_eq!(second, InsertStatus::DuplicateNotInserted(first.stub_id()));
        assert_eq!(repo.count_stubs("s1").unwrap(), 1);
    }

    #[test]
    fn test_stateful_append_preserves_order() {
        let repo = Arc::new(InMemoryStubRepository::new());
        let engine = engine_with(repo.clone());

        let first = engine
            .insert_stub("s1", payload("q", json!("r1"), "2024-01-01"), true)
            .unwrap();
        let second = engine
            .insert_stub("s1", payload("q", json!("r2"), "2024-01-02"), true)
            .unwrap();

        assert_eq!(second, InsertStatus::UpdatedStateful(first.stub_id()));
        let stubs = repo.list_stubs("s1").unwrap();
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].payload().response.body, vec![json!("r1"), json!("r2")]);
    }

    #[test]
    fn test_different_body_without_stateful_flag_appends() {
        let repo = Arc::new(InMemoryStubRepository::new());
        let engine = engine_with(repo.clone());

        engine
            .insert_stub("s1", payload("q", json!("r1"), "2024-01-01"), false)
            .unwrap();
        let status = engine
            .insert_stub("s1", payload("q", json!("r2"), "2024-01-01"), false)
            .unwrap();

        assert!(matches!(status, InsertStatus::UpdatedStateful(_)));
        let stub = &repo.list_stubs("s1").unwrap()[0];
        assert_eq!(stub.payload().response.body.len(), 2);
    }

    #[test]
    fn test_stored_hash_tracks_merged_payload() {
        let repo = Arc::new(InMemoryStubRepository::new());
        let engine = engine_with(repo.clone());

        engine
            .insert_stub("s1", payload("q", json!("r1"), "2024-01-01"), true)
            .unwrap();
        engine
            .insert_stub("s1", payload("q", json!("r2"), "2024-01-01"), true)
            .unwrap();

        let stub = &repo.list_stubs("s1").unwrap()[0];
        let expected = compute_content_hash(stub.payload()).unwrap();
        assert_eq!(stub.content_hash(), Some(&expected));
    }

    #[test]
    fn test_distinct_matchers_insert_separately() {
        let repo = Arc::new(InMemoryStubRepository::new());
        let engine = engine_with(repo.clone());

        engine
            .insert_stub("s1", payload("a", json!("r"), "2024-01-01"), false)
            .unwrap();
        engine
            .insert_stub("s1", payload("b", json!("r"), "2024-01-01"), false)
            .unwrap();
        engine
            .insert_stub("s2", payload("a", json!("r"), "2024-01-01"), false)
            .unwrap();

        assert_eq!(repo.count_stubs("s1").unwrap(), 2);
        assert_eq!(repo.count_stubs("s2").unwrap(), 1);
        assert!(repo.scenario_exists("s2").unwrap());
    }

    #[test]
    fn test_storage_failure_propagates() {
        let repo = Arc::new(FaultyRepository {
            fail_writes: true,
            ..Default::default()
        });
        let engine = engine_with(repo.clone());

        let err = engine
            .insert_stub("s1", payload("q", json!("r1"), "2024-01-01"), false)
            .unwrap_err();
        assert!(matches!(err, StubError::Storage(_)));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("connection reset by peer"));
        assert_eq!(repo.count_stubs("s1").unwrap(), 0);
    }

    #[test]
    fn test_conflict_exhausts_attempts() {
        let repo = Arc::new(FaultyRepository {
            always_conflict: true,
            ..Default::default()
        });
        let engine = StubInsertionEngine::new(
            repo.clone(),
            InsertionConfig {
                max_attempts: 3,
                deadline_ms: 10_000,
                backoff_ms: 0,
            },
        );

        let err = engine
            .insert_stub("s1", payload("q", json!("r1"), "2024-01-01"), false)
            .unwrap_err();
        match err {
            StubError::ConcurrentUpdateConflict {
                scenario, attempts, ..
            } => {
                assert_eq!(scenario, "s1");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(repo.write_count(), 3);
    }

    #[test]
    fn test_deadline_stops_retries() {
        let repo = Arc::new(FaultyRepository {
            always_conflict: true,
            ..Default::default()
        });
        let engine = StubInsertionEngine::new(
            repo.clone(),
            InsertionConfig {
                max_attempts: 10,
                deadline_ms: 0,
                backoff_ms: 0,
            },
        );

        let err = engine
            .insert_stub("s1", payload("q", json!("r1"), "2024-01-01"), false)
            .unwrap_err();
        assert!(matches!(err, StubError::DeadlineExceeded { .. }));
        assert!(err.is_retryable());
        assert_eq!(repo.write_count(), 1);
    }

    #[test]
    fn test_insert_pre_stub_fingerprints() {
        let repo = Arc::new(InMemoryStubRepository::new());
        let engine = engine_with(repo.clone());
        let p = payload("q", json!("r1"), "2024-01-01");

        let id = engine.insert_pre_stub("s1", p.clone()).unwrap();
        let pre_stubs = repo.list_pre_stubs("s1").unwrap();
        assert_eq!(pre_stubs.len(), 1);
        assert_eq!(pre_stubs[0].id, id);
        assert_eq!(
            pre_stubs[0].fingerprint,
            Some(compute_content_hash(&p).unwrap())
        );
        // Pre-stubs never enter the matcher index
        assert_eq!(repo.count_stubs("s1").unwrap(), 0);
    }

    #[test]
    fn test_concurrent_stateful_inserts_lose_nothing() {
        use std::thread;

        let repo = Arc::new(InMemoryStubRepository::new());
        let engine = Arc::new(StubInsertionEngine::new(
            repo.clone(),
            InsertionConfig {
                max_attempts: 50,
                deadline_ms: 30_000,
                backoff_ms: 1,
            },
        ));
        let num_threads = 8;

        let handles: Vec<_> = (0..num_threads)
            .map(|i| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    engine
                        .insert_stub("shared", payload("q", json!(format!("r{i}")), "2024-01-01"), true)
                        .unwrap()
                })
            })
            .collect();
        let statuses: Vec<InsertStatus> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let inserted = statuses
            .iter()
            .filter(|s| matches!(s, InsertStatus::Inserted(_)))
            .count();
        assert_eq!(inserted, 1);

        let stubs = repo.list_stubs("shared").unwrap();
        assert_eq!(stubs.len(), 1);
        let mut body: Vec<String> = stubs[0]
            .payload()
            .response
            .body
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        body.sort();
        let mut expected: Vec<String> = (0..num_threads).map(|i| format!("r{i}")).collect();
        expected.sort();
        assert_eq!(body, expected);
    }
}
