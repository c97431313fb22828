//! Error type shared by the insertion engine and the scenario lifecycle.

/// Errors surfaced by stub operations
#[derive(Debug, thiserror::Error)]
pub enum StubError {
    #[error("Scenario not found: {0}")]
    ScenarioNotFound(String),
    #[error("Failed to compute content hash: {0}")]
    HashComputation(String),
    #[error(
        "Concurrent update conflict on scenario '{scenario}' (matcher {matcher}) after {attempts} attempts"
    )]
    ConcurrentUpdateConflict {
        scenario: String,
        matcher: String,
        attempts: u32,
    },
    #[error("Insertion deadline exceeded on scenario '{scenario}' (matcher {matcher}) after {elapsed_ms}ms")]
    DeadlineExceeded {
        scenario: String,
        matcher: String,
        elapsed_ms: u64,
    },
    #[error("Storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl StubError {
    /// Whether the caller may resubmit the whole recorded interaction
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StubError::ConcurrentUpdateConflict { .. } | StubError::DeadlineExceeded { .. }
        )
    }
}

impl From<anyhow::Error> for StubError {
    fn from(err: anyhow::Error) -> Self {
        StubError::Storage(err)
    }
}
