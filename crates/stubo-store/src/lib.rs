// Library exports for the retention binary, benchmarks and integration tests

// ===== Core record/replay store =====
pub mod config;
pub mod error;
pub mod logging;
pub mod repository;
pub mod scenario;
pub mod service;
pub mod stub;

// Storage backends are reached through `repository::create_stub_repository`
pub mod backends;

pub use error::StubError;
pub use repository::{create_stub_repository, StubRepository};
pub use scenario::{RetentionReport, ScenarioLifecycleManager, SweepReport};
pub use service::{PromotionReport, StubService};
pub use stub::{InsertStatus, PreStub, PreStubId, Stub, StubId, StubInsertionEngine, StubPayload};

#[cfg(test)]
mod testing;
