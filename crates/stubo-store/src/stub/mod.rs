//! Stub fingerprinting, stateful merging and insertion.
//!
//! # Module Structure
//!
//! - `types` - Payload, record and identifier types
//! - `fingerprint` - Matcher keys and content hashes
//! - `merge` - Duplicate vs. stateful-append decision
//! - `engine` - Insertion engine with conditional-write retries

mod engine;
mod fingerprint;
mod merge;
mod types;

pub use engine::StubInsertionEngine;
pub use fingerprint::{canonical_bytes, compute_content_hash, compute_matcher};
pub use merge::{merge_stateful, MergeOutcome};
pub use types::{
    BodyPattern, ContentHash, InsertStatus, MatcherKey, PreStub, PreStubId, RequestSection,
    ResponseSection, Stub, StubId, StubPayload,
};
