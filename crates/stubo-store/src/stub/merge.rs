//! Stateful merge of a recording into an existing stub with the same matcher.
//!
//! Only the response body drives stateful progression: headers, status and
//! every other field of the existing stub are kept as they are.

use super::types::StubPayload;

/// Decision for an incoming recording that shares a matcher with a stub
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Same response body and not stateful; nothing to write
    Duplicate,
    /// Existing payload with the incoming body steps appended
    StatefulUpdate(StubPayload),
}

/// Resolve `incoming` against `existing`.
///
/// The merged body keeps every existing step and appends the incoming steps
/// in their original order.
pub fn merge_stateful(existing: &StubPayload, incoming: &StubPayload, stateful: bool) -> MergeOutcome {
    if !stateful && existing.response_body() == incoming.response_body() {
        return MergeOutcome::Duplicate;
    }

    let mut merged = existing.clone();
    merged
        .response
        .body
        .extend(incoming.response_body().iter().cloned());
    MergeOutcome::StatefulUpdate(merged)
}
