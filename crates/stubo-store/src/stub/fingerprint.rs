//! Stub fingerprinting: matcher keys and content hashes.
//!
//! - The matcher key identifies a stub's request-matching rules: method, path,
//!   query parameters, then the `contains` rules. It is order-sensitive in the
//!   `contains` rules, since the replay-time evaluator checks them in sequence.
//! - The content hash covers the whole payload. The payload is converted to a
//!   canonical JSON form (object keys sorted at every depth) before hashing,
//!   so it is byte-stable across runs, processes and source key order.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::types::{ContentHash, MatcherKey, StubPayload};
use crate::error::StubError;

/// Derive the matcher key from the payload's request-matching rules.
///
/// The rule sequence is `method:<METHOD>`, `path:<path>` (when set), one
/// `query:<name>=<value>` per parameter in name order, then one
/// `contains:<rule>` per body rule in declaration order. Each rule is
/// length-prefixed before hashing so that rule boundaries are unambiguous
/// (`["ab", "c"]` and `["a", "bc"]` produce different keys).
pub fn compute_matcher(payload: &StubPayload) -> MatcherKey {
    let request = &payload.request;
    let mut rules = Vec::with_capacity(2 + request.query.len());
    rules.push(format!("method:{}", request.method.to_ascii_uppercase()));
    if let Some(path) = &request.path {
        rules.push(format!("path:{path}"));
    }
    // BTreeMap iterates in name order
    for (name, value) in &request.query {
        rules.push(format!("query:{name}={value}"));
    }
    rules.extend(payload.contains_rules().map(|rule| format!("contains:{rule}")));
    matcher_from_rules(rules.iter().map(String::as_str))
}

fn matcher_from_rules<'a>(rules: impl Iterator<Item = &'a str>) -> MatcherKey {
    let mut hasher = Sha256::new();
    for rule in rules {
        hasher.update((rule.len() as u64).to_be_bytes());
        hasher.update(rule.as_bytes());
    }
    MatcherKey::new(format!("{:x}", hasher.finalize()))
}

/// Hash the canonical encoding of the full payload
pub fn compute_content_hash(payload: &StubPayload) -> Result<ContentHash, StubError> {
    let bytes = canonical_bytes(payload)?;
    let digest = Sha256::digest(&bytes);
    Ok(ContentHash::new(format!("{digest:x}")))
}

/// Serialize any value into canonical JSON bytes
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, StubError> {
    let value =
        serde_json::to_value(value).map_err(|e| StubError::HashComputation(e.to_string()))?;
    serde_json::to_vec(&canonicalize(value)).map_err(|e| StubError::HashComputation(e.to_string()))
}

/// Rebuild every object with keys in sorted order. `serde_json::Map` only
/// sorts when `preserve_order` is off, and that feature is unified across the
/// dependency graph.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
