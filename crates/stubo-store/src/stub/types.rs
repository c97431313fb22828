//! Type definitions for recorded stubs and pre-stubs.
//!
//! The payload is schema-flexible: the engine only interprets the request
//! matching rules, the response body sequence and the `recorded` date. Any
//! other field is kept verbatim in the flattened `extra` maps.

use chrono::NaiveDate;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use super::fingerprint::compute_content_hash;
use crate::error::StubError;

// ============================================================================
// Identifiers and fingerprints
// ============================================================================

/// Store-allocated stub identifier. Ids grow monotonically, so they also
/// encode insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StubId(pub u64);

/// Store-allocated pre-stub identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PreStubId(pub u64);

impl fmt::Display for StubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PreStubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity key derived from a stub's request-matching rules
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatcherKey(String);

impl MatcherKey {
    pub(crate) fn new(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatcherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of the full canonicalized payload
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub(crate) fn new(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Recorded request/response pair as submitted by the recording front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubPayload {
    pub request: RequestSection,
    pub response: ResponseSection,
    /// Day the interaction was recorded (`yyyy-mm-dd`)
    pub recorded: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSection {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body_patterns: Vec<BodyPattern>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One body-match rule group
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BodyPattern {
    #[serde(default)]
    pub contains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSection {
    #[serde(default = "default_status", deserialize_with = "deserialize_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Response steps; a stateful stub serves them one per replay call
    #[serde(default, deserialize_with = "deserialize_body_steps")]
    pub body: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_policy: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_status() -> u16 {
    200
}

/// Accept the status code as either a number or a string
fn deserialize_status<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| D::Error::custom(format!("invalid status code: {n}"))),
        Value::String(s) => s
            .trim()
            .parse::<u16>()
            .map_err(|_| D::Error::custom(format!("invalid status code: {s}"))),
        other => Err(D::Error::custom(format!(
            "status must be a number or string, got {other}"
        ))),
    }
}

/// A single body is a one-step response; an array lists every step.
fn deserialize_body_steps<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Array(steps) => Ok(steps),
        Value::Null => Ok(Vec::new()),
        single => Ok(vec![single]),
    }
}

impl StubPayload {
    /// Every `contains` rule of the request, in declaration order
    pub fn contains_rules(&self) -> impl Iterator<Item = &str> {
        self.request
            .body_patterns
            .iter()
            .flat_map(|pattern| pattern.contains.iter().map(String::as_str))
    }

    pub fn response_body(&self) -> &[Value] {
        &self.response.body
    }
}

// ============================================================================
// Stored records
// ============================================================================

/// Committed stub as read back from the repository
#[derive(Debug, Clone)]
pub struct Stub {
    pub id: StubId,
    pub scenario: String,
    pub matcher: MatcherKey,
    payload: StubPayload,
    content_hash: OnceCell<Option<ContentHash>>,
}

impl Stub {
    pub fn new(
        id: StubId,
        scenario: impl Into<String>,
        matcher: MatcherKey,
        payload: StubPayload,
    ) -> Self {
        Self {
            id,
            scenario: scenario.into(),
            matcher,
            payload,
            content_hash: OnceCell::new(),
        }
    }

    /// Build a stub whose content hash was persisted alongside it. The stored
    /// value is what compare-and-set writes are checked against.
    pub fn with_stored_hash(
        id: StubId,
        scenario: impl Into<String>,
        matcher: MatcherKey,
        payload: StubPayload,
        content_hash: Option<ContentHash>,
    ) -> Self {
        let stub = Self::new(id, scenario, matcher, payload);
        // `None` means the payload was unhashable when written
        let _ = stub.content_hash.set(content_hash);
        stub
    }

    pub fn payload(&self) -> &StubPayload {
        &self.payload
    }

    pub fn into_payload(self) -> StubPayload {
        self.payload
    }

    /// Replace the payload and drop the cached content hash
    pub fn set_payload(&mut self, payload: StubPayload) {
        self.payload = payload;
        self.content_hash = OnceCell::new();
    }

    pub fn priority(&self) -> Option<i64> {
        self.payload.priority
    }

    pub fn recorded(&self) -> NaiveDate {
        self.payload.recorded
    }

    /// Content hash, computed on first use. `None` when the payload cannot
    /// be hashed; such stubs are never deduplicated.
    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash
            .get_or_init(|| match compute_content_hash(&self.payload) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    tracing::warn!(
                        scenario = %self.scenario,
                        matcher = %self.matcher,
                        stub_id = %self.id,
                        "Content hash unavailable: {}",
                        e
                    );
                    None
                }
            })
            .as_ref()
    }

    /// Like `content_hash` but surfaces the hashing error
    pub fn try_content_hash(&self) -> Result<ContentHash, StubError> {
        match self.content_hash.get() {
            Some(Some(hash)) => Ok(hash.clone()),
            _ => compute_content_hash(&self.payload),
        }
    }
}

impl PartialEq for Stub {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.scenario == other.scenario
            && self.matcher == other.matcher
            && self.payload == other.payload
    }
}

/// Staged recording, not yet promoted into the matched stub set
#[derive(Debug, Clone, PartialEq)]
pub struct PreStub {
    pub id: PreStubId,
    pub scenario: String,
    pub fingerprint: Option<ContentHash>,
    pub payload: StubPayload,
}

impl PreStub {
    pub fn recorded(&self) -> NaiveDate {
        self.payload.recorded
    }
}

/// Result of a successful stub insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "stubId", rename_all = "camelCase")]
pub enum InsertStatus {
    /// No stub shared the matcher; a new record was written
    Inserted(StubId),
    /// The response body was appended to an existing stub
    UpdatedStateful(StubId),
    /// Identical non-stateful recording; nothing was written
    DuplicateNotInserted(StubId),
}

impl InsertStatus {
    pub fn stub_id(&self) -> StubId {
        match self {
            InsertStatus::Inserted(id)
            | InsertStatus::UpdatedStateful(id)
            | InsertStatus::DuplicateNotInserted(id) => *id,
        }
    }

    /// Status line returned to the recording client
    pub fn message(&self, scenario: &str) -> String {
        match self {
            InsertStatus::Inserted(id) => {
                format!("inserted scenario_stub: {id} (scenario: {scenario})")
            }
            InsertStatus::UpdatedStateful(id) => {
                format!("updated with stateful response: {id} (scenario: {scenario})")
            }
            InsertStatus::DuplicateNotInserted(id) => {
                format!("duplicate stub found, not inserting: {id} (scenario: {scenario})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_json() -> Value {
        json!({
            "request": {
                "method": "POST",
                "bodyPatterns": [{"contains": ["<id>1</id>", "get_account"]}]
            },
            "response": {"status": "200", "body": "<account/>"},
            "recorded": "2024-01-01",
            "module": {"name": "accounts"}
        })
    }

    #[test]
    fn test_single_body_becomes_one_step() {
        let payload: StubPayload = serde_json::from_value(payload_json()).unwrap();
        assert_eq!(payload.response.body, vec![json!("<account/>")]);
        assert_eq!(payload.response.status, 200);
    }

    #[test]
    fn test_body_array_is_step_sequence() {
        let mut value = payload_json();
        value["response"]["body"] = json!(["one", "two"]);
        let payload: StubPayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload.response_body(), &[json!("one"), json!("two")]);
    }

    #[test]
    fn test_unknown_fields_are_preserved() {
        let payload: StubPayload = serde_json::from_value(payload_json()).unwrap();
        assert_eq!(payload.extra.get("module"), Some(&json!({"name": "accounts"})));

        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["module"]["name"], json!("accounts"));
        assert_eq!(back["recorded"], json!("2024-01-01"));
    }

    #[test]
    fn test_invalid_status_rejected() {
        let mut value = payload_json();
        value["response"]["status"] = json!("abc");
        assert!(serde_json::from_value::<StubPayload>(value).is_err());
    }

    #[test]
    fn test_contains_rules_in_order() {
        let payload: StubPayload = serde_json::from_value(payload_json()).unwrap();
        let rules: Vec<&str> = payload.contains_rules().collect();
        assert_eq!(rules, vec!["<id>1</id>", "get_account"]);
    }

    #[test]
    fn test_set_payload_invalidates_hash() {
        let payload: StubPayload = serde_json::from_value(payload_json()).unwrap();
        let mut stub = Stub::new(
            StubId(1),
            "accounts",
            MatcherKey::new("m".into()),
            payload.clone(),
        );
        let before = stub.content_hash().cloned();
        assert!(before.is_some());

        let mut changed = payload;
        changed.response.body.push(json!("<account v='2'/>"));
        stub.set_payload(changed);
        assert_ne!(stub.content_hash().cloned(), before);
    }

    #[test]
    fn test_insert_status_messages() {
        let status = InsertStatus::DuplicateNotInserted(StubId(7));
        assert_eq!(status.stub_id(), StubId(7));
        assert!(status.message("s1").contains("duplicate"));
        assert!(InsertStatus::Inserted(StubId(1)).message("s1").contains("inserted"));
    }
}
