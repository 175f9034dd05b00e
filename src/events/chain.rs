//! Hash chain sealing and verification.
//!
//! ## Canonical Hash Input
//!
//! Each event is hashed over the compact JSON object
//!
//! ```text
//! {"index":N,"time":"<RFC3339Nano UTC>","type":"...","message":"...","fields":{...}|null,"prev_hash":"..."}
//! ```
//!
//! with keys in exactly that order, no insignificant whitespace, and `fields`
//! keys sorted. The rendered hash is `sha256:<hex(sha256(bytes))>`.
//!
//! `prev_hash` of event N is the hash of event N-1 as it was sealed; the first
//! event of a fresh chain has an empty `prev_hash`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::{format_rfc3339_nano, prefixed_sha256, to_canonical_bytes};

/// A sealed, hash-chained event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 1-based position in the chain.
    pub index: i64,
    /// When the event happened (UTC).
    pub time: DateTime<Utc>,
    /// Dotted event type, e.g. `external.alert`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
    /// Hash of the preceding event.
    #[serde(default)]
    pub prev_hash: String,
    /// Hash of this event.
    #[serde(default)]
    pub hash: String,
}

/// An event before sealing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    /// Event time; `None` seals with the current time.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    /// Dotted event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Optional structured payload.
    #[serde(default)]
    pub fields: Option<Map<String, Value>>,
}

impl EventInput {
    /// Create an input with a type and message.
    pub fn new(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            time: None,
            event_type: event_type.into(),
            message: message.into(),
            fields: None,
        }
    }

    /// Attach a structured field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Pin the event time.
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }
}

impl From<Event> for EventInput {
    fn from(event: Event) -> Self {
        Self {
            time: Some(event.time),
            event_type: event.event_type,
            message: event.message,
            fields: event.fields,
        }
    }
}

#[derive(Serialize)]
struct HashInput<'a> {
    index: i64,
    time: String,
    #[serde(rename = "type")]
    event_type: &'a str,
    message: &'a str,
    fields: &'a Option<Map<String, Value>>,
    prev_hash: &'a str,
}

/// Canonical bytes hashed for `event` (its `hash` field is ignored).
pub fn hash_input_bytes(event: &Event) -> Vec<u8> {
    let input = HashInput {
        index: event.index,
        time: format_rfc3339_nano(&event.time),
        event_type: &event.event_type,
        message: &event.message,
        fields: &event.fields,
        prev_hash: &event.prev_hash,
    };
    // Only strings, integers, and string-keyed maps: serialization cannot fail.
    to_canonical_bytes(&input).unwrap_or_else(|_| unreachable!("event hash input is always serializable"))
}

/// Compute the chain hash of `event`.
pub fn compute_hash(event: &Event) -> String {
    prefixed_sha256(&hash_input_bytes(event))
}

/// Running chain state: the next index and the last sealed hash.
#[derive(Debug, Clone, Default)]
pub struct HashChain {
    next_index: i64,
    last_hash: String,
}

impl HashChain {
    /// Start a fresh chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal `input` as the next link.
    pub fn seal(&mut self, input: EventInput, now: DateTime<Utc>) -> Event {
        self.next_index += 1;
        let mut event = Event {
            index: self.next_index,
            time: input.time.unwrap_or(now),
            event_type: input.event_type,
            message: input.message,
            fields: input.fields,
            prev_hash: self.last_hash.clone(),
            hash: String::new(),
        };
        event.hash = compute_hash(&event);
        self.last_hash = event.hash.clone();
        event
    }

    /// Hash of the most recently sealed event (empty for a fresh chain).
    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    /// Index of the most recently sealed event (0 for a fresh chain).
    pub fn last_index(&self) -> i64 {
        self.next_index
    }
}

/// A single integrity failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    /// Index of the offending event as stored.
    pub index: i64,
    /// What failed: `index out of sequence`, `prev hash mismatch`, or `hash mismatch`.
    pub reason: String,
    /// Expected value, when meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Observed value, when meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

/// Outcome of walking a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// True when no violation was found.
    pub valid: bool,
    /// Number of events walked.
    pub checked: usize,
    /// Recomputed hash of the last event walked.
    pub last_hash: String,
    /// Every violation found, in chain order.
    pub violations: Vec<IntegrityViolation>,
}

/// Walk `events` and check index sequence, linkage, and hashes.
///
/// `first_index` and `anchor_hash` describe where the retained window starts:
/// `(1, "")` for a complete chain, or the first retained index and the hash of
/// the last evicted event after ring-buffer overflow.
pub fn verify_chain<'a, I>(events: I, first_index: i64, anchor_hash: &str) -> IntegrityReport
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut violations = Vec::new();
    let mut prev_hash = anchor_hash.to_string();
    let mut last_hash = String::new();
    let mut checked = 0usize;

    for (i, event) in events.into_iter().enumerate() {
        checked += 1;
        let expected_index = first_index + i as i64;
        if event.index != expected_index {
            violations.push(IntegrityViolation {
                index: event.index,
                reason: "index out of sequence".to_string(),
                expected: Some(expected_index.to_string()),
                actual: Some(event.index.to_string()),
            });
        }
        if event.prev_hash != prev_hash {
            violations.push(IntegrityViolation {
                index: event.index,
                reason: "prev hash mismatch".to_string(),
                expected: Some(prev_hash.clone()),
                actual: Some(event.prev_hash.clone()),
            });
        }
        let recomputed = compute_hash(event);
        if recomputed != event.hash {
            violations.push(IntegrityViolation {
                index: event.index,
                reason: "hash mismatch".to_string(),
                expected: Some(recomputed.clone()),
                actual: Some(event.hash.clone()),
            });
        }
        prev_hash = event.hash.clone();
        last_hash = recomputed;
    }

    IntegrityReport {
        valid: violations.is_empty(),
        checked,
        last_hash,
        violations,
    }
}
