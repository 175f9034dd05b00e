//! Bounded, hash-chained, append-only event log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::chain::{verify_chain, Event, EventInput, HashChain, IntegrityReport};
use super::fanout::{self, Subscriber, Subscription};
use crate::clock::Clock;
use crate::ring::BoundedRing;

/// Default number of retained events.
pub const DEFAULT_CAPACITY: usize = 10_000;
/// Default per-subscriber channel buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
/// Default `EventQuery::limit`.
pub const DEFAULT_QUERY_LIMIT: usize = 200;

/// Filter for [`EventLog::query`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    /// Inclusive lower bound on `time`.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `time`.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive prefix on `type`.
    #[serde(default)]
    pub type_prefix: String,
    /// Case-insensitive substring of `message` or `type`.
    #[serde(default)]
    pub contains: String,
    /// Maximum results; 0 means [`DEFAULT_QUERY_LIMIT`].
    #[serde(default)]
    pub limit: usize,
    /// Iterate newest first.
    #[serde(default)]
    pub desc: bool,
}

impl EventQuery {
    fn matches(&self, event: &Event, type_prefix: &str, contains: &str) -> bool {
        if self.since.is_some_and(|since| event.time < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.time > until) {
            return false;
        }
        let event_type = event.event_type.to_lowercase();
        if !type_prefix.is_empty() && !event_type.starts_with(type_prefix) {
            return false;
        }
        if !contains.is_empty()
            && !event.message.to_lowercase().contains(contains)
            && !event_type.contains(contains)
        {
            return false;
        }
        true
    }
}

#[derive(Debug)]
struct LogState {
    chain: HashChain,
    events: BoundedRing<Event>,
    // Hash of the newest evicted event; empty while nothing has been evicted.
    anchor_hash: String,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

impl LogState {
    fn first_retained_index(&self) -> i64 {
        self.chain.last_index() - self.events.len() as i64 + 1
    }
}

/// Append-only event log with a hash chain, bounded retention, and fan-out.
///
/// ## Retention
///
/// The log keeps the newest `capacity` events. Eviction never rewrites the
/// survivors: each keeps the `prev_hash` it was sealed with, and
/// [`verify_integrity`](Self::verify_integrity) anchors on the hash of the
/// last evicted event.
///
/// ## Fan-out
///
/// Subscribers are offered each event under the writer lock with a
/// non-blocking send, in seal order. A full subscriber misses the event.
#[derive(Debug)]
pub struct EventLog {
    state: RwLock<LogState>,
    subscriber_buffer: usize,
    clock: Arc<dyn Clock>,
}

impl EventLog {
    /// Log with default capacity and subscriber buffer.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER, clock)
    }

    /// Log retaining at most `capacity` events (minimum 1).
    pub fn with_capacity(capacity: usize, subscriber_buffer: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(LogState {
                chain: HashChain::new(),
                events: BoundedRing::new(capacity),
                anchor_hash: String::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
            subscriber_buffer: subscriber_buffer.max(1),
            clock,
        }
    }

    /// Seal and append one event, then offer it to every subscriber.
    ///
    /// The offer happens under the writer lock so each subscriber sees events
    /// in index order; `try_send` never blocks, so the lock is not held on I/O.
    pub fn append(&self, input: EventInput) -> Event {
        let now = self.clock.now();
        let mut state = self.state.write();
        let sealed = state.chain.seal(input, now);
        if let Some(evicted) = state.events.push(sealed.clone()) {
            tracing::trace!(index = evicted.index, "event evicted");
            state.anchor_hash = evicted.hash;
        }
        state.subscribers.retain(|s| !s.is_closed());
        if !state.subscribers.is_empty() {
            let stats = fanout::broadcast(&state.subscribers, &sealed);
            if stats.dropped > 0 {
                tracing::debug!(index = sealed.index, dropped = stats.dropped, "slow subscribers skipped event");
            }
        }
        sealed
    }

    /// Events matching `q`, oldest first unless `q.desc`.
    pub fn query(&self, q: &EventQuery) -> Vec<Event> {
        let limit = if q.limit == 0 { DEFAULT_QUERY_LIMIT } else { q.limit };
        let type_prefix = q.type_prefix.trim().to_lowercase();
        let contains = q.contains.trim().to_lowercase();

        let state = self.state.read();
        let matches = |e: &&Event| q.matches(e, &type_prefix, &contains);
        if q.desc {
            state.events.iter().rev().filter(matches).take(limit).cloned().collect()
        } else {
            state.events.iter().filter(matches).take(limit).cloned().collect()
        }
    }

    /// Every retained event, oldest first.
    pub fn list(&self) -> Vec<Event> {
        self.state.read().events.to_vec()
    }

    /// Wholesale reset from `items`.
    ///
    /// This is destructive: the previous chain is discarded and the newest
    /// `capacity` items are re-sealed into a fresh chain starting at index 1.
    /// Original indices and hashes in `items` are ignored; times are kept.
    /// Returns the number of events retained.
    pub fn replace(&self, items: Vec<Event>) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write();
        let capacity = state.events.capacity();
        let skip = items.len().saturating_sub(capacity);

        let mut chain = HashChain::new();
        let sealed: Vec<Event> = items
            .into_iter()
            .skip(skip)
            .map(|item| chain.seal(EventInput::from(item), now))
            .collect();
        let retained = sealed.len();

        state.chain = chain;
        state.events.replace(sealed);
        state.anchor_hash.clear();
        tracing::warn!(retained, dropped = skip, "event log replaced; previous hash chain discarded");
        retained
    }

    /// Walk the retained events and check the chain.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let state = self.state.read();
        let report = verify_chain(
            state.events.iter(),
            state.first_retained_index(),
            &state.anchor_hash,
        );
        drop(state);
        if !report.valid {
            tracing::warn!(
                checked = report.checked,
                violations = report.violations.len(),
                "event log integrity check failed"
            );
        }
        report
    }

    /// Register a subscriber that receives every event appended from now on.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.state.write();
        state.next_subscriber_id += 1;
        let (subscriber, subscription) =
            fanout::channel(state.next_subscriber_id, self.subscriber_buffer);
        state.subscribers.push(subscriber);
        tracing::debug!(subscriber_id = subscription.id, "event subscriber added");
        subscription
    }

    /// Remove a subscriber. Its receiver then drains and closes.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut state = self.state.write();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id() != id);
        state.subscribers.len() != before
    }

    /// Number of registered subscribers whose receiver is still alive.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .read()
            .subscribers
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    /// Whether the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }

    /// Retention capacity.
    pub fn capacity(&self) -> usize {
        self.state.read().events.capacity()
    }

    /// Hash of the most recently sealed event.
    pub fn last_hash(&self) -> String {
        self.state.read().chain.last_hash().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::chain::compute_hash;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn log_with(capacity: usize) -> (EventLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        (EventLog::with_capacity(capacity, 4, clock.clone()), clock)
    }

    #[test]
    fn test_integrity_and_tamper_detection() {
        let (log, _) = log_with(100);
        log.append(EventInput::new("t.a", "first"));
        log.append(EventInput::new("t.b", "second"));
        let third = log.append(EventInput::new("t.c", "third"));

        let report = log.verify_integrity();
        assert!(report.valid);
        assert_eq!(report.checked, 3);
        assert_eq!(report.last_hash, compute_hash(&third));

        log.state
            .write()
            .events
            .iter_mut()
            .nth(1)
            .unwrap()
            .message = "tampered".to_string();

        let report = log.verify_integrity();
        assert!(!report.valid);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].index, 2);
        assert_eq!(report.violations[0].reason, "hash mismatch");
    }

    #[test]
    fn test_append_uses_clock_for_zero_time() {
        let (log, clock) = log_with(10);
        clock.advance_secs(5);
        let e = log.append(EventInput::new("t", ""));
        assert_eq!(e.time, t0() + Duration::seconds(5));
    }

    #[test]
    fn test_eviction_keeps_tail_and_verifies() {
        let (log, _) = log_with(3);
        for i in 0..5 {
            log.append(EventInput::new(format!("t.{i}"), ""));
        }
        let events = log.list();
        let indices: Vec<i64> = events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![3, 4, 5]);
        assert_eq!(log.len(), 3);

        let report = log.verify_integrity();
        assert!(report.valid, "{:?}", report.violations);
        assert_eq!(report.checked, 3);
    }

    #[test]
    fn test_query_filters() {
        let (log, clock) = log_with(100);
        log.append(EventInput::new("External.Alert", "Disk full on web-1"));
        clock.advance_secs(60);
        log.append(EventInput::new("internal.info", "nightly run ok"));
        clock.advance_secs(60);
        log.append(EventInput::new("external.deploy", "web-1 rolled"));

        let by_prefix = log.query(&EventQuery {
            type_prefix: "EXTERNAL.".to_string(),
            ..Default::default()
        });
        assert_eq!(by_prefix.len(), 2);

        let by_text = log.query(&EventQuery {
            contains: "WEB-1".to_string(),
            desc: true,
            ..Default::default()
        });
        let types: Vec<&str> = by_text.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["external.deploy", "External.Alert"]);

        let windowed = log.query(&EventQuery {
            since: Some(t0() + Duration::seconds(30)),
            until: Some(t0() + Duration::seconds(90)),
            ..Default::default()
        });
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].event_type, "internal.info");

        let limited = log.query(&EventQuery { limit: 1, desc: true, ..Default::default() });
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].index, 3);
    }

    #[test]
    fn test_query_default_limit() {
        let (log, _) = log_with(500);
        for _ in 0..250 {
            log.append(EventInput::new("t", ""));
        }
        assert_eq!(log.query(&EventQuery::default()).len(), DEFAULT_QUERY_LIMIT);
    }

    #[test]
    fn test_replace_reseals_newest_tail() {
        let (log, _) = log_with(2);
        log.append(EventInput::new("old", ""));

        let mut donor = HashChain::new();
        let items: Vec<Event> = ["a", "b", "c"]
            .iter()
            .map(|t| donor.seal(EventInput::new(*t, ""), t0() - Duration::days(1)))
            .collect();

        assert_eq!(log.replace(items.clone()), 2);
        let events = log.list();
        assert_eq!(events[0].event_type, "b");
        assert_eq!(events[0].index, 1);
        assert_eq!(events[0].prev_hash, "");
        assert_eq!(events[0].time, items[1].time);
        assert_eq!(events[1].index, 2);
        assert!(log.verify_integrity().valid);

        let next = log.append(EventInput::new("d", ""));
        assert_eq!(next.index, 3);
        assert_eq!(next.prev_hash, events[1].hash);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order_and_slow_ones_drop() {
        let (log, _) = log_with(100);
        let mut sub = log.subscribe();
        assert_eq!(log.subscriber_count(), 1);

        for i in 0..6 {
            log.append(EventInput::new(format!("t.{i}"), ""));
        }
        let mut received = Vec::new();
        while let Ok(e) = sub.receiver.try_recv() {
            received.push(e.index);
        }
        // Buffer is 4; the producer never blocked.
        assert_eq!(received, vec![1, 2, 3, 4]);

        assert!(log.unsubscribe(sub.id));
        assert!(!log.unsubscribe(sub.id));
        assert_eq!(log.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let (log, _) = log_with(100);
        let sub = log.subscribe();
        drop(sub);
        log.append(EventInput::new("t", ""));
        assert_eq!(log.state.read().subscribers.len(), 0);
    }

    #[test]
    fn test_concurrent_appends_reach_subscriber_in_index_order() {
        let log = Arc::new(EventLog::with_capacity(1_000, 1_000, Arc::new(ManualClock::new(t0()))));
        let mut sub = log.subscribe();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        log.append(EventInput::new(format!("w{w}.t"), format!("{i}")));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut received = Vec::new();
        while let Ok(e) = sub.receiver.try_recv() {
            received.push(e.index);
        }
        assert_eq!(received, (1..=400).collect::<Vec<i64>>());
    }

    #[test]
    fn test_last_hash_tracks_chain() {
        let (log, _) = log_with(1);
        assert_eq!(log.last_hash(), "");
        let a = log.append(EventInput::new("a", ""));
        assert_eq!(log.last_hash(), a.hash);
        assert_eq!(log.capacity(), 1);
    }
}
