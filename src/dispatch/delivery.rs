//! Delivery attempts, signing, and bounded delivery history.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::canonical::hmac_sha256_hex;
use crate::http::{HttpClient, HttpRequest};
use crate::ids::IdAllocator;
use crate::ring::BoundedRing;

/// Default number of delivery records kept per dispatcher.
pub const DEFAULT_HISTORY_CAPACITY: usize = 5_000;

/// Signature header carrying `sha256=<hex hmac>` of the exact body.
pub const SIGNATURE_HEADER: &str = "X-Masterchef-Signature";
/// Mirrors the event type on webhook deliveries.
pub const EVENT_TYPE_HEADER: &str = "X-Masterchef-Event-Type";
/// Notification target kind.
pub const NOTIFICATION_KIND_HEADER: &str = "X-Masterchef-Notification-Kind";
/// Alert route on notification deliveries.
pub const ALERT_ROUTE_HEADER: &str = "X-Masterchef-Alert-Route";

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Endpoint answered 2xx.
    Delivered,
    /// Transport error or non-2xx answer.
    Failed,
}

/// Outcome of a single POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Delivered or failed.
    pub status: DeliveryStatus,
    /// HTTP status when the endpoint answered.
    pub status_code: Option<u16>,
    /// Failure description.
    pub error: Option<String>,
}

impl DeliveryOutcome {
    /// Whether the attempt succeeded.
    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

/// `sha256=<hex(hmac-sha256(body, secret))>`
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    format!("sha256={}", hmac_sha256_hex(secret.as_bytes(), body))
}

/// Attach the signature header when a non-empty secret is set.
pub fn signed(request: HttpRequest, secret: Option<&str>) -> HttpRequest {
    match secret.filter(|s| !s.is_empty()) {
        Some(secret) => {
            let signature = sign_body(secret, &request.body);
            request.with_header(SIGNATURE_HEADER, signature)
        }
        None => request,
    }
}

/// Send once. No retries.
pub async fn attempt(client: &dyn HttpClient, request: HttpRequest) -> DeliveryOutcome {
    let url = request.url.clone();
    match client.send(request).await {
        Ok(response) if response.is_success() => DeliveryOutcome {
            status: DeliveryStatus::Delivered,
            status_code: Some(response.status),
            error: None,
        },
        Ok(response) => {
            tracing::warn!(url = %url, status = response.status, "delivery rejected");
            DeliveryOutcome {
                status: DeliveryStatus::Failed,
                status_code: Some(response.status),
                error: Some(format!("unexpected status {}", response.status)),
            }
        }
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "delivery failed");
            DeliveryOutcome {
                status: DeliveryStatus::Failed,
                status_code: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Per-target counters shared by webhooks and notification targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounters {
    /// Successful deliveries.
    pub success_count: u64,
    /// Failed deliveries.
    pub failure_count: u64,
    /// Most recent failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time of the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery: Option<DateTime<Utc>>,
}

impl DeliveryCounters {
    /// Fold one outcome into the counters.
    pub fn record(&mut self, outcome: &DeliveryOutcome, at: DateTime<Utc>) {
        match outcome.status {
            DeliveryStatus::Delivered => self.success_count += 1,
            DeliveryStatus::Failed => {
                self.failure_count += 1;
                self.last_error = outcome.error.clone();
            }
        }
        self.last_delivery = Some(at);
    }
}

/// A record that can live in a [`DeliveryHistory`].
pub trait DeliveryRecord: Clone {
    /// Assign the history-allocated id.
    fn set_id(&mut self, id: String);
}

#[derive(Debug)]
struct HistoryState<R> {
    ids: IdAllocator,
    items: BoundedRing<R>,
}

/// Bounded, append-only delivery history with its own id sequence.
#[derive(Debug)]
pub struct DeliveryHistory<R> {
    state: RwLock<HistoryState<R>>,
}

impl<R: DeliveryRecord> DeliveryHistory<R> {
    /// History with ids `<prefix>-N` keeping at most `capacity` records.
    pub fn new(prefix: &'static str, capacity: usize) -> Self {
        Self {
            state: RwLock::new(HistoryState {
                ids: IdAllocator::new(prefix),
                items: BoundedRing::new(capacity),
            }),
        }
    }

    /// Assign an id and append, evicting the oldest record when full.
    pub fn push(&self, mut record: R) -> R {
        let mut state = self.state.write();
        record.set_id(state.ids.next_id());
        state.items.push(record.clone());
        record
    }

    /// Up to `limit` records, newest first. `0` returns everything.
    pub fn recent(&self, limit: usize) -> Vec<R> {
        let state = self.state.read();
        let take = if limit == 0 { state.items.len() } else { limit };
        state.items.iter().rev().take(take).cloned().collect()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    /// Whether no record is held.
    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::verify_hmac_sha256;
    use crate::http::RecordingClient;

    #[derive(Debug, Clone)]
    struct Rec {
        id: String,
        n: u32,
    }

    impl DeliveryRecord for Rec {
        fn set_id(&mut self, id: String) {
            self.id = id;
        }
    }

    #[test]
    fn test_sign_body_verifies() {
        let sig = sign_body("s3cret", b"{\"a\":1}");
        let hex = sig.strip_prefix("sha256=").unwrap();
        assert!(verify_hmac_sha256(b"s3cret", b"{\"a\":1}", hex));
        assert!(!verify_hmac_sha256(b"other", b"{\"a\":1}", hex));
    }

    #[test]
    fn test_signed_skips_empty_secret() {
        let req = HttpRequest::post_json("http://x", b"{}".to_vec());
        assert!(signed(req.clone(), Some("")).header(SIGNATURE_HEADER).is_none());
        assert!(signed(req.clone(), None).header(SIGNATURE_HEADER).is_none());
        assert!(signed(req, Some("k")).header(SIGNATURE_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_attempt_classifies_outcomes() {
        let client = RecordingClient::new();
        client.respond("http://bad", 503, "");
        client.respond("http://down", 0, "");

        let ok = attempt(&client, HttpRequest::post_json("http://good", Vec::new())).await;
        assert!(ok.is_delivered());
        assert_eq!(ok.status_code, Some(200));

        let bad = attempt(&client, HttpRequest::post_json("http://bad", Vec::new())).await;
        assert_eq!(bad.status, DeliveryStatus::Failed);
        assert_eq!(bad.status_code, Some(503));

        let down = attempt(&client, HttpRequest::post_json("http://down", Vec::new())).await;
        assert_eq!(down.status_code, None);
        assert!(down.error.is_some());
    }

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let history = DeliveryHistory::new("whdel", 3);
        for n in 0..5 {
            history.push(Rec { id: String::new(), n });
        }
        let recent = history.recent(0);
        let ns: Vec<u32> = recent.iter().map(|r| r.n).collect();
        assert_eq!(ns, vec![4, 3, 2]);
        assert_eq!(recent[0].id, "whdel-5");
        assert_eq!(history.recent(1).len(), 1);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_counters_record() {
        let mut c = DeliveryCounters::default();
        let now = Utc::now();
        c.record(
            &DeliveryOutcome { status: DeliveryStatus::Failed, status_code: Some(500), error: Some("x".into()) },
            now,
        );
        c.record(
            &DeliveryOutcome { status: DeliveryStatus::Delivered, status_code: Some(200), error: None },
            now,
        );
        assert_eq!((c.success_count, c.failure_count), (1, 1));
        assert_eq!(c.last_error.as_deref(), Some("x"));
        assert_eq!(c.last_delivery, Some(now));
    }
}
