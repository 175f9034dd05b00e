//! Webhook subscriptions and event dispatch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::delivery::{
    attempt, signed, DeliveryCounters, DeliveryHistory, DeliveryRecord, DeliveryStatus,
    DEFAULT_HISTORY_CAPACITY, EVENT_TYPE_HEADER,
};
use crate::canonical::to_canonical_bytes;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::events::{Event, Subscription};
use crate::http::{validate_url, HttpClient, HttpRequest};
use crate::ids::prefix;
use crate::impl_entity;
use crate::store::{id_sequence, EntityStore};
use crate::text::{normalize, normalize_key, normalize_optional, require};

/// A registered webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    /// Store-assigned id (`wh-N`).
    pub id: String,
    /// Unique name; the natural key for upsert.
    pub name: String,
    /// `http://` or `https://` endpoint.
    pub url: String,
    /// Event types starting with this prefix (case-sensitive) are delivered.
    /// Empty matches all.
    #[serde(default)]
    pub event_prefix: String,
    /// Disabled subscriptions receive nothing.
    pub enabled: bool,
    /// HMAC secret. Never serialized.
    #[serde(skip_serializing, default)]
    pub secret: Option<String>,
    /// Delivery counters.
    #[serde(flatten)]
    pub counters: DeliveryCounters,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl_entity!(WebhookSubscription, prefix::WEBHOOK);

impl WebhookSubscription {
    /// Whether this subscription wants events of `event_type`.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.enabled && event_type.starts_with(self.event_prefix.as_str())
    }
}

/// Caller-supplied webhook definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookInput {
    /// Unique name.
    pub name: String,
    /// Endpoint URL.
    pub url: String,
    /// Event-type prefix filter.
    #[serde(default)]
    pub event_prefix: String,
    /// Defaults to `true`.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Optional HMAC secret.
    #[serde(default)]
    pub secret: Option<String>,
}

/// One webhook delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// History-assigned id (`whdel-N`).
    pub id: String,
    /// Target subscription.
    pub webhook_id: String,
    /// Index of the delivered event.
    pub event_index: i64,
    /// Type of the delivered event.
    pub event_type: String,
    /// Outcome.
    pub status: DeliveryStatus,
    /// HTTP status, when the endpoint answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempt time.
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryRecord for WebhookDelivery {
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Webhook registry plus dispatcher.
#[derive(Debug)]
pub struct WebhookDispatcher {
    subscriptions: EntityStore<WebhookSubscription>,
    deliveries: DeliveryHistory<WebhookDelivery>,
    client: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
}

impl WebhookDispatcher {
    /// Dispatcher with the default delivery history size.
    pub fn new(client: Arc<dyn HttpClient>, clock: Arc<dyn Clock>) -> Self {
        Self::with_history(DEFAULT_HISTORY_CAPACITY, client, clock)
    }

    /// Dispatcher keeping at most `history` delivery records.
    pub fn with_history(history: usize, client: Arc<dyn HttpClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            subscriptions: EntityStore::new(),
            deliveries: DeliveryHistory::new(prefix::WEBHOOK_DELIVERY, history),
            client,
            clock,
        }
    }

    /// Register a webhook, or update the one with the same name.
    ///
    /// Updates keep the id, creation time, and delivery counters.
    pub fn register(&self, input: WebhookInput) -> Result<WebhookSubscription> {
        let name = require(&input.name, "name")?;
        let url = validate_url(&input.url)?;
        let event_prefix = normalize(&input.event_prefix);
        let enabled = input.enabled.unwrap_or(true);
        let secret = normalize_optional(input.secret.as_deref());
        let now = self.clock.now();

        self.subscriptions.write(|table| {
            let key = normalize_key(&name);
            if let Some(existing) = table.values_mut().find(|w| normalize_key(&w.name) == key) {
                existing.name = name;
                existing.url = url;
                existing.event_prefix = event_prefix;
                existing.enabled = enabled;
                existing.secret = secret;
                existing.updated_at = now;
                tracing::info!(webhook_id = %existing.id, "webhook updated");
                return Ok(existing.clone());
            }
            let created = table.insert_new(WebhookSubscription {
                id: String::new(),
                name,
                url,
                event_prefix,
                enabled,
                secret,
                counters: DeliveryCounters::default(),
                created_at: now,
                updated_at: now,
            });
            tracing::info!(webhook_id = %created.id, prefix = %created.event_prefix, "webhook registered");
            Ok(created)
        })
    }

    /// Look up a subscription.
    pub fn get(&self, id: &str) -> Option<WebhookSubscription> {
        self.subscriptions.get(id)
    }

    /// All subscriptions, newest first.
    pub fn list(&self) -> Vec<WebhookSubscription> {
        self.subscriptions.list()
    }

    /// Remove a subscription.
    pub fn delete(&self, id: &str) -> bool {
        self.subscriptions.delete(id)
    }

    /// Enable or disable a subscription.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<WebhookSubscription> {
        let now = self.clock.now();
        self.subscriptions.write(|table| {
            let webhook = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("webhook not found"))?;
            webhook.enabled = enabled;
            webhook.updated_at = now;
            Ok(webhook.clone())
        })
    }

    /// POST `event` to every enabled subscription whose prefix matches.
    ///
    /// Returns the delivery records created by this call.
    pub async fn dispatch(&self, event: &Event) -> Vec<WebhookDelivery> {
        let mut targets: Vec<WebhookSubscription> = self.subscriptions.read(|table| {
            table
                .values()
                .filter(|w| w.accepts(&event.event_type))
                .cloned()
                .collect()
        });
        if targets.is_empty() {
            return Vec::new();
        }
        targets.sort_by_key(|w| id_sequence(&w.id));

        let body = match to_canonical_bytes(event) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(index = event.index, error = %e, "event not serializable; dispatch skipped");
                return Vec::new();
            }
        };

        let mut records = Vec::with_capacity(targets.len());
        for target in targets {
            let request = HttpRequest::post_json(target.url.as_str(), body.clone())
                .with_header(EVENT_TYPE_HEADER, event.event_type.as_str());
            let request = signed(request, target.secret.as_deref());
            let outcome = attempt(self.client.as_ref(), request).await;

            let now = self.clock.now();
            self.subscriptions.write(|table| {
                if let Some(webhook) = table.get_mut(&target.id) {
                    webhook.counters.record(&outcome, now);
                    webhook.updated_at = now;
                }
            });
            let record = self.deliveries.push(WebhookDelivery {
                id: String::new(),
                webhook_id: target.id.clone(),
                event_index: event.index,
                event_type: event.event_type.clone(),
                status: outcome.status,
                status_code: outcome.status_code,
                error: outcome.error,
                delivered_at: now,
            });
            tracing::debug!(
                webhook_id = %target.id,
                delivery_id = %record.id,
                status = ?record.status,
                "webhook delivery recorded"
            );
            records.push(record);
        }
        records
    }

    /// Up to `limit` deliveries, newest first. `0` returns all.
    pub fn deliveries(&self, limit: usize) -> Vec<WebhookDelivery> {
        self.deliveries.recent(limit)
    }

    /// Dispatch every event from an event-log subscription until it closes.
    ///
    /// Returns the number of events forwarded.
    pub async fn forward_events(&self, mut subscription: Subscription) -> usize {
        let mut forwarded = 0;
        while let Some(event) = subscription.receiver.recv().await {
            self.dispatch(&event).await;
            forwarded += 1;
        }
        tracing::debug!(subscriber_id = subscription.id, forwarded, "event forwarding stopped");
        forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::verify_hmac_sha256;
    use crate::clock::SystemClock;
    use crate::dispatch::delivery::SIGNATURE_HEADER;
    use crate::events::{EventInput, EventLog};
    use crate::http::RecordingClient;
    use crate::error::ErrorKind;

    fn dispatcher() -> (WebhookDispatcher, Arc<RecordingClient>) {
        let client = Arc::new(RecordingClient::new());
        (WebhookDispatcher::new(client.clone(), Arc::new(SystemClock)), client)
    }

    fn event(event_type: &str) -> Event {
        Event {
            index: 1,
            time: Utc::now(),
            event_type: event_type.to_string(),
            message: "m".to_string(),
            fields: None,
            prev_hash: String::new(),
            hash: "sha256:x".to_string(),
        }
    }

    fn hook(name: &str, prefix: &str) -> WebhookInput {
        WebhookInput {
            name: name.to_string(),
            url: "https://hooks.example.com/in".to_string(),
            event_prefix: prefix.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_prefix_filtering_and_disable() {
        let (d, client) = dispatcher();
        let wh = d.register(hook("ops", "external.")).unwrap();

        let sent = d.dispatch(&event("external.alert")).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, DeliveryStatus::Delivered);

        assert!(d.dispatch(&event("internal.info")).await.is_empty());

        d.set_enabled(&wh.id, false).unwrap();
        assert!(d.dispatch(&event("external.alert")).await.is_empty());

        assert_eq!(client.requests().len(), 1);
        let stored = d.get(&wh.id).unwrap();
        assert_eq!(stored.counters.success_count, 1);
        assert!(stored.counters.last_delivery.is_some());
    }

    #[tokio::test]
    async fn test_signature_and_event_type_headers() {
        let (d, client) = dispatcher();
        let mut input = hook("signed", "");
        input.secret = Some("topsecret".to_string());
        d.register(input).unwrap();

        d.dispatch(&event("deploy.done")).await;
        let req = &client.requests()[0];
        assert_eq!(req.header(EVENT_TYPE_HEADER), Some("deploy.done"));
        let sig = req.header(SIGNATURE_HEADER).unwrap().strip_prefix("sha256=").unwrap();
        assert!(verify_hmac_sha256(b"topsecret", &req.body, sig));
    }

    #[test]
    fn test_prefix_match_is_case_sensitive() {
        let (d, _) = dispatcher();
        let wh = d.register(hook("ops", "external.")).unwrap();
        assert!(wh.accepts("external.alert"));
        assert!(!wh.accepts("External.alert"));
        assert!(!wh.accepts("EXTERNAL.ALERT"));
        assert!(d.register(hook("all", "")).unwrap().accepts("Anything"));
    }

    #[tokio::test]
    async fn test_body_is_canonical_event_json() {
        let (d, client) = dispatcher();
        d.register(hook("raw", "")).unwrap();

        let mut sent = event("deploy.done");
        sent.fields = Some(serde_json::Map::from_iter([
            ("zone".to_string(), serde_json::json!("b")),
            ("app".to_string(), serde_json::json!("web")),
        ]));
        d.dispatch(&sent).await;

        let body = client.requests()[0].body.clone();
        assert_eq!(body, to_canonical_bytes(&sent).unwrap());
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(r#""fields":{"app":"web","zone":"b"}"#));
        assert!(!text.contains('\n'));
    }

    #[tokio::test]
    async fn test_failures_update_counters() {
        let (d, client) = dispatcher();
        client.respond("https://hooks.example.com", 500, "");
        let wh = d.register(hook("ops", "")).unwrap();

        let sent = d.dispatch(&event("x")).await;
        assert_eq!(sent[0].status, DeliveryStatus::Failed);
        assert_eq!(sent[0].status_code, Some(500));

        let stored = d.get(&wh.id).unwrap();
        assert_eq!(stored.counters.failure_count, 1);
        assert_eq!(stored.counters.last_error.as_deref(), Some("unexpected status 500"));
    }

    #[tokio::test]
    async fn test_register_is_upsert_by_name() {
        let (d, _) = dispatcher();
        let first = d.register(hook("ops", "a.")).unwrap();
        d.dispatch(&event("a.b")).await;

        let second = d.register(hook("OPS", "b.")).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.event_prefix, "b.");
        assert_eq!(second.counters.success_count, 1);
        assert_eq!(d.list().len(), 1);
    }

    #[test]
    fn test_register_validation() {
        let (d, _) = dispatcher();
        let mut bad = hook("x", "");
        bad.url = "ftp://nope".to_string();
        assert_eq!(d.register(bad).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(d.register(hook(" ", "")).unwrap_err().to_string(), "name is required");
        assert_eq!(d.set_enabled("wh-99", true).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_secret_not_serialized() {
        let (d, _) = dispatcher();
        let mut input = hook("s", "");
        input.secret = Some("hidden".to_string());
        let wh = d.register(input).unwrap();
        let json = serde_json::to_string(&wh).unwrap();
        assert!(!json.contains("hidden"));
        assert!(json.contains("\"success_count\":0"));
    }

    #[tokio::test]
    async fn test_forward_events_from_log() {
        let (d, client) = dispatcher();
        d.register(hook("all", "")).unwrap();
        let log = EventLog::new(Arc::new(SystemClock));
        let sub = log.subscribe();

        log.append(EventInput::new("a", ""));
        log.append(EventInput::new("b", ""));
        assert!(log.unsubscribe(sub.id));

        assert_eq!(d.forward_events(sub).await, 2);
        assert_eq!(client.requests().len(), 2);
        let types: Vec<String> = d.deliveries(0).into_iter().map(|r| r.event_type).collect();
        assert_eq!(types, vec!["b", "a"]);
    }
}
