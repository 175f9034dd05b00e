//! Alert routing to webhook, Slack, and PagerDuty targets.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::delivery::{
    attempt, signed, DeliveryCounters, DeliveryHistory, DeliveryRecord, DeliveryStatus,
    ALERT_ROUTE_HEADER, DEFAULT_HISTORY_CAPACITY, NOTIFICATION_KIND_HEADER,
};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::http::{validate_url, HttpClient, HttpRequest};
use crate::ids::{prefix, IdAllocator};
use crate::impl_entity;
use crate::severity::Severity;
use crate::store::{id_sequence, EntityStore};
use crate::text::{normalize, normalize_key, normalize_optional, require};

/// Route value that matches every alert.
pub const WILDCARD_ROUTE: &str = "*";

/// Kind of notification endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Generic JSON webhook.
    Webhook,
    /// Slack incoming webhook.
    Slack,
    /// PagerDuty events endpoint.
    Pagerduty,
}

impl NotificationKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Slack => "slack",
            Self::Pagerduty => "pagerduty",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_key(s).as_str() {
            "webhook" => Ok(Self::Webhook),
            "slack" => Ok(Self::Slack),
            "pagerduty" => Ok(Self::Pagerduty),
            _ => Err(Error::validation("kind must be webhook, slack, or pagerduty")),
        }
    }
}

/// A notification endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTarget {
    /// Store-assigned id (`notify-N`).
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Endpoint kind.
    pub kind: NotificationKind,
    /// Endpoint URL.
    pub url: String,
    /// Alert route, or `*` for all routes.
    pub route: String,
    /// Disabled targets receive nothing.
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

impl_entity!(NotificationTarget, prefix::NOTIFY_TARGET);

impl NotificationTarget {
    /// Whether this target takes alerts on `route`.
    pub fn accepts(&self, route: &str) -> bool {
        self.enabled && (self.route == WILDCARD_ROUTE || self.route == route)
    }
}

/// Caller-supplied target definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationTargetInput {
    /// Unique name.
    pub name: String,
    /// `webhook`, `slack`, or `pagerduty`.
    pub kind: String,
    /// Endpoint URL.
    pub url: String,
    /// Route; blank means `*`.
    #[serde(default)]
    pub route: String,
    /// Defaults to `true`.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Optional HMAC secret.
    #[serde(default)]
    pub secret: Option<String>,
}

/// An alert to route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertInput {
    /// Caller identity; generated when blank.
    #[serde(default)]
    pub id: Option<String>,
    /// Route name.
    pub route: String,
    /// Severity; blank means medium.
    #[serde(default)]
    pub severity: String,
    /// One-line summary.
    pub summary: String,
    /// Free-form details.
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// The normalized alert envelope sent to targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert identity.
    pub id: String,
    /// Lowercased route.
    pub route: String,
    /// Severity.
    pub severity: Severity,
    /// One-line summary.
    pub summary: String,
    /// Free-form details.
    #[serde(default)]
    pub details: Map<String, Value>,
    /// Time the alert was routed.
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    fn body_for(&self, kind: NotificationKind) -> std::result::Result<Vec<u8>, serde_json::Error> {
        match kind {
            NotificationKind::Slack => serde_json::to_vec(&json!({
                "text": format!("[{}] {}: {}", self.severity, self.route, self.summary),
            })),
            NotificationKind::Webhook | NotificationKind::Pagerduty => serde_json::to_vec(self),
        }
    }
}

/// One notification delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDelivery {
    /// History-assigned id (`notify-del-N`).
    pub id: String,
    /// Target that was called.
    pub target_id: String,
    /// Alert identity.
    pub alert_id: String,
    /// Alert route.
    pub route: String,
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

impl DeliveryRecord for NotificationDelivery {
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Result of routing one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDispatch {
    /// The normalized alert.
    pub alert: Alert,
    /// One record per matching target.
    pub deliveries: Vec<NotificationDelivery>,
}

/// Notification target registry plus alert router.
#[derive(Debug)]
pub struct NotificationRouter {
    targets: EntityStore<NotificationTarget>,
    deliveries: DeliveryHistory<NotificationDelivery>,
    alert_ids: Mutex<IdAllocator>,
    client: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
}

impl NotificationRouter {
    /// Router with the default delivery history size.
    pub fn new(client: Arc<dyn HttpClient>, clock: Arc<dyn Clock>) -> Self {
        Self::with_history(DEFAULT_HISTORY_CAPACITY, client, clock)
    }

    /// Router keeping at most `history` delivery records.
    pub fn with_history(history: usize, client: Arc<dyn HttpClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            targets: EntityStore::new(),
            deliveries: DeliveryHistory::new(prefix::NOTIFY_DELIVERY, history),
            alert_ids: Mutex::new(IdAllocator::new("alert")),
            client,
            clock,
        }
    }

    /// Register a target, or update the one with the same name.
    pub fn upsert_target(&self, input: NotificationTargetInput) -> Result<NotificationTarget> {
        let name = require(&input.name, "name")?;
        let kind: NotificationKind = input.kind.parse()?;
        let url = validate_url(&input.url)?;
        let route = match normalize_key(&input.route) {
            r if r.is_empty() => WILDCARD_ROUTE.to_string(),
            r => r,
        };
        let enabled = input.enabled.unwrap_or(true);
        let secret = normalize_optional(input.secret.as_deref());
        let now = self.clock.now();

        self.targets.write(|table| {
            let key = normalize_key(&name);
            if let Some(existing) = table.values_mut().find(|t| normalize_key(&t.name) == key) {
                existing.name = name;
                existing.kind = kind;
                existing.url = url;
                existing.route = route;
                existing.enabled = enabled;
                existing.secret = secret;
                existing.updated_at = now;
                return Ok(existing.clone());
            }
            let created = table.insert_new(NotificationTarget {
                id: String::new(),
                name,
                kind,
                url,
                route,
                enabled,
                secret,
                counters: DeliveryCounters::default(),
                created_at: now,
                updated_at: now,
            });
            tracing::info!(target_id = %created.id, kind = %created.kind, route = %created.route, "notification target registered");
            Ok(created)
        })
    }

    /// Look up a target.
    pub fn get_target(&self, id: &str) -> Option<NotificationTarget> {
        self.targets.get(id)
    }

    /// All targets, newest first.
    pub fn list_targets(&self) -> Vec<NotificationTarget> {
        self.targets.list()
    }

    /// Remove a target.
    pub fn delete_target(&self, id: &str) -> bool {
        self.targets.delete(id)
    }

    /// Enable or disable a target.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<NotificationTarget> {
        let now = self.clock.now();
        self.targets.write(|table| {
            let target = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("notification target not found"))?;
            target.enabled = enabled;
            target.updated_at = now;
            Ok(target.clone())
        })
    }

    /// Deliver an alert to every enabled target on its route (or `*`).
    pub async fn notify_alert(&self, input: AlertInput) -> Result<AlertDispatch> {
        let route = normalize_key(&input.route);
        if route.is_empty() {
            return Err(Error::validation("route is required"));
        }
        let summary = require(&input.summary, "summary")?;
        let severity = Severity::parse_or_default(&input.severity)?;
        let id = match normalize_optional(input.id.as_deref()) {
            Some(id) => id,
            None => self.alert_ids.lock().next_id(),
        };
        let alert = Alert {
            id,
            route,
            severity,
            summary,
            details: input.details,
            raised_at: self.clock.now(),
        };

        let mut targets: Vec<NotificationTarget> = self.targets.read(|table| {
            table.values().filter(|t| t.accepts(&alert.route)).cloned().collect()
        });
        targets.sort_by_key(|t| id_sequence(&t.id));

        let mut deliveries = Vec::with_capacity(targets.len());
        for target in targets {
            let body = alert.body_for(target.kind)?;
            let request = HttpRequest::post_json(target.url.as_str(), body)
                .with_header(NOTIFICATION_KIND_HEADER, target.kind.as_str())
                .with_header(ALERT_ROUTE_HEADER, alert.route.as_str());
            let request = signed(request, target.secret.as_deref());
            let outcome = attempt(self.client.as_ref(), request).await;

            let now = self.clock.now();
            self.targets.write(|table| {
                if let Some(t) = table.get_mut(&target.id) {
                    t.counters.record(&outcome, now);
                    t.updated_at = now;
                }
            });
            deliveries.push(self.deliveries.push(NotificationDelivery {
                id: String::new(),
                target_id: target.id,
                alert_id: alert.id.clone(),
                route: alert.route.clone(),
                status: outcome.status,
                status_code: outcome.status_code,
                error: outcome.error,
                delivered_at: now,
            }));
        }
        tracing::info!(
            alert_id = %alert.id,
            route = %alert.route,
            severity = %alert.severity,
            targets = deliveries.len(),
            "alert routed"
        );
        Ok(AlertDispatch { alert, deliveries })
    }

    /// Up to `limit` deliveries, newest first. `0` returns all.
    pub fn deliveries(&self, limit: usize) -> Vec<NotificationDelivery> {
        self.deliveries.recent(limit)
    }
}

impl NotificationTargetInput {
    /// Convenience constructor.
    pub fn new(name: &str, kind: &str, url: &str, route: &str) -> Self {
        Self {
            name: normalize(name),
            kind: kind.to_string(),
            url: url.to_string(),
            route: route.to_string(),
            enabled: None,
            secret: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::dispatch::delivery::SIGNATURE_HEADER;
    use crate::error::ErrorKind;
    use crate::http::RecordingClient;

    fn router() -> (NotificationRouter, Arc<RecordingClient>) {
        let client = Arc::new(RecordingClient::new());
        (NotificationRouter::new(client.clone(), Arc::new(SystemClock)), client)
    }

    fn alert(route: &str) -> AlertInput {
        AlertInput {
            route: route.to_string(),
            severity: "critical".to_string(),
            summary: "disk full".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_route_matching() {
        let (r, client) = router();
        r.upsert_target(NotificationTargetInput::new("db-team", "webhook", "https://db.example.com/h", "db")).unwrap();
        r.upsert_target(NotificationTargetInput::new("catch-all", "pagerduty", "https://pd.example.com/e", "")).unwrap();
        r.upsert_target(NotificationTargetInput::new("web-team", "webhook", "https://web.example.com/h", "web")).unwrap();

        let out = r.notify_alert(alert("DB")).await.unwrap();
        assert_eq!(out.deliveries.len(), 2);
        assert_eq!(out.alert.id, "alert-1");
        assert!(out.deliveries.iter().all(|d| d.status == DeliveryStatus::Delivered));

        let urls: Vec<String> = client.requests().into_iter().map(|q| q.url).collect();
        assert_eq!(urls, vec!["https://db.example.com/h", "https://pd.example.com/e"]);
        assert_eq!(r.deliveries(0)[0].id, "notify-del-2");
    }

    #[tokio::test]
    async fn test_headers_and_slack_body() {
        let (r, client) = router();
        let mut input = NotificationTargetInput::new("chat", "slack", "https://hooks.slack.test/x", "*");
        input.secret = Some("k".to_string());
        r.upsert_target(input).unwrap();

        r.notify_alert(alert("web")).await.unwrap();
        let req = &client.requests()[0];
        assert_eq!(req.header(NOTIFICATION_KIND_HEADER), Some("slack"));
        assert_eq!(req.header(ALERT_ROUTE_HEADER), Some("web"));
        assert!(req.header(SIGNATURE_HEADER).is_some());

        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body, json!({"text": "[critical] web: disk full"}));
    }

    #[tokio::test]
    async fn test_disabled_and_failed_targets() {
        let (r, client) = router();
        client.respond("https://down.example.com", 0, "");
        let down = r.upsert_target(NotificationTargetInput::new("down", "webhook", "https://down.example.com", "*")).unwrap();
        let off = r.upsert_target(NotificationTargetInput::new("off", "webhook", "https://off.example.com", "*")).unwrap();
        r.set_enabled(&off.id, false).unwrap();

        let out = r.notify_alert(alert("x")).await.unwrap();
        assert_eq!(out.deliveries.len(), 1);
        assert_eq!(out.deliveries[0].status, DeliveryStatus::Failed);
        assert_eq!(r.get_target(&down.id).unwrap().counters.failure_count, 1);
    }

    #[tokio::test]
    async fn test_alert_validation() {
        let (r, _) = router();
        assert_eq!(r.notify_alert(alert(" ")).await.unwrap_err().kind(), ErrorKind::Validation);
        let mut bad = alert("x");
        bad.severity = "apocalyptic".to_string();
        assert!(r.notify_alert(bad).await.is_err());

        let mut named = alert("x");
        named.id = Some("inc-7".to_string());
        assert_eq!(r.notify_alert(named).await.unwrap().alert.id, "inc-7");
    }

    #[test]
    fn test_target_validation_and_upsert() {
        let (r, _) = router();
        assert!(r.upsert_target(NotificationTargetInput::new("x", "email", "https://a.b", "*")).is_err());
        assert!(r.upsert_target(NotificationTargetInput::new("x", "slack", "mailto:a@b", "*")).is_err());

        let a = r.upsert_target(NotificationTargetInput::new("ops", "slack", "https://a.b", "db")).unwrap();
        let b = r.upsert_target(NotificationTargetInput::new("OPS", "webhook", "https://c.d", "*")).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.kind, NotificationKind::Webhook);
        assert_eq!(r.list_targets().len(), 1);
        assert!(r.delete_target(&a.id));
        assert!(r.get_target(&a.id).is_none());
    }
}
