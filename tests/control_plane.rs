//! End-to-end flows through a [`ControlPlane`] wired to a manual clock and a
//! recording HTTP client.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use masterchef_control::access::LeaseInput;
use masterchef_control::agents::CheckinInput;
use masterchef_control::approvals::{ApprovalPolicyInput, ApprovalStageInput, BreakGlassInput};
use masterchef_control::commands::CommandInput;
use masterchef_control::dispatch::{DeliveryStatus, WebhookInput};
use masterchef_control::events::chain::verify_chain;
use masterchef_control::events::compute_hash;
use masterchef_control::syndic::SyndicNodeInput;
use masterchef_control::tenant_keys::{BoundaryCheck, BoundaryReason};
use masterchef_control::variables::NamedSource;
use masterchef_control::{
    resolve, BreakGlassStatus, ControlPlane, ControlPlaneConfig, ErrorKind, EventInput,
    ManualClock, MergeStrategy, RecordingClient, ResolveRequest, VariableLayer,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    plane: ControlPlane,
    clock: Arc<ManualClock>,
    client: Arc<RecordingClient>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let client = Arc::new(RecordingClient::new());
    let plane = ControlPlane::with_parts(
        ControlPlaneConfig::default(),
        clock.clone(),
        client.clone(),
        client.clone(),
    )
    .unwrap();
    Harness { plane, clock, client }
}

fn stage(name: &str, required: i64) -> ApprovalStageInput {
    ApprovalStageInput { name: name.to_string(), required_approvals: required }
}

fn node(name: &str, role: &str, parent: Option<&str>) -> SyndicNodeInput {
    SyndicNodeInput {
        name: name.to_string(),
        parent: parent.map(str::to_string),
        role: role.to_string(),
        ..Default::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Approvals
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_approval_quorum_across_stages() {
    let h = harness();
    let approvals = &h.plane.approvals;
    let policy = approvals
        .create_policy(ApprovalPolicyInput {
            name: "prod-access".to_string(),
            stages: vec![stage("lead", 1), stage("director", 2)],
        })
        .unwrap();
    let request = approvals
        .create_request(BreakGlassInput {
            requested_by: "oncall".to_string(),
            reason: "database failover".to_string(),
            policy_id: policy.id.clone(),
            ttl_seconds: 1800,
            ..Default::default()
        })
        .unwrap();

    let r = approvals.approve(&request.id, "alice", "").unwrap();
    assert_eq!(r.status, BreakGlassStatus::Pending);
    assert_eq!(r.current_stage, 1);

    let r = approvals.approve(&request.id, "bob", "").unwrap();
    assert_eq!(r.status, BreakGlassStatus::Pending);

    let err = approvals.approve(&request.id, "bob", "again").unwrap_err();
    assert_eq!(err.to_string(), "actor has already approved current stage");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.clock.advance_secs(60);
    let r = approvals.approve(&request.id, "carol", "").unwrap();
    assert_eq!(r.status, BreakGlassStatus::Active);
    let (activated, expires) = (r.activated_at.unwrap(), r.expires_at.unwrap());
    assert_eq!((expires - activated).num_seconds(), 1800);
}

#[test]
fn test_break_glass_grant_lapses_with_the_clock() {
    let h = harness();
    let request = h
        .plane
        .approvals
        .create_request(BreakGlassInput {
            requested_by: "oncall".to_string(),
            reason: "hotfix".to_string(),
            ttl_seconds: 300,
            ..Default::default()
        })
        .unwrap();
    h.plane.approvals.approve(&request.id, "lead", "ok").unwrap();

    h.clock.advance_secs(299);
    assert_eq!(h.plane.approvals.get_request(&request.id).unwrap().status, BreakGlassStatus::Active);
    h.clock.advance_secs(1);
    assert_eq!(h.plane.approvals.get_request(&request.id).unwrap().status, BreakGlassStatus::Expired);
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Log
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_event_integrity_and_tamper_detection() {
    let h = harness();
    for event_type in ["t.a", "t.b", "t.c"] {
        h.plane.events.append(EventInput::new(event_type, "m"));
    }

    let report = h.plane.events.verify_integrity();
    assert!(report.valid);
    assert_eq!(report.checked, 3);
    let mut events = h.plane.events.list();
    assert_eq!(report.last_hash, compute_hash(&events[2]));

    events[1].message = "tampered".to_string();
    let report = verify_chain(events.iter(), 1, "");
    assert!(!report.valid);
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].index, 2);
    assert_eq!(report.violations[0].reason, "hash mismatch");
}

#[test]
fn test_event_replace_reseals_a_fresh_chain() {
    let h = harness();
    for event_type in ["t.a", "t.b"] {
        h.plane.events.append(EventInput::new(event_type, "m"));
    }
    let mut events = h.plane.events.list();
    events[0].message = "edited".to_string();

    assert_eq!(h.plane.events.replace(events), 2);
    let report = h.plane.events.verify_integrity();
    assert!(report.valid);
    assert_eq!(h.plane.events.list()[0].message, "edited");
}

// ─────────────────────────────────────────────────────────────────────────────
// Variables
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_merge_last_with_lookup() {
    let resolution = resolve(&ResolveRequest {
        layers: vec![
            VariableLayer::new("base", json!({"service": {"replicas": 2}, "region": "us-east-1"})),
            VariableLayer::new("prod", json!({"service": {"replicas": 5}})),
        ],
        strategy: MergeStrategy::MergeLast,
        lookup: Some("service.replicas".to_string()),
        default: None,
    });
    assert!(resolution.found);
    assert_eq!(resolution.value, Some(json!(5)));
    assert_eq!(resolution.merged["region"], json!("us-east-1"));
}

#[tokio::test]
async fn test_sources_feed_the_resolver() {
    let h = harness();
    h.client.respond("https://vars.example.com/", 200, r#"{"service": {"replicas": 7}}"#);
    let layers = h
        .plane
        .sources
        .resolve_layers(&[
            serde_json::from_value::<NamedSource>(json!({
                "name": "inline",
                "type": "inline",
                "data": {"service": {"replicas": 2}, "region": "eu-west-1"}
            }))
            .unwrap(),
            serde_json::from_value::<NamedSource>(json!({
                "name": "remote",
                "type": "http",
                "url": "https://vars.example.com/prod.json"
            }))
            .unwrap(),
        ])
        .await
        .unwrap();

    let resolution = resolve(&ResolveRequest {
        layers,
        lookup: Some("service.replicas".to_string()),
        ..Default::default()
    });
    assert_eq!(resolution.value, Some(json!(7)));
    assert_eq!(resolution.merged["region"], json!("eu-west-1"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Topology
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_syndic_master_cannot_take_a_parent() {
    let h = harness();
    let syndic = &h.plane.syndic;
    syndic.upsert(node("m", "master", None)).unwrap();
    syndic.upsert(node("s", "syndic", Some("m"))).unwrap();
    syndic.upsert(node("edge-1", "minion", Some("s"))).unwrap();

    let err = syndic.upsert(node("m", "master", Some("s"))).unwrap_err();
    assert_eq!(err.to_string(), "parent is not allowed for master role");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let route = syndic.resolve_route("EDGE-1").unwrap();
    assert_eq!(route.path, vec!["m", "s", "edge-1"]);
    assert_eq!(route.hops, 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_agent_checkin_splay_is_stable() {
    let h = harness();
    let input = || CheckinInput {
        agent_id: "HostA".to_string(),
        max_splay_seconds: 60,
        ..Default::default()
    };

    let first = h.plane.agents.checkin(input()).unwrap();
    h.clock.advance_secs(310);
    let second = h.plane.agents.checkin(input()).unwrap();

    assert_eq!(first.applied_splay_sec, second.applied_splay_sec);
    assert_eq!(second.checkin_count, 2);
    assert_eq!(
        (second.next_checkin_at - second.last_checkin_at).num_seconds(),
        second.interval_seconds + second.applied_splay_sec
    );
    assert_eq!(second.interval_seconds, 300);
}

// ─────────────────────────────────────────────────────────────────────────────
// Webhooks
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_webhook_dispatch_filtering() {
    let h = harness();
    let webhook = h
        .plane
        .webhooks
        .register(WebhookInput {
            name: "pager".to_string(),
            url: "https://hooks.example.com/pager".to_string(),
            event_prefix: "external.".to_string(),
            ..Default::default()
        })
        .unwrap();

    let alert = h.plane.events.append(EventInput::new("external.alert", "disk full"));
    let deliveries = h.plane.webhooks.dispatch(&alert).await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);

    let info = h.plane.events.append(EventInput::new("internal.info", "tick"));
    assert!(h.plane.webhooks.dispatch(&info).await.is_empty());

    h.plane.webhooks.set_enabled(&webhook.id, false).unwrap();
    assert!(h.plane.webhooks.dispatch(&alert).await.is_empty());

    assert_eq!(h.client.requests().len(), 1);
    let stored = h.plane.webhooks.get(&webhook.id).unwrap();
    assert_eq!(stored.counters.success_count, 1);
}

#[tokio::test]
async fn test_webhook_failure_is_recorded_not_raised() {
    let h = harness();
    h.client.respond("https://down.example.com/", 0, "");
    h.plane
        .webhooks
        .register(WebhookInput {
            name: "down".to_string(),
            url: "https://down.example.com/hook".to_string(),
            ..Default::default()
        })
        .unwrap();

    let event = h.plane.events.append(EventInput::new("external.alert", "x"));
    let deliveries = h.plane.webhooks.dispatch(&event).await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
    assert!(deliveries[0].error.is_some());
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands, Tenants, Leases
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_command_retry_is_idempotent() {
    let h = harness();
    let input = CommandInput {
        action: "apply".to_string(),
        config_path: "sites/web.yaml".to_string(),
        idempotency_key: "deploy-42".to_string(),
        ..Default::default()
    };
    let first = h.plane.commands.submit(input.clone()).unwrap();
    let retry = h.plane.commands.submit(input.clone()).unwrap();
    assert_eq!(first.id, retry.id);
    assert!(retry.duplicate);

    let replay = h
        .plane
        .commands
        .submit(CommandInput { action: "rollback".to_string(), ..input })
        .unwrap();
    assert_eq!(replay.id, first.id);
    assert_eq!(replay.action.as_str(), "apply");
    assert_eq!(h.plane.commands.list().len(), 1);
}

#[test]
fn test_tenant_boundary_after_rotation() {
    let h = harness();
    let old = h.plane.tenant_keys.ensure_key("acme").unwrap();
    h.clock.advance_secs(1);
    let new = h.plane.tenant_keys.rotate("acme").unwrap();
    assert_eq!(new.version, old.version + 1);

    let check = |key_id: &str, context: &str| {
        h.plane.tenant_keys.check_boundary(&BoundaryCheck {
            request_tenant: "acme".to_string(),
            key_id: key_id.to_string(),
            context_tenant: context.to_string(),
        })
    };
    assert!(check(&new.id, "acme").allowed);
    assert_eq!(check(&old.id, "acme").reason, BoundaryReason::KeyNotActive);
    assert_eq!(check(&new.id, "globex").reason, BoundaryReason::TenantMismatchContext);
}

#[test]
fn test_run_lease_frees_after_expiry() {
    let h = harness();
    let input = |holder: &str| LeaseInput {
        run_id: "run-7".to_string(),
        holder: holder.to_string(),
        ttl_seconds: 60,
    };
    h.plane.leases.acquire(input("worker-a")).unwrap();
    assert_eq!(h.plane.leases.acquire(input("worker-b")).unwrap_err().kind(), ErrorKind::Conflict);

    h.clock.advance_secs(60);
    let lease = h.plane.leases.acquire(input("worker-b")).unwrap();
    assert_eq!(lease.holder, "worker-b");
}
