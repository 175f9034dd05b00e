//! Multi-stage quorum approvals for break-glass access.
//!
//! ## State Machine
//!
//! ```text
//! pending ──approve*──▶ pending ──quorum met at final stage──▶ active ──expires_at past──▶ expired
//!    │                                                          │
//!    ├──reject──▶ rejected                                      │
//!    └──revoke──▶ revoked ◀──────────────revoke─────────────────┘
//! ```
//!
//! Terminal states are sinks. A request snapshots its policy's stages at
//! creation, so later policy edits never affect requests already in flight.
//!
//! ## Quorum Rules
//!
//! - An approval counts toward the request's current stage only.
//! - One `approve` per actor per stage (actor compared case-insensitively).
//! - Reaching `required_approvals` advances the stage; advancing past the last
//!   stage activates the grant for `ttl_seconds`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::expiry::{bounded_seconds, sweep, Expirable};
use crate::ids::prefix;
use crate::impl_entity;
use crate::store::{newest_first, EntityStore};
use crate::text::{normalize, normalize_key, require};

/// Default break-glass TTL in seconds.
pub const DEFAULT_TTL_SECONDS: i64 = 3600;
/// Minimum break-glass TTL in seconds.
pub const MIN_TTL_SECONDS: i64 = 300;
/// Maximum break-glass TTL in seconds.
pub const MAX_TTL_SECONDS: i64 = 86_400;

/// One ordered level of an approval policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStage {
    /// Stage name.
    pub name: String,
    /// Distinct approvers needed before the stage is met (≥ 1).
    pub required_approvals: u32,
}

/// Caller-supplied stage definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalStageInput {
    /// Stage name; blank names become `stage-<i>` (1-based).
    #[serde(default)]
    pub name: String,
    /// Values ≤ 0 are clamped to 1.
    #[serde(default)]
    pub required_approvals: i64,
}

/// A named, ordered list of approval stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Store-assigned id (`approval-policy-N`).
    pub id: String,
    /// Unique policy name.
    pub name: String,
    /// Stages in approval order.
    pub stages: Vec<ApprovalStage>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl_entity!(ApprovalPolicy, prefix::APPROVAL_POLICY);

/// Input for creating or updating an approval policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalPolicyInput {
    /// Policy name.
    pub name: String,
    /// At least one stage.
    #[serde(default)]
    pub stages: Vec<ApprovalStageInput>,
}

impl ApprovalPolicyInput {
    fn normalize(&self) -> Result<(String, Vec<ApprovalStage>)> {
        let name = require(&self.name, "name")?;
        if self.stages.is_empty() {
            return Err(Error::validation("at least one approval stage is required"));
        }
        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                let name = normalize(&stage.name);
                ApprovalStage {
                    name: if name.is_empty() { format!("stage-{}", i + 1) } else { name },
                    required_approvals: stage.required_approvals.clamp(1, i64::from(u32::MAX)) as u32,
                }
            })
            .collect();
        Ok((name, stages))
    }
}

/// Lifecycle state of a break-glass request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakGlassStatus {
    /// Collecting approvals.
    Pending,
    /// Quorum met; access granted until `expires_at`.
    Active,
    /// Rejected by an approver.
    Rejected,
    /// Revoked before or after activation.
    Revoked,
    /// TTL elapsed after activation.
    Expired,
}

impl BreakGlassStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Revoked | Self::Expired)
    }
}

/// Decision recorded in the approval trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Counts toward the stage quorum.
    Approve,
    /// Ends the request as rejected.
    Reject,
    /// Ends the request as revoked.
    Revoke,
}

/// One entry in a request's append-only approval trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Actor who made the decision.
    pub actor: String,
    /// The decision.
    pub decision: Decision,
    /// Free-form comment.
    pub comment: String,
    /// Stage the decision applied to (0-based).
    pub stage_index: usize,
    /// Name of that stage.
    pub stage_name: String,
    /// When the decision was recorded.
    pub created_at: DateTime<Utc>,
}

/// A time-bound, quorum-approved request for elevated access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakGlassRequest {
    /// Store-assigned id (`breakglass-N`).
    pub id: String,
    /// Who asked for access.
    pub requested_by: String,
    /// Why access is needed.
    pub reason: String,
    /// What the access covers.
    pub scope: String,
    /// Policy the stages were taken from (empty for the implicit default).
    pub policy_id: String,
    /// Name of that policy at creation.
    pub policy_name: String,
    /// Stage snapshot, immutable after creation.
    pub stages: Vec<ApprovalStage>,
    /// Index of the stage collecting approvals; equals `stages.len()` once active.
    pub current_stage: usize,
    /// Lifecycle state.
    pub status: BreakGlassStatus,
    /// Append-only decision trail.
    pub approvals: Vec<ApprovalRecord>,
    /// Grant duration once active.
    pub ttl_seconds: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When quorum was met.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    /// When the grant lapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// When the request was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    /// When the request was revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Trimmed rejection comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl BreakGlassRequest {
    /// Approve records made at `stage_index`.
    pub fn approvals_at(&self, stage_index: usize) -> usize {
        self.approvals
            .iter()
            .filter(|a| a.decision == Decision::Approve && a.stage_index == stage_index)
            .count()
    }

    fn stage_name(&self, index: usize) -> String {
        self.stages.get(index).map(|s| s.name.clone()).unwrap_or_default()
    }

    fn record(&mut self, actor: &str, decision: Decision, comment: &str, now: DateTime<Utc>) {
        let stage_index = self.current_stage.min(self.stages.len().saturating_sub(1));
        self.approvals.push(ApprovalRecord {
            actor: actor.to_string(),
            decision,
            comment: normalize(comment),
            stage_index,
            stage_name: self.stage_name(stage_index),
            created_at: now,
        });
    }
}

impl_entity!(BreakGlassRequest, prefix::BREAKGLASS);

impl Expirable for BreakGlassRequest {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    fn is_expirable(&self) -> bool {
        self.status == BreakGlassStatus::Active
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        tracing::info!(request_id = %self.id, "break-glass grant expired");
        self.status = BreakGlassStatus::Expired;
        self.updated_at = now;
    }
}

/// Input for opening a break-glass request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakGlassInput {
    /// Who asks for access.
    pub requested_by: String,
    /// Why access is needed.
    pub reason: String,
    /// Access scope; defaults to `global`.
    #[serde(default)]
    pub scope: String,
    /// Policy to snapshot; empty selects a single one-approval stage.
    #[serde(default)]
    pub policy_id: String,
    /// 0 selects the default of 3600.
    #[serde(default)]
    pub ttl_seconds: i64,
}

/// Approval policies and the break-glass requests governed by them.
#[derive(Debug)]
pub struct ApprovalStore {
    policies: EntityStore<ApprovalPolicy>,
    requests: EntityStore<BreakGlassRequest>,
    clock: Arc<dyn Clock>,
}

impl ApprovalStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            policies: EntityStore::new(),
            requests: EntityStore::new(),
            clock,
        }
    }

    /// Create an approval policy. Names are unique case-insensitively.
    pub fn create_policy(&self, input: ApprovalPolicyInput) -> Result<ApprovalPolicy> {
        let (name, stages) = input.normalize()?;
        let now = self.clock.now();
        self.policies.write(|table| {
            let key = normalize_key(&name);
            if table.find(|p| normalize_key(&p.name) == key).is_some() {
                return Err(Error::conflict(format!("approval policy {name:?} already exists")));
            }
            let policy = table.insert_new(ApprovalPolicy {
                id: String::new(),
                name,
                stages,
                created_at: now,
                updated_at: now,
            });
            tracing::info!(policy_id = %policy.id, stages = policy.stages.len(), "approval policy created");
            Ok(policy)
        })
    }

    /// Replace a policy's name and stages. In-flight requests keep their snapshot.
    pub fn update_policy(&self, id: &str, input: ApprovalPolicyInput) -> Result<ApprovalPolicy> {
        let (name, stages) = input.normalize()?;
        let now = self.clock.now();
        self.policies.write(|table| {
            let key = normalize_key(&name);
            if table
                .find(|p| normalize_key(&p.name) == key && p.id != id.trim())
                .is_some()
            {
                return Err(Error::conflict(format!("approval policy {name:?} already exists")));
            }
            let policy = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("approval policy not found"))?;
            policy.name = name;
            policy.stages = stages;
            policy.updated_at = now;
            Ok(policy.clone())
        })
    }

    /// Look up a policy.
    pub fn get_policy(&self, id: &str) -> Option<ApprovalPolicy> {
        self.policies.get(id)
    }

    /// All policies sorted by name.
    pub fn list_policies(&self) -> Vec<ApprovalPolicy> {
        self.policies
            .list_sorted_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)))
    }

    /// Delete a policy. Requests created from it are unaffected.
    pub fn delete_policy(&self, id: &str) -> bool {
        self.policies.delete(id)
    }

    /// Open a break-glass request in `pending`.
    pub fn create_request(&self, input: BreakGlassInput) -> Result<BreakGlassRequest> {
        let requested_by = require(&input.requested_by, "requested_by")?;
        let reason = require(&input.reason, "reason")?;
        let ttl_seconds = bounded_seconds(
            input.ttl_seconds,
            DEFAULT_TTL_SECONDS,
            MIN_TTL_SECONDS,
            MAX_TTL_SECONDS,
            "ttl_seconds",
        )?;
        let scope = match normalize(&input.scope) {
            s if s.is_empty() => "global".to_string(),
            s => s,
        };

        let policy_id = normalize(&input.policy_id);
        let (policy_name, stages) = if policy_id.is_empty() {
            (
                "default".to_string(),
                vec![ApprovalStage { name: "default".to_string(), required_approvals: 1 }],
            )
        } else {
            let policy = self
                .policies
                .get(&policy_id)
                .ok_or_else(|| Error::not_found("approval policy not found"))?;
            (policy.name, policy.stages)
        };

        let now = self.clock.now();
        let request = self.requests.create(BreakGlassRequest {
            id: String::new(),
            requested_by,
            reason,
            scope,
            policy_id,
            policy_name,
            stages,
            current_stage: 0,
            status: BreakGlassStatus::Pending,
            approvals: Vec::new(),
            ttl_seconds,
            created_at: now,
            updated_at: now,
            activated_at: None,
            expires_at: None,
            rejected_at: None,
            revoked_at: None,
            rejection_reason: None,
        });
        tracing::info!(
            request_id = %request.id,
            requested_by = %request.requested_by,
            stages = request.stages.len(),
            "break-glass request opened"
        );
        Ok(request)
    }

    /// Look up a request, expiring it first if due.
    pub fn get_request(&self, id: &str) -> Option<BreakGlassRequest> {
        let now = self.clock.now();
        self.requests.write(|table| {
            sweep(table.values_mut(), now);
            table.get(id).cloned()
        })
    }

    /// All requests, newest first, after an expiry sweep.
    pub fn list_requests(&self) -> Vec<BreakGlassRequest> {
        let now = self.clock.now();
        let mut items: Vec<BreakGlassRequest> = self.requests.write(|table| {
            sweep(table.values_mut(), now);
            table.values().cloned().collect()
        });
        items.sort_by(newest_first);
        items
    }

    /// Record an approval at the current stage and advance on quorum.
    pub fn approve(&self, id: &str, actor: &str, comment: &str) -> Result<BreakGlassRequest> {
        let actor = require(actor, "actor")?;
        let now = self.clock.now();
        self.requests.write(|table| {
            sweep(table.values_mut(), now);
            let request = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("break-glass request not found"))?;
            if request.status != BreakGlassStatus::Pending {
                return Err(Error::conflict("break-glass request is not pending approval"));
            }
            let stage = request.current_stage;
            let Some(required) = request.stages.get(stage).map(|s| s.required_approvals) else {
                return Err(Error::conflict("break-glass request has no pending stage"));
            };
            let actor_key = actor.to_lowercase();
            let duplicate = request.approvals.iter().any(|a| {
                a.decision == Decision::Approve
                    && a.stage_index == stage
                    && a.actor.to_lowercase() == actor_key
            });
            if duplicate {
                return Err(Error::conflict("actor has already approved current stage"));
            }

            request.record(&actor, Decision::Approve, comment, now);
            if request.approvals_at(stage) >= required as usize {
                request.current_stage += 1;
                tracing::info!(request_id = %request.id, stage, "approval stage met");
                if request.current_stage == request.stages.len() {
                    request.status = BreakGlassStatus::Active;
                    request.activated_at = Some(now);
                    request.expires_at = Some(now + Duration::seconds(request.ttl_seconds));
                    tracing::info!(
                        request_id = %request.id,
                        ttl_seconds = request.ttl_seconds,
                        "break-glass request activated"
                    );
                }
            }
            request.updated_at = now;
            Ok(request.clone())
        })
    }

    /// Reject a pending request.
    pub fn reject(&self, id: &str, actor: &str, comment: &str) -> Result<BreakGlassRequest> {
        let actor = require(actor, "actor")?;
        let now = self.clock.now();
        self.requests.write(|table| {
            sweep(table.values_mut(), now);
            let request = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("break-glass request not found"))?;
            if request.status != BreakGlassStatus::Pending {
                return Err(Error::conflict("break-glass request is not pending approval"));
            }
            request.record(&actor, Decision::Reject, comment, now);
            request.status = BreakGlassStatus::Rejected;
            request.rejected_at = Some(now);
            request.rejection_reason = Some(normalize(comment));
            request.updated_at = now;
            tracing::info!(request_id = %request.id, actor = %actor, "break-glass request rejected");
            Ok(request.clone())
        })
    }

    /// Revoke a pending or active request.
    pub fn revoke(&self, id: &str, actor: &str, comment: &str) -> Result<BreakGlassRequest> {
        let actor = require(actor, "actor")?;
        let now = self.clock.now();
        self.requests.write(|table| {
            sweep(table.values_mut(), now);
            let request = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("break-glass request not found"))?;
            if !matches!(request.status, BreakGlassStatus::Pending | BreakGlassStatus::Active) {
                return Err(Error::conflict("break-glass request is not pending or active"));
            }
            request.record(&actor, Decision::Revoke, comment, now);
            request.status = BreakGlassStatus::Revoked;
            request.revoked_at = Some(now);
            request.updated_at = now;
            tracing::info!(request_id = %request.id, actor = %actor, "break-glass request revoked");
            Ok(request.clone())
        })
    }
}
