//! Compliance data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expiry::Expirable;
use crate::ids::prefix;
use crate::impl_entity;
use crate::severity::Severity;

/// One control in a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceControl {
    /// Control id, unique within the profile (e.g. `CIS-1.1.1`).
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Severity of a failure.
    pub severity: Severity,
}

/// Caller-supplied control.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlInput {
    /// Control id.
    pub id: String,
    /// Title; defaults to the id.
    #[serde(default)]
    pub title: String,
    /// `low`, `medium`, `high`, or `critical`; blank means medium.
    #[serde(default)]
    pub severity: String,
}

/// A named set of controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceProfile {
    /// Store-assigned id.
    pub id: String,
    /// Unique profile name.
    pub name: String,
    /// Framework label, e.g. `cis`.
    #[serde(default)]
    pub framework: String,
    /// Framework version label.
    #[serde(default)]
    pub version: String,
    /// Controls in declaration order.
    pub controls: Vec<ComplianceControl>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl_entity!(ComplianceProfile, prefix::COMPLIANCE_PROFILE);

/// Caller-supplied profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileInput {
    /// Unique name.
    pub name: String,
    /// Framework label.
    #[serde(default)]
    pub framework: String,
    /// Framework version.
    #[serde(default)]
    pub version: String,
    /// At least one control.
    #[serde(default)]
    pub controls: Vec<ControlInput>,
}

/// Status of one control against one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    /// Control satisfied.
    Pass,
    /// Control failed.
    Fail,
    /// Failure covered by an approved exception. Counts as passing.
    Waived,
}

impl FindingStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Waived => "waived",
        }
    }
}

/// Result of evaluating one control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceFinding {
    /// Evaluated control.
    pub control_id: String,
    /// Control title.
    pub title: String,
    /// Control severity.
    pub severity: Severity,
    /// Outcome.
    pub status: FindingStatus,
    /// Human-readable outcome.
    pub message: String,
    /// Evidence string recorded by the evaluator.
    pub evidence: String,
    /// Exception that waived the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_id: Option<String>,
}

/// Aggregate counts for a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Controls evaluated.
    pub total: usize,
    /// Passing controls.
    pub passed: usize,
    /// Failing controls.
    pub failed: usize,
    /// Waived controls.
    pub waived: usize,
    /// `(passed + waived) / total * 100`, two decimals.
    pub score_percent: f64,
}

impl ScanSummary {
    /// Tally findings.
    pub fn from_findings(findings: &[ComplianceFinding]) -> Self {
        let count = |s: FindingStatus| findings.iter().filter(|f| f.status == s).count();
        let (passed, failed, waived) = (
            count(FindingStatus::Pass),
            count(FindingStatus::Fail),
            count(FindingStatus::Waived),
        );
        let total = findings.len();
        let score_percent = if total == 0 {
            100.0
        } else {
            (((passed + waived) as f64 * 100.0 / total as f64) * 100.0).round() / 100.0
        };
        Self { total, passed, failed, waived, score_percent }
    }
}

/// A completed one-shot scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceScan {
    /// Store-assigned id.
    pub id: String,
    /// Scanned profile.
    pub profile_id: String,
    /// Profile name at scan time.
    pub profile_name: String,
    /// Target kind, e.g. `host`.
    pub target_kind: String,
    /// Target name.
    pub target_name: String,
    /// One finding per control.
    pub findings: Vec<ComplianceFinding>,
    /// Tallies.
    pub summary: ScanSummary,
    /// Scan time.
    pub created_at: DateTime<Utc>,
}

impl_entity!(ComplianceScan, prefix::COMPLIANCE_SCAN);

/// Scan request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanInput {
    /// Profile to evaluate.
    pub profile_id: String,
    /// Target kind.
    pub target_kind: String,
    /// Target name.
    pub target_name: String,
}

/// Lifecycle of a compliance exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionStatus {
    /// Awaiting a decision.
    Pending,
    /// Waives matching findings until `expires_at`.
    Approved,
    /// Declined.
    Rejected,
    /// Deadline passed.
    Expired,
}

/// A time-bounded waiver of one control on one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceException {
    /// Store-assigned id.
    pub id: String,
    /// Profile the control belongs to.
    pub profile_id: String,
    /// Waived control.
    pub control_id: String,
    /// Target kind.
    pub target_kind: String,
    /// Target name.
    pub target_name: String,
    /// Justification.
    pub reason: String,
    /// Requester.
    pub requested_by: String,
    /// Approver or rejecter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    /// Status.
    pub status: ExceptionStatus,
    /// Waiver lifetime once approved.
    pub ttl_seconds: i64,
    /// Reason given on rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Approval time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// Pending: decision deadline. Approved: waiver end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl_entity!(ComplianceException, prefix::COMPLIANCE_EXCEPTION);

impl ComplianceException {
    /// Whether this exception covers `(profile, control, kind, name)`.
    pub fn covers(&self, profile_id: &str, control_id: &str, kind: &str, name: &str) -> bool {
        self.profile_id == profile_id
            && self.control_id.eq_ignore_ascii_case(control_id)
            && self.target_kind == kind
            && self.target_name.eq_ignore_ascii_case(name)
    }
}

impl Expirable for ComplianceException {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    fn is_expirable(&self) -> bool {
        matches!(self.status, ExceptionStatus::Pending | ExceptionStatus::Approved)
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        self.status = ExceptionStatus::Expired;
        self.updated_at = now;
    }
}

/// Exception request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExceptionInput {
    /// Profile id.
    pub profile_id: String,
    /// Control id within the profile.
    pub control_id: String,
    /// Target kind.
    pub target_kind: String,
    /// Target name.
    pub target_name: String,
    /// Justification.
    pub reason: String,
    /// Requester.
    pub requested_by: String,
    /// 0 means the default (7 days).
    #[serde(default)]
    pub ttl_seconds: i64,
}

/// A scheduled recurring scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousConfig {
    /// Store-assigned id.
    pub id: String,
    /// Profile to scan.
    pub profile_id: String,
    /// Target kind.
    pub target_kind: String,
    /// Target name.
    pub target_name: String,
    /// Seconds between scans.
    pub interval_seconds: i64,
    /// Disabled configs are never due.
    pub enabled: bool,
    /// Most recent scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_id: Option<String>,
    /// Most recent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl_entity!(ContinuousConfig, prefix::COMPLIANCE_CONTINUOUS);

/// Continuous scan definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinuousInput {
    /// Profile id.
    pub profile_id: String,
    /// Target kind.
    pub target_kind: String,
    /// Target name.
    pub target_name: String,
    /// 0 means 300.
    #[serde(default)]
    pub interval_seconds: i64,
    /// Defaults to `true`.
    #[serde(default)]
    pub enabled: Option<bool>,
}
