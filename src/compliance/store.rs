//! Compliance profiles, scans, exceptions, and continuous schedules.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::export::{export_scan, EvidenceExport, EvidenceFormat};
use super::model::*;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::expiry::{bounded_seconds, sweep};
use crate::severity::Severity;
use crate::store::{id_sequence, newest_first, EntityStore};
use crate::text::{normalize, normalize_key, require};

/// Default exception lifetime (7 days).
pub const DEFAULT_EXCEPTION_TTL_SECONDS: i64 = 604_800;
/// Minimum exception lifetime.
pub const MIN_EXCEPTION_TTL_SECONDS: i64 = 300;
/// Maximum exception lifetime (30 days).
pub const MAX_EXCEPTION_TTL_SECONDS: i64 = 2_592_000;
/// Default continuous-scan interval.
pub const DEFAULT_SCAN_INTERVAL_SECONDS: i64 = 300;
/// Minimum continuous-scan interval.
pub const MIN_SCAN_INTERVAL_SECONDS: i64 = 60;
/// Maximum continuous-scan interval.
pub const MAX_SCAN_INTERVAL_SECONDS: i64 = 86_400;

/// Deterministic control check.
///
/// The first byte of `sha256(control_id|kind|name)` modulo 5 equal to zero
/// fails the control; anything else passes. Returns the status and an
/// evidence string carrying the check digest.
pub fn evaluate_control(control_id: &str, target_kind: &str, target_name: &str) -> (FindingStatus, String) {
    let digest = Sha256::digest(format!("{control_id}|{target_kind}|{target_name}").as_bytes());
    let status = if digest[0] % 5 == 0 {
        FindingStatus::Fail
    } else {
        FindingStatus::Pass
    };
    let evidence = format!(
        "digest=sha256:{} target={target_kind}/{target_name}",
        hex::encode(&digest[..8])
    );
    (status, evidence)
}

fn normalize_target(kind: &str, name: &str) -> Result<(String, String)> {
    let kind = normalize_key(kind);
    if kind.is_empty() {
        return Err(Error::validation("target_kind is required"));
    }
    Ok((kind, require(name, "target_name")?))
}

/// Result of [`ComplianceStore::run_continuous_scan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousRun {
    /// Updated schedule.
    pub config: ContinuousConfig,
    /// Scan produced by this run.
    pub scan: ComplianceScan,
}

/// All compliance state for one control plane.
#[derive(Debug)]
pub struct ComplianceStore {
    profiles: EntityStore<ComplianceProfile>,
    scans: EntityStore<ComplianceScan>,
    exceptions: EntityStore<ComplianceException>,
    continuous: EntityStore<ContinuousConfig>,
    clock: Arc<dyn Clock>,
}

impl ComplianceStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            profiles: EntityStore::new(),
            scans: EntityStore::new(),
            exceptions: EntityStore::new(),
            continuous: EntityStore::new(),
            clock,
        }
    }

    // ----- profiles -----

    /// Create a profile. Names are unique case-insensitively.
    pub fn create_profile(&self, input: ProfileInput) -> Result<ComplianceProfile> {
        let name = require(&input.name, "name")?;
        if input.controls.is_empty() {
            return Err(Error::validation("at least one control is required"));
        }
        let mut controls: Vec<ComplianceControl> = Vec::with_capacity(input.controls.len());
        for control in input.controls {
            let id = require(&control.id, "control id")?;
            if controls.iter().any(|c| c.id.eq_ignore_ascii_case(&id)) {
                return Err(Error::validation(format!("duplicate control id {id:?}")));
            }
            let title = match normalize(&control.title) {
                t if t.is_empty() => id.clone(),
                t => t,
            };
            let severity = Severity::parse_or_default(&control.severity)?;
            controls.push(ComplianceControl { id, title, severity });
        }

        let now = self.clock.now();
        self.profiles.write(|table| {
            let key = normalize_key(&name);
            if table.find(|p| normalize_key(&p.name) == key).is_some() {
                return Err(Error::conflict(format!("compliance profile {name:?} already exists")));
            }
            let profile = table.insert_new(ComplianceProfile {
                id: String::new(),
                name,
                framework: normalize_key(&input.framework),
                version: normalize(&input.version),
                controls,
                created_at: now,
                updated_at: now,
            });
            tracing::info!(profile_id = %profile.id, controls = profile.controls.len(), "compliance profile created");
            Ok(profile)
        })
    }

    /// Look up a profile.
    pub fn get_profile(&self, id: &str) -> Option<ComplianceProfile> {
        self.profiles.get(id)
    }

    /// All profiles sorted by name.
    pub fn list_profiles(&self) -> Vec<ComplianceProfile> {
        self.profiles.list_sorted_by(|a, b| a.name.cmp(&b.name))
    }

    /// Delete a profile. Past scans are kept.
    pub fn delete_profile(&self, id: &str) -> bool {
        self.profiles.delete(id)
    }

    // ----- scans -----

    /// Evaluate every control of a profile against a target.
    ///
    /// Exceptions are swept for expiry before any is matched, so an
    /// exception past its deadline never waives a finding.
    pub fn run_scan(&self, input: ScanInput) -> Result<ComplianceScan> {
        let profile = self
            .profiles
            .get(&input.profile_id)
            .ok_or_else(|| Error::not_found("compliance profile not found"))?;
        let (target_kind, target_name) = normalize_target(&input.target_kind, &input.target_name)?;
        let now = self.clock.now();

        let mut findings: Vec<ComplianceFinding> = profile
            .controls
            .iter()
            .map(|control| {
                let (status, evidence) = evaluate_control(&control.id, &target_kind, &target_name);
                let message = match status {
                    FindingStatus::Fail => format!("{} failed on {target_kind}/{target_name}", control.id),
                    _ => format!("{} passed on {target_kind}/{target_name}", control.id),
                };
                ComplianceFinding {
                    control_id: control.id.clone(),
                    title: control.title.clone(),
                    severity: control.severity,
                    status,
                    message,
                    evidence,
                    exception_id: None,
                }
            })
            .collect();

        self.exceptions.write(|table| {
            sweep(table.values_mut(), now);
            for finding in findings.iter_mut().filter(|f| f.status == FindingStatus::Fail) {
                let waiver = table.values().find(|e| {
                    e.status == ExceptionStatus::Approved
                        && e.covers(&profile.id, &finding.control_id, &target_kind, &target_name)
                });
                if let Some(exception) = waiver {
                    finding.status = FindingStatus::Waived;
                    finding.message = format!("{} waived by {}", finding.control_id, exception.id);
                    finding.exception_id = Some(exception.id.clone());
                }
            }
        });

        let summary = ScanSummary::from_findings(&findings);
        let scan = self.scans.create(ComplianceScan {
            id: String::new(),
            profile_id: profile.id,
            profile_name: profile.name,
            target_kind,
            target_name,
            findings,
            summary,
            created_at: now,
        });
        tracing::info!(
            scan_id = %scan.id,
            profile_id = %scan.profile_id,
            failed = scan.summary.failed,
            waived = scan.summary.waived,
            score = scan.summary.score_percent,
            "compliance scan completed"
        );
        Ok(scan)
    }

    /// Look up a scan.
    pub fn get_scan(&self, id: &str) -> Option<ComplianceScan> {
        self.scans.get(id)
    }

    /// Scans, newest first, optionally restricted to one profile.
    pub fn list_scans(&self, profile_id: Option<&str>) -> Vec<ComplianceScan> {
        let mut scans = self.scans.list();
        if let Some(profile_id) = profile_id.map(str::trim).filter(|p| !p.is_empty()) {
            scans.retain(|s| s.profile_id == profile_id);
        }
        scans
    }

    /// Render a scan's findings for auditors.
    pub fn export_evidence(&self, scan_id: &str, format: EvidenceFormat) -> Result<EvidenceExport> {
        let scan = self
            .scans
            .get(scan_id)
            .ok_or_else(|| Error::not_found("compliance scan not found"))?;
        export_scan(&scan, format)
    }

    // ----- exceptions -----

    /// Request a waiver for one control on one target. Starts `pending`.
    pub fn request_exception(&self, input: ExceptionInput) -> Result<ComplianceException> {
        let profile = self
            .profiles
            .get(&input.profile_id)
            .ok_or_else(|| Error::not_found("compliance profile not found"))?;
        let control_id = require(&input.control_id, "control_id")?;
        let control = profile
            .controls
            .iter()
            .find(|c| c.id.eq_ignore_ascii_case(&control_id))
            .ok_or_else(|| Error::not_found(format!("control {control_id:?} not found in profile")))?;
        let (target_kind, target_name) = normalize_target(&input.target_kind, &input.target_name)?;
        let reason = require(&input.reason, "reason")?;
        let requested_by = require(&input.requested_by, "requested_by")?;
        let ttl_seconds = bounded_seconds(
            input.ttl_seconds,
            DEFAULT_EXCEPTION_TTL_SECONDS,
            MIN_EXCEPTION_TTL_SECONDS,
            MAX_EXCEPTION_TTL_SECONDS,
            "ttl_seconds",
        )?;

        let now = self.clock.now();
        let exception = self.exceptions.create(ComplianceException {
            id: String::new(),
            profile_id: profile.id,
            control_id: control.id.clone(),
            target_kind,
            target_name,
            reason,
            requested_by,
            decided_by: None,
            status: ExceptionStatus::Pending,
            ttl_seconds,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            approved_at: None,
            expires_at: Some(now + Duration::seconds(ttl_seconds)),
        });
        tracing::info!(exception_id = %exception.id, control_id = %exception.control_id, "compliance exception requested");
        Ok(exception)
    }

    /// Approve a pending exception. The waiver runs `ttl_seconds` from now.
    pub fn approve_exception(&self, id: &str, approver: &str) -> Result<ComplianceException> {
        let approver = require(approver, "approver")?;
        let now = self.clock.now();
        self.exceptions.write(|table| {
            sweep(table.values_mut(), now);
            let exception = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("compliance exception not found"))?;
            if exception.status != ExceptionStatus::Pending {
                return Err(Error::conflict("compliance exception is not pending"));
            }
            if exception.requested_by.eq_ignore_ascii_case(&approver) {
                return Err(Error::conflict("approver must differ from requester"));
            }
            exception.status = ExceptionStatus::Approved;
            exception.decided_by = Some(approver);
            exception.approved_at = Some(now);
            exception.expires_at = Some(now + Duration::seconds(exception.ttl_seconds));
            exception.updated_at = now;
            tracing::info!(exception_id = %exception.id, "compliance exception approved");
            Ok(exception.clone())
        })
    }

    /// Reject a pending exception.
    pub fn reject_exception(&self, id: &str, approver: &str, reason: &str) -> Result<ComplianceException> {
        let approver = require(approver, "approver")?;
        let now = self.clock.now();
        self.exceptions.write(|table| {
            sweep(table.values_mut(), now);
            let exception = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("compliance exception not found"))?;
            if exception.status != ExceptionStatus::Pending {
                return Err(Error::conflict("compliance exception is not pending"));
            }
            exception.status = ExceptionStatus::Rejected;
            exception.decided_by = Some(approver);
            exception.rejection_reason = Some(normalize(reason));
            exception.updated_at = now;
            tracing::info!(exception_id = %exception.id, "compliance exception rejected");
            Ok(exception.clone())
        })
    }

    /// Look up an exception after an expiry sweep.
    pub fn get_exception(&self, id: &str) -> Option<ComplianceException> {
        let now = self.clock.now();
        self.exceptions.write(|table| {
            sweep(table.values_mut(), now);
            table.get(id).cloned()
        })
    }

    /// All exceptions, newest first, after an expiry sweep.
    pub fn list_exceptions(&self) -> Vec<ComplianceException> {
        let now = self.clock.now();
        let mut items: Vec<ComplianceException> = self.exceptions.write(|table| {
            sweep(table.values_mut(), now);
            table.values().cloned().collect()
        });
        items.sort_by(newest_first);
        items
    }

    // ----- continuous -----

    /// Schedule a recurring scan.
    pub fn create_continuous(&self, input: ContinuousInput) -> Result<ContinuousConfig> {
        let profile = self
            .profiles
            .get(&input.profile_id)
            .ok_or_else(|| Error::not_found("compliance profile not found"))?;
        let (target_kind, target_name) = normalize_target(&input.target_kind, &input.target_name)?;
        let interval_seconds = bounded_seconds(
            input.interval_seconds,
            DEFAULT_SCAN_INTERVAL_SECONDS,
            MIN_SCAN_INTERVAL_SECONDS,
            MAX_SCAN_INTERVAL_SECONDS,
            "interval_seconds",
        )?;
        let now = self.clock.now();
        Ok(self.continuous.create(ContinuousConfig {
            id: String::new(),
            profile_id: profile.id,
            target_kind,
            target_name,
            interval_seconds,
            enabled: input.enabled.unwrap_or(true),
            last_scan_id: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }))
    }

    /// Look up a schedule.
    pub fn get_continuous(&self, id: &str) -> Option<ContinuousConfig> {
        self.continuous.get(id)
    }

    /// All schedules, newest first.
    pub fn list_continuous(&self) -> Vec<ContinuousConfig> {
        self.continuous.list()
    }

    /// Enable or disable a schedule.
    pub fn set_continuous_enabled(&self, id: &str, enabled: bool) -> Result<ContinuousConfig> {
        let now = self.clock.now();
        self.continuous.write(|table| {
            let config = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("continuous compliance config not found"))?;
            config.enabled = enabled;
            config.updated_at = now;
            Ok(config.clone())
        })
    }

    /// Run a schedule's scan now and record it as the latest run.
    pub fn run_continuous_scan(&self, id: &str) -> Result<ContinuousRun> {
        let config = self
            .continuous
            .get(id)
            .ok_or_else(|| Error::not_found("continuous compliance config not found"))?;
        let scan = self.run_scan(ScanInput {
            profile_id: config.profile_id.clone(),
            target_kind: config.target_kind.clone(),
            target_name: config.target_name.clone(),
        })?;
        let config = self.continuous.write(|table| {
            let config = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("continuous compliance config not found"))?;
            config.last_scan_id = Some(scan.id.clone());
            config.last_run_at = Some(scan.created_at);
            config.updated_at = scan.created_at;
            Ok::<_, Error>(config.clone())
        })?;
        Ok(ContinuousRun { config, scan })
    }

    /// Enabled schedules that never ran or whose interval has elapsed.
    pub fn due_continuous(&self) -> Vec<ContinuousConfig> {
        let now = self.clock.now();
        let mut due: Vec<ContinuousConfig> = self.continuous.read(|table| {
            table
                .values()
                .filter(|c| {
                    c.enabled
                        && c.last_run_at
                            .map_or(true, |at| at + Duration::seconds(c.interval_seconds) <= now)
                })
                .cloned()
                .collect()
        });
        due.sort_by_key(|c| id_sequence(&c.id));
        due
    }
}
