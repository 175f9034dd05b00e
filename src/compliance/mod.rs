//! Compliance profiles, deterministic scans, exceptions, and evidence export.
//!
//! ## Scan Flow
//!
//! ```text
//! profile.controls ──evaluate──▶ findings(pass|fail)
//!                                   │
//!          sweep exceptions ────────┤ approved exception covers
//!                                   ▼ (profile, control, kind, name)
//!                               fail → waived
//!                                   │
//!                                   ▼
//!                         summary{total, passed, failed, waived, score}
//! ```
//!
//! ## Exception Lifecycle
//!
//! | From | Event | To |
//! |------|-------|----|
//! | pending | approve (approver ≠ requester) | approved, expires `ttl` after approval |
//! | pending | reject | rejected |
//! | pending/approved | deadline passes | expired |

pub mod export;
pub mod model;
pub mod store;

pub use export::{EvidenceExport, EvidenceFormat};
pub use model::{
    ComplianceControl, ComplianceException, ComplianceFinding, ComplianceProfile, ComplianceScan,
    ContinuousConfig, ContinuousInput, ControlInput, ExceptionInput, ExceptionStatus,
    FindingStatus, ProfileInput, ScanInput, ScanSummary,
};
pub use store::{evaluate_control, ComplianceStore, ContinuousRun};
