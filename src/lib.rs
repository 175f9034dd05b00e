//! # masterchef-control
//!
//! In-memory control-plane data layer for a configuration-management system.
//!
//! The crate owns no transport. HTTP handlers, a CLI, or an executor hold a
//! [`ControlPlane`] and call typed operations on its stores.
//!
//! ## Layers
//!
//! ```text
//! L4  approvals · syndic · compliance · agents · tenant_keys · commands
//!     access (delegation, jit, leases) · packages · variables
//!                         │
//! L3  dispatch (webhooks, notifications) ◀── events (hash chain + fan-out)
//!                         │
//! L2  merge resolver      │      expiry (lazy sweep)
//!                         │
//! L1  store (keyed entities) · ring · ids · canonical · clock · http
//! ```
//!
//! ## Guarantees
//!
//! - Values cross store boundaries by value; a returned clone shares nothing
//!   with stored state
//! - Expiring entities are swept under the writer lock before any decision
//!   that depends on their status
//! - Event `i` always links to the hash of event `i - 1` as sealed
//! - No store lock is held across network or file I/O, except the encrypted
//!   variable store, which serializes its own file writes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod agents;
pub mod approvals;
pub mod canonical;
pub mod clock;
pub mod commands;
pub mod compliance;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod expiry;
pub mod http;
pub mod ids;
pub mod merge;
pub mod packages;
pub mod plane;
pub mod ring;
pub mod severity;
pub mod store;
pub mod syndic;
pub mod telemetry;
pub mod tenant_keys;
pub mod text;
pub mod variables;

// Re-exports
pub use access::{DelegationStore, JitAccessStore, LeaseStore};
pub use agents::AgentCheckinStore;
pub use approvals::{ApprovalStore, BreakGlassStatus};
pub use canonical::{format_rfc3339_nano, is_sha256_digest, prefixed_sha256};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commands::CommandIngest;
pub use compliance::{ComplianceStore, EvidenceFormat};
pub use config::ControlPlaneConfig;
pub use dispatch::{NotificationRouter, WebhookDispatcher};
pub use error::{Error, ErrorKind, Result};
pub use events::{Event, EventInput, EventLog, IntegrityReport};
pub use http::{HttpClient, RecordingClient, ReqwestClient};
pub use merge::{resolve, MergeStrategy, Resolution, ResolveRequest, VariableLayer};
pub use packages::PackageRegistry;
pub use plane::ControlPlane;
pub use severity::Severity;
pub use store::{Entity, EntityStore};
pub use syndic::SyndicStore;
pub use telemetry::{init_tracing, LogFormat};
pub use tenant_keys::TenantKeyStore;
pub use variables::{EncryptedVariableStore, SourceResolver, VariableSource};
