//! Time-bounded access: delegation tokens, JIT grants, and run leases.
//!
//! All three are expiring state machines swept lazily under their store's
//! writer lock.
//!
//! | Store | Id prefix | TTL range (s) | Default | Terminal states |
//! |-------|-----------|---------------|---------|-----------------|
//! | [`DelegationStore`] | `delegation-` | 60..=86 400 | 3 600 | revoked, expired, exhausted |
//! | [`JitAccessStore`] | `jit-grant-` | 60..=3 600 | 900 | revoked, expired |
//! | [`LeaseStore`] | `lease-` | 15..=3 600 | 300 | released, expired |

pub mod delegation;
pub mod jit;
pub mod leases;

pub use delegation::{DelegationInput, DelegationStatus, DelegationStore, DelegationToken};
pub use jit::{JitAccessStore, JitGrant, JitGrantInput, JitStatus};
pub use leases::{LeaseInput, LeaseStatus, LeaseStore, RunLease};
