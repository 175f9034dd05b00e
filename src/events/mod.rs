//! Hash-chained event log.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`chain`] | Canonical hash input, sealing, integrity walk |
//! | [`fanout`] | Bounded subscriber channels, drop-on-full delivery |
//! | [`log`] | The retained ring of sealed events and its query surface |

pub mod chain;
pub mod fanout;
pub mod log;

pub use chain::{compute_hash, Event, EventInput, IntegrityReport, IntegrityViolation};
pub use fanout::Subscription;
pub use log::{EventLog, EventQuery};
