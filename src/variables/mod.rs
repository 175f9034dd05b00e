//! Variable sources and the encrypted variable store.
//!
//! Sources produce [`crate::merge::VariableLayer`]s; the merge resolver folds
//! them. Encrypted entries are just another origin of plaintext mappings,
//! typically wrapped as an inline source by the caller.

pub mod encrypted;
pub mod sources;

pub use encrypted::{EncryptedVariable, EncryptedVariableStore, EncryptedVariableSummary};
pub use sources::{NamedSource, SourceResolver, VariableSource, DEFAULT_SOURCE_TIMEOUT};
