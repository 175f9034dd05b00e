//! Package artifact registry keyed by `(name, version)`.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::is_sha256_digest;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::ids::prefix;
use crate::impl_entity;
use crate::store::EntityStore;
use crate::text::{normalize, normalize_key, require};

/// A published artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageArtifact {
    /// Store-assigned id.
    pub id: String,
    /// Lowercased package name.
    pub name: String,
    /// Version label.
    pub version: String,
    /// `sha256:<64 hex>`.
    pub digest: String,
    /// Publishing maintainer.
    #[serde(default)]
    pub maintainer: String,
    /// Artifact size.
    #[serde(default)]
    pub size_bytes: u64,
    /// First publish time.
    pub created_at: DateTime<Utc>,
    /// Last publish time.
    pub updated_at: DateTime<Utc>,
}

impl_entity!(PackageArtifact, prefix::PACKAGE_ARTIFACT);

/// Publish request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageInput {
    /// Package name.
    pub name: String,
    /// Version label.
    pub version: String,
    /// Content digest.
    pub digest: String,
    /// Maintainer.
    #[serde(default)]
    pub maintainer: String,
    /// Size in bytes.
    #[serde(default)]
    pub size_bytes: u64,
}

/// Order versions by dot-separated segments, numerically where both sides
/// are numbers.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.trim_start_matches('v').split('.');
    let mut right = b.trim_start_matches('v').split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Package registry.
#[derive(Debug)]
pub struct PackageRegistry {
    artifacts: EntityStore<PackageArtifact>,
    clock: Arc<dyn Clock>,
}

impl PackageRegistry {
    /// Create an empty registry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            artifacts: EntityStore::new(),
            clock,
        }
    }

    /// Publish or republish `(name, version)`.
    pub fn publish(&self, input: PackageInput) -> Result<PackageArtifact> {
        let name = normalize_key(&require(&input.name, "name")?);
        let version = require(&input.version, "version")?;
        let digest = normalize_key(&input.digest);
        if !is_sha256_digest(&digest) {
            return Err(Error::validation("digest must match sha256:<64 lowercase hex>"));
        }
        let now = self.clock.now();
        let (artifact, created) = self.artifacts.upsert_by(
            PackageArtifact {
                id: String::new(),
                name,
                version,
                digest,
                maintainer: normalize(&input.maintainer),
                size_bytes: input.size_bytes,
                created_at: now,
                updated_at: now,
            },
            |a| (a.name.clone(), a.version.clone()),
        );
        tracing::info!(
            artifact_id = %artifact.id,
            name = %artifact.name,
            version = %artifact.version,
            created,
            "package published"
        );
        Ok(artifact)
    }

    /// Look up by id.
    pub fn get(&self, id: &str) -> Option<PackageArtifact> {
        self.artifacts.get(id)
    }

    /// Look up by `(name, version)`.
    pub fn find(&self, name: &str, version: &str) -> Option<PackageArtifact> {
        let (name, version) = (normalize_key(name), normalize(version));
        self.artifacts
            .read(|table| table.find(|a| a.name == name && a.version == version).cloned())
    }

    /// All artifacts by name ascending, then newest version first.
    pub fn list(&self) -> Vec<PackageArtifact> {
        self.artifacts.list_sorted_by(|a, b| {
            a.name.cmp(&b.name).then_with(|| compare_versions(&b.version, &a.version))
        })
    }

    /// Remove by id.
    pub fn delete(&self, id: &str) -> bool {
        let removed = self.artifacts.delete(id);
        if removed {
            tracing::info!(artifact_id = %id.trim(), "package deleted");
        }
        removed
    }
}
