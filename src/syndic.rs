//! Master/syndic/minion routing topology.
//!
//! Nodes point at their parent. Masters are roots; syndics forward; minions
//! are leaves. Route resolution walks parent pointers from a target up to its
//! master with a seen-set, so a corrupted topology yields an error instead of
//! looping.
//!
//! ## Constraints on upsert
//!
//! | Rule | Error |
//! |------|-------|
//! | master has no parent | validation |
//! | syndic/minion has a parent | validation |
//! | parent ≠ self, parent exists, parent is not a minion | validation |
//! | a node with children cannot become a minion | conflict |
//! | the new parent chain must not contain the node | conflict |

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::ids::prefix;
use crate::impl_entity;
use crate::store::{EntityStore, Table};
use crate::text::{normalize, normalize_key, normalize_optional};

/// Position of a node in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyndicRole {
    /// Root of a routing tree.
    Master,
    /// Intermediate forwarder.
    Syndic,
    /// Leaf.
    Minion,
}

impl SyndicRole {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Syndic => "syndic",
            Self::Minion => "minion",
        }
    }
}

impl fmt::Display for SyndicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyndicRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_key(s).as_str() {
            "master" => Ok(Self::Master),
            "syndic" => Ok(Self::Syndic),
            "minion" => Ok(Self::Minion),
            _ => Err(Error::validation("role must be master/syndic/minion")),
        }
    }
}

/// A node in the routing topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyndicNode {
    /// Store-assigned id.
    pub id: String,
    /// Unique lowercased name.
    pub name: String,
    /// Lowercased parent name; `None` for masters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Role.
    pub role: SyndicRole,
    /// Free-form region label.
    #[serde(default)]
    pub region: String,
    /// Free-form network segment label.
    #[serde(default)]
    pub segment: String,
    /// First upsert time.
    pub created_at: DateTime<Utc>,
    /// Last upsert time.
    pub updated_at: DateTime<Utc>,
}

impl_entity!(SyndicNode, prefix::SYNDIC_NODE);

/// Caller-supplied node definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyndicNodeInput {
    /// Node name (case-insensitive).
    pub name: String,
    /// Parent name; required unless `role` is master.
    #[serde(default)]
    pub parent: Option<String>,
    /// `master`, `syndic`, or `minion`.
    pub role: String,
    /// Region label.
    #[serde(default)]
    pub region: String,
    /// Segment label.
    #[serde(default)]
    pub segment: String,
}

/// A resolved route from a master down to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteResolution {
    /// Target node name.
    pub target: String,
    /// Node names from master to target inclusive.
    pub path: Vec<String>,
    /// `path.len() - 1`.
    pub hops: usize,
}

fn by_name<'a>(table: &'a Table<SyndicNode>, name: &str) -> Option<&'a SyndicNode> {
    table.find(|n| n.name == name)
}

/// Topology store keyed by node name.
#[derive(Debug)]
pub struct SyndicStore {
    nodes: EntityStore<SyndicNode>,
    clock: Arc<dyn Clock>,
}

impl SyndicStore {
    /// Create an empty topology.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            nodes: EntityStore::new(),
            clock,
        }
    }

    /// Insert or update a node by name.
    pub fn upsert(&self, input: SyndicNodeInput) -> Result<SyndicNode> {
        let name = normalize_key(&input.name);
        if name.is_empty() {
            return Err(Error::validation("name is required"));
        }
        let role: SyndicRole = input.role.parse()?;
        let parent = normalize_optional(input.parent.as_deref()).map(|p| p.to_lowercase());

        match (role, &parent) {
            (SyndicRole::Master, Some(_)) => {
                return Err(Error::validation("parent is not allowed for master role"));
            }
            (SyndicRole::Syndic | SyndicRole::Minion, None) => {
                return Err(Error::validation("parent is required for syndic and minion roles"));
            }
            _ => {}
        }
        if parent.as_deref() == Some(name.as_str()) {
            return Err(Error::validation("parent cannot be self"));
        }

        let now = self.clock.now();
        self.nodes.write(|table| {
            if let Some(parent_name) = parent.as_deref() {
                let parent_node = by_name(table, parent_name)
                    .ok_or_else(|| Error::validation(format!("parent node {parent_name:?} not found")))?;
                if parent_node.role == SyndicRole::Minion {
                    return Err(Error::validation("parent role cannot be minion"));
                }
                // Walk the proposed ancestry; reaching `name` would close a loop.
                let mut seen = HashSet::new();
                let mut cursor = Some(parent_name.to_string());
                while let Some(current) = cursor {
                    if current == name || !seen.insert(current.clone()) {
                        return Err(Error::conflict("cyclic parent topology detected"));
                    }
                    cursor = by_name(table, &current).and_then(|n| n.parent.clone());
                }
            }

            let has_children = table.values().any(|n| n.parent.as_deref() == Some(name.as_str()));
            if role == SyndicRole::Minion && has_children {
                return Err(Error::conflict("minion nodes cannot have children"));
            }

            let (node, created) = table.upsert_by(
                SyndicNode {
                    id: String::new(),
                    name: name.clone(),
                    parent: parent.clone(),
                    role,
                    region: normalize(&input.region),
                    segment: normalize(&input.segment),
                    created_at: now,
                    updated_at: now,
                },
                |n| n.name.clone(),
            );
            tracing::info!(node = %node.name, role = %node.role, created, "syndic node upserted");
            Ok(node)
        })
    }

    /// Look up a node by id or name.
    pub fn get(&self, id_or_name: &str) -> Option<SyndicNode> {
        let key = normalize_key(id_or_name);
        self.nodes.read(|table| {
            table
                .get(id_or_name)
                .or_else(|| by_name(table, &key))
                .cloned()
        })
    }

    /// All nodes sorted by name.
    pub fn list(&self) -> Vec<SyndicNode> {
        self.nodes.list_sorted_by(|a, b| a.name.cmp(&b.name))
    }

    /// Delete a leaf node by id or name. Nodes with children cannot be removed.
    pub fn delete(&self, id_or_name: &str) -> Result<bool> {
        let key = normalize_key(id_or_name);
        self.nodes.write(|table| {
            let Some(node) = table.get(id_or_name).or_else(|| by_name(table, &key)) else {
                return Ok(false);
            };
            let (id, name) = (node.id.clone(), node.name.clone());
            if table.values().any(|n| n.parent.as_deref() == Some(name.as_str())) {
                return Err(Error::conflict(format!("syndic node {name:?} has children")));
            }
            table.remove(&id);
            tracing::info!(node = %name, "syndic node deleted");
            Ok(true)
        })
    }

    /// Walk parent pointers from `target` to its master.
    pub fn resolve_route(&self, target: &str) -> Result<RouteResolution> {
        let target = normalize_key(target);
        if target.is_empty() {
            return Err(Error::validation("target is required"));
        }
        self.nodes.read(|table| {
            let start = by_name(table, &target)
                .ok_or_else(|| Error::not_found(format!("syndic node {target:?} not found")))?;

            let mut path = Vec::new();
            let mut seen = HashSet::new();
            let mut node = start;
            loop {
                if !seen.insert(node.name.as_str()) {
                    tracing::warn!(target = %target, at = %node.name, "cyclic syndic topology");
                    return Err(Error::conflict("cyclic parent topology detected"));
                }
                path.push(node.name.clone());
                match node.parent.as_deref() {
                    None => break,
                    Some(parent) => {
                        node = by_name(table, parent)
                            .ok_or_else(|| Error::conflict(format!("broken parent link at {:?}", node.name)))?;
                    }
                }
            }
            if node.role != SyndicRole::Master {
                return Err(Error::conflict(format!("route for {target:?} does not reach a master")));
            }

            path.reverse();
            let hops = path.len() - 1;
            Ok(RouteResolution { target, path, hops })
        })
    }
}
