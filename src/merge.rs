//! Layered key/value merge resolver.
//!
//! Layers are folded left to right into an empty mapping. Values are
//! `serde_json::Value` trees, so JSON and YAML payloads merge structurally.
//!
//! | Strategy | Leaf conflict | Mapping on both sides | Incoming `null` |
//! |----------|---------------|-----------------------|-----------------|
//! | `merge-last` | incoming wins | recurse | stored as `null` |
//! | `merge-first` | existing wins | recurse | ignored if key exists |
//! | `overwrite` | incoming wins | incoming replaces | stored as `null` |
//! | `remove` | incoming wins | recurse | key deleted |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// How a layer folds into the accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Later layers override leaves.
    #[default]
    MergeLast,
    /// Earlier layers keep their leaves.
    MergeFirst,
    /// Later layers replace top-level keys wholesale.
    Overwrite,
    /// Like `merge-last`, but `null` deletes the key.
    Remove,
}

impl MergeStrategy {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MergeLast => "merge-last",
            Self::MergeFirst => "merge-first",
            Self::Overwrite => "overwrite",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "merge-last" => Ok(Self::MergeLast),
            "merge-first" => Ok(Self::MergeFirst),
            "overwrite" => Ok(Self::Overwrite),
            "remove" => Ok(Self::Remove),
            other => Err(Error::validation(format!(
                "strategy must be merge-first, merge-last, overwrite, or remove (got {other:?})"
            ))),
        }
    }
}

/// One named layer of nested data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableLayer {
    /// Layer name, for diagnostics.
    #[serde(default)]
    pub name: String,
    /// Nested mapping.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl VariableLayer {
    /// Build a layer from a JSON object. Non-object values yield an empty layer.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { name: name.into(), data }
    }
}

/// A resolve call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Layers, lowest precedence first for `merge-last`.
    #[serde(default)]
    pub layers: Vec<VariableLayer>,
    /// Fold strategy.
    #[serde(default)]
    pub strategy: MergeStrategy,
    /// Optional dotted path to extract from the merged mapping.
    #[serde(default)]
    pub lookup: Option<String>,
    /// Returned as `value` when the lookup misses.
    #[serde(default)]
    pub default: Option<Value>,
}

/// Output of [`resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Fully merged mapping.
    pub merged: Map<String, Value>,
    /// Whether the lookup path was present.
    pub found: bool,
    /// The looked-up node, or the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Fold `layers` with `strategy` and optionally look up a dotted path.
pub fn resolve(request: &ResolveRequest) -> Resolution {
    let mut merged = Map::new();
    for layer in &request.layers {
        merge_into(&mut merged, layer.data.clone(), request.strategy);
    }

    let path = request.lookup.as_deref().map(str::trim).unwrap_or("");
    let (found, value) = if path.is_empty() {
        (false, None)
    } else {
        match lookup_path(&merged, path) {
            Some(v) => (true, Some(v.clone())),
            None => (false, request.default.clone()),
        }
    };

    Resolution { merged, found, value }
}

/// Fold `incoming` into `acc`.
pub fn merge_into(acc: &mut Map<String, Value>, incoming: Map<String, Value>, strategy: MergeStrategy) {
    for (key, value) in incoming {
        match strategy {
            MergeStrategy::Overwrite => {
                acc.insert(key, value);
            }
            MergeStrategy::Remove if value.is_null() => {
                acc.remove(&key);
            }
            MergeStrategy::MergeFirst => {
                if let Some(existing) = acc.get_mut(&key) {
                    if let (Value::Object(existing), Value::Object(nested)) = (existing, value) {
                        merge_into(existing, nested, strategy);
                    }
                } else {
                    acc.insert(key, value);
                }
            }
            MergeStrategy::MergeLast | MergeStrategy::Remove => {
                let value = match (acc.get_mut(&key), value) {
                    (Some(Value::Object(existing)), Value::Object(nested)) => {
                        merge_into(existing, nested, strategy);
                        continue;
                    }
                    (_, value) => value,
                };
                acc.insert(key, value);
            }
        }
    }
}

/// Walk a dotted path through nested mappings.
///
/// Every segment but the last must land on a mapping. Empty segments miss.
pub fn lookup_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.').map(str::trim);
    let first = segments.next().filter(|s| !s.is_empty())?;
    let mut node = root.get(first)?;
    for segment in segments {
        if segment.is_empty() {
            return None;
        }
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn layers(values: Vec<Value>) -> Vec<VariableLayer> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| VariableLayer::new(format!("layer-{i}"), v))
            .collect()
    }

    #[test]
    fn test_merge_last_with_lookup() {
        let req = ResolveRequest {
            layers: layers(vec![
                json!({"service": {"replicas": 2}, "region": "us-east-1"}),
                json!({"service": {"replicas": 5}}),
            ]),
            strategy: MergeStrategy::MergeLast,
            lookup: Some("service.replicas".to_string()),
            default: None,
        };
        let res = resolve(&req);
        assert!(res.found);
        assert_eq!(res.value, Some(json!(5)));
        assert_eq!(res.merged["region"], json!("us-east-1"));
    }

    #[test]
    fn test_merge_first_keeps_existing_leaves() {
        let req = ResolveRequest {
            layers: layers(vec![
                json!({"a": 1, "nested": {"x": 1}}),
                json!({"a": 2, "b": 3, "nested": {"x": 9, "y": 2}}),
            ]),
            strategy: MergeStrategy::MergeFirst,
            ..Default::default()
        };
        let res = resolve(&req);
        assert_eq!(
            Value::Object(res.merged),
            json!({"a": 1, "b": 3, "nested": {"x": 1, "y": 2}})
        );
    }

    #[test]
    fn test_overwrite_replaces_whole_subtrees() {
        let req = ResolveRequest {
            layers: layers(vec![
                json!({"nested": {"x": 1, "y": 2}, "keep": true}),
                json!({"nested": {"z": 3}}),
            ]),
            strategy: MergeStrategy::Overwrite,
            ..Default::default()
        };
        let res = resolve(&req);
        assert_eq!(Value::Object(res.merged), json!({"nested": {"z": 3}, "keep": true}));
    }

    #[test]
    fn test_remove_deletes_on_null() {
        let req = ResolveRequest {
            layers: layers(vec![
                json!({"a": 1, "nested": {"x": 1, "y": 2}}),
                json!({"a": null, "nested": {"y": null, "z": 3}}),
            ]),
            strategy: MergeStrategy::Remove,
            ..Default::default()
        };
        let res = resolve(&req);
        assert_eq!(Value::Object(res.merged), json!({"nested": {"x": 1, "z": 3}}));
    }

    #[test]
    fn test_lookup_miss_returns_default() {
        let req = ResolveRequest {
            layers: layers(vec![json!({"service": {"replicas": 2}, "region": "eu"})]),
            lookup: Some("region.name".to_string()),
            default: Some(json!("fallback")),
            ..Default::default()
        };
        let res = resolve(&req);
        assert!(!res.found);
        assert_eq!(res.value, Some(json!("fallback")));

        let empty = resolve(&ResolveRequest {
            lookup: Some("  ".to_string()),
            ..req.clone()
        });
        assert!(!empty.found);
        assert_eq!(empty.value, None);
    }

    #[test]
    fn test_lookup_can_return_subtree() {
        let root = json!({"a": {"b": {"c": [1, 2]}}});
        let map = root.as_object().unwrap();
        assert_eq!(lookup_path(map, "a.b"), Some(&json!({"c": [1, 2]})));
        assert_eq!(lookup_path(map, "a..b"), None);
        assert_eq!(lookup_path(map, "a.b.c.d"), None);
    }

    #[test]
    fn test_layers_are_not_mutated() {
        let req = ResolveRequest {
            layers: layers(vec![json!({"n": {"x": 1}}), json!({"n": {"y": 2}})]),
            ..Default::default()
        };
        let before = req.layers.clone();
        let _ = resolve(&req);
        assert_eq!(req.layers, before);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("Merge-First".parse::<MergeStrategy>().unwrap(), MergeStrategy::MergeFirst);
        assert_eq!("".parse::<MergeStrategy>().unwrap(), MergeStrategy::MergeLast);
        assert!("deep".parse::<MergeStrategy>().is_err());
        assert_eq!(serde_json::to_string(&MergeStrategy::MergeLast).unwrap(), "\"merge-last\"");
    }

    fn leaf_map() -> impl Strategy<Value = Map<String, Value>> {
        proptest::collection::btree_map("[a-e]", any::<i32>(), 0..5).prop_map(|m| {
            m.into_iter().map(|(k, v)| (k, json!(v))).collect()
        })
    }

    proptest! {
        #[test]
        fn prop_merge_last_leaf_precedence(a in leaf_map(), b in leaf_map(), na in leaf_map(), nb in leaf_map()) {
            let mut a = a;
            let mut b = b;
            a.insert("nested".to_string(), Value::Object(na.clone()));
            b.insert("nested".to_string(), Value::Object(nb.clone()));

            let res = resolve(&ResolveRequest {
                layers: vec![
                    VariableLayer { name: "a".into(), data: a.clone() },
                    VariableLayer { name: "b".into(), data: b.clone() },
                ],
                ..Default::default()
            });

            for (k, v) in b.iter().filter(|(k, _)| *k != "nested") {
                prop_assert_eq!(res.merged.get(k), Some(v));
            }
            for (k, v) in a.iter().filter(|(k, _)| !b.contains_key(*k)) {
                prop_assert_eq!(res.merged.get(k), Some(v));
            }
            let nested = res.merged["nested"].as_object().unwrap();
            for (k, v) in &nb {
                prop_assert_eq!(nested.get(k), Some(v));
            }
            for (k, v) in na.iter().filter(|(k, _)| !nb.contains_key(*k)) {
                prop_assert_eq!(nested.get(k), Some(v));
            }
        }
    }
}
