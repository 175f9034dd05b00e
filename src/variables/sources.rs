//! Variable sources: inline, environment, file, and HTTP.
//!
//! Every source resolves to a JSON object. A payload that parses to anything
//! else (a list, a scalar) is rejected, so the result always slots into the
//! merge resolver as a layer.
//!
//! | Source | Payload |
//! |--------|---------|
//! | `inline` | the `data` object as given |
//! | `env` | variables starting with `prefix`, optionally stripped, optionally nested under `target` |
//! | `file` | `.json` as JSON, `.yaml`/`.yml` as YAML, anything else JSON then YAML |
//! | `http` | `GET` body as JSON, falling back to YAML |

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::http::{validate_url, HttpClient, HttpRequest, ReqwestClient};
use crate::merge::VariableLayer;
use crate::text::normalize;

/// Timeout applied to HTTP sources.
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(8);

/// Where a layer of variables comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VariableSource {
    /// Literal data.
    Inline {
        /// Must be an object.
        data: Value,
    },
    /// Process environment.
    Env {
        /// Only variables whose name starts with this prefix.
        #[serde(default)]
        prefix: String,
        /// Drop the prefix from keys.
        #[serde(default)]
        strip_prefix: bool,
        /// Nest the collected map under this key.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Local JSON or YAML file.
    File {
        /// File path.
        path: PathBuf,
    },
    /// Remote JSON or YAML document.
    Http {
        /// Absolute URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl VariableSource {
    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Inline { .. } => "inline",
            Self::Env { .. } => "env",
            Self::File { .. } => "file",
            Self::Http { .. } => "http",
        }
    }
}

/// A source paired with the layer name it produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSource {
    /// Layer name.
    pub name: String,
    /// Source.
    #[serde(flatten)]
    pub source: VariableSource,
}

fn require_mapping(value: Value, origin: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(Error::validation(format!("{origin} payload must be a mapping"))),
    }
}

/// Parse `text` as JSON, falling back to YAML.
pub fn parse_document(text: &str, origin: &str) -> Result<Map<String, Value>> {
    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(_) => serde_yaml::from_str::<Value>(text)?,
    };
    require_mapping(value, origin)
}

fn parse_file(path: &Path, text: &str) -> Result<Map<String, Value>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let value = match extension.as_str() {
        "json" => serde_json::from_str::<Value>(text)?,
        "yaml" | "yml" => serde_yaml::from_str::<Value>(text)?,
        _ => return parse_document(text, "file"),
    };
    require_mapping(value, "file")
}

/// Collect `vars` per the env source rules.
pub fn collect_env<I>(vars: I, prefix: &str, strip_prefix: bool, target: Option<&str>) -> Map<String, Value>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut collected = Map::new();
    for (key, value) in vars {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let key = if strip_prefix { rest.to_string() } else { key.clone() };
        if key.is_empty() {
            continue;
        }
        collected.insert(key, Value::String(value));
    }
    match target.map(str::trim).filter(|t| !t.is_empty()) {
        Some(target) => {
            let mut wrapped = Map::new();
            wrapped.insert(target.to_string(), Value::Object(collected));
            wrapped
        }
        None => collected,
    }
}

/// Resolves [`VariableSource`]s to JSON objects.
#[derive(Debug, Clone)]
pub struct SourceResolver {
    client: Arc<dyn HttpClient>,
    env: Option<BTreeMap<String, String>>,
}

impl SourceResolver {
    /// Resolver fetching HTTP sources through `client` and reading the live
    /// process environment.
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client, env: None }
    }

    /// Resolver with a `reqwest` client bounded by `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self::new(Arc::new(ReqwestClient::new(timeout)?)))
    }

    /// Read env sources from `vars` instead of the process environment.
    pub fn with_env(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    /// Resolve one source.
    pub async fn resolve(&self, source: &VariableSource) -> Result<Map<String, Value>> {
        let resolved = match source {
            VariableSource::Inline { data } => require_mapping(data.clone(), "inline"),
            VariableSource::Env { prefix, strip_prefix, target } => {
                let vars: Vec<(String, String)> = match &self.env {
                    Some(vars) => vars.clone().into_iter().collect(),
                    None => std::env::vars().collect(),
                };
                Ok(collect_env(vars, prefix, *strip_prefix, target.as_deref()))
            }
            VariableSource::File { path } => {
                let text = tokio::fs::read_to_string(path).await?;
                parse_file(path, &text)
            }
            VariableSource::Http { url, headers } => self.fetch(url, headers).await,
        };
        if let Err(err) = &resolved {
            tracing::warn!(kind = source.kind(), error = %err, "variable source failed");
        }
        resolved
    }

    async fn fetch(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<Map<String, Value>> {
        let url = validate_url(url)?;
        let mut request = HttpRequest::get(url.clone());
        for (name, value) in headers {
            request = request.with_header(normalize(name), value.clone());
        }
        let response = self.client.send(request).await?;
        if !response.is_success() {
            return Err(Error::Http(format!("unexpected status {} from {url}", response.status)));
        }
        let text = String::from_utf8_lossy(&response.body);
        parse_document(&text, "http")
    }

    /// Resolve `source` unless `cancel` completes first, in which case the
    /// in-flight work is dropped and [`Error::Cancelled`] returned.
    pub async fn resolve_cancellable<F>(&self, source: &VariableSource, cancel: F) -> Result<Map<String, Value>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                tracing::debug!(kind = source.kind(), "variable source cancelled");
                Err(Error::Cancelled)
            }
            resolved = self.resolve(source) => resolved,
        }
    }

    /// Resolve sources in order into merge layers. The first failure aborts.
    pub async fn resolve_layers(&self, sources: &[NamedSource]) -> Result<Vec<VariableLayer>> {
        let mut layers = Vec::with_capacity(sources.len());
        for named in sources {
            let data = self.resolve(&named.source).await?;
            layers.push(VariableLayer::new(named.name.clone(), Value::Object(data)));
        }
        Ok(layers)
    }
}
