//! Hydra core types: type identity, resource records and the hydration status snapshot.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod normalize;
pub mod tables;

pub use normalize::{normalize, METADATA_KEYS_TO_DROP};
pub use tables::{ExclusionTable, PriorityList, StaticGvk, Tables};

/// Group/Version/Kind triple classifying a resource's schema. An empty group is the core group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` (`v1` or `group/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self { group, version, kind: kind.to_string() }
    }

    /// Parse a key of the form `v1/Kind` or `group/v1/Kind`.
    pub fn parse_key(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Some(Self::new(*group, *version, *kind))
            }
            _ => None,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("document is not a mapping")]
    NotAnObject,
    #[error("document missing apiVersion")]
    MissingApiVersion,
    #[error("document missing kind")]
    MissingKind,
    #[error("{0} document missing metadata.name")]
    MissingName(Gvk),
}

/// One cluster object as read from a snapshot: type identity, scope, name and the full body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
    /// Full object document, including `apiVersion`, `kind`, `metadata` and `status` when present.
    pub body: Json,
}

impl ResourceRecord {
    /// Classify a parsed document. The body is kept as-is; callers normalize before caching.
    pub fn from_value(body: Json) -> Result<Self, RecordError> {
        let obj = body.as_object().ok_or(RecordError::NotAnObject)?;
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).ok_or(RecordError::MissingApiVersion)?;
        let kind = obj.get("kind").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).ok_or(RecordError::MissingKind)?;
        let gvk = Gvk::from_api_version(api_version, kind);
        let meta = obj.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RecordError::MissingName(gvk.clone()))?
            .to_string();
        let namespace = meta
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Ok(Self { gvk, namespace, name, body })
    }

    /// Re-wrap a server representation under an existing identity.
    pub fn with_body(&self, body: Json) -> Self {
        Self { gvk: self.gvk.clone(), namespace: self.namespace.clone(), name: self.name.clone(), body }
    }

    pub fn status(&self) -> Option<&Json> {
        self.body.get("status")
    }

    /// True when `status` is present and carries content.
    pub fn has_status(&self) -> bool {
        match self.status() {
            None | Some(Json::Null) => false,
            Some(Json::Object(m)) => !m.is_empty(),
            Some(Json::Array(a)) => !a.is_empty(),
            Some(_) => true,
        }
    }

    /// `namespace/name` or `name` for cluster-scoped records.
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

/// Remaining pending records for one type identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStatus {
    pub gvk: String,
    pub remaining: usize,
}

/// Eventually-consistent view of reconciliation progress, published after every pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HydrationStatus {
    pub pass: u64,
    pub priority_done: bool,
    pub converged: bool,
    pub total_remaining: usize,
    /// Only buckets with pending records are listed.
    pub buckets: Vec<BucketStatus>,
    pub last_pass_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gvk_from_api_version_splits_group() {
        let core = Gvk::from_api_version("v1", "Namespace");
        assert_eq!(core, Gvk::new("", "v1", "Namespace"));
        assert_eq!(core.to_string(), "v1/Namespace");
        let grouped = Gvk::from_api_version("apiextensions.k8s.io/v1", "CustomResourceDefinition");
        assert_eq!(grouped.group, "apiextensions.k8s.io");
        assert_eq!(grouped.api_version(), "apiextensions.k8s.io/v1");
        assert_eq!(grouped.to_string(), "apiextensions.k8s.io/v1/CustomResourceDefinition");
    }

    #[test]
    fn parse_key_accepts_core_and_grouped() {
        assert_eq!(Gvk::parse_key("v1/Secret"), Some(Gvk::new("", "v1", "Secret")));
        assert_eq!(Gvk::parse_key("batch/v1/Job"), Some(Gvk::new("batch", "v1", "Job")));
        assert!(Gvk::parse_key("Secret").is_none());
        assert!(Gvk::parse_key("a/b/c/d").is_none());
        assert!(Gvk::parse_key("/v1/Kind").is_none());
    }

    #[test]
    fn record_from_value_reads_identity() {
        let r = ResourceRecord::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "ns-a" },
            "data": { "k": "v" }
        }))
        .unwrap();
        assert_eq!(r.gvk, Gvk::new("", "v1", "ConfigMap"));
        assert_eq!(r.namespace.as_deref(), Some("ns-a"));
        assert_eq!(r.name, "cm");
        assert_eq!(r.key(), "ns-a/cm");
        assert!(!r.has_status());
    }

    #[test]
    fn record_from_value_reports_missing_fields() {
        assert_eq!(ResourceRecord::from_value(json!([1, 2])).unwrap_err(), RecordError::NotAnObject);
        assert_eq!(ResourceRecord::from_value(json!({"kind": "X"})).unwrap_err(), RecordError::MissingApiVersion);
        assert_eq!(ResourceRecord::from_value(json!({"apiVersion": "v1"})).unwrap_err(), RecordError::MissingKind);
        let e = ResourceRecord::from_value(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": ""}})).unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"), "e={}", e);
    }

    #[test]
    fn has_status_ignores_empty_documents() {
        let mk = |status: Json| {
            ResourceRecord::from_value(json!({"apiVersion": "v1", "kind": "Node", "metadata": {"name": "n"}, "status": status})).unwrap()
        };
        assert!(!mk(Json::Null).has_status());
        assert!(!mk(json!({})).has_status());
        assert!(mk(json!({"phase": "Active"})).has_status());
    }
}
