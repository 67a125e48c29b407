//! fleetmap core types: virtual-node candidates, mapping state and scopes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Field key under which a candidate exposes its own name.
pub const FIELD_METADATA_NAME: &str = "metadata.name";

/// Label carried by mapping-state records naming the remote cluster they belong to.
pub const REMOTE_CLUSTER_ID_LABEL: &str = "fleetmap.io/remote-cluster-id";

/// Label set on records replicated from a remote cluster (excluded from the local scope).
pub const REPLICATED_LABEL: &str = "fleetmap.io/replicated";

/// Opaque identifier of a remote, peered cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for ClusterId {
    fn from(s: String) -> Self { Self(s) }
}

/// Local view of a remote cluster ("virtual node") as seen by the selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub cluster_id: ClusterId,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Candidate {
    pub fn new(cluster_id: impl Into<ClusterId>, name: impl Into<String>) -> Self {
        Self { cluster_id: cluster_id.into(), name: name.into(), labels: BTreeMap::new() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Fields addressable by field requirements. Only the name is exposed, and only when set.
    pub fn fields(&self) -> FieldSet<'_> {
        let mut set = FieldSet::default();
        if !self.name.is_empty() {
            set.entries.push((FIELD_METADATA_NAME, self.name.as_str()));
        }
        set
    }
}

/// Exposed fields of a candidate: `(dotted path, value)`.
#[derive(Debug, Clone, Default)]
pub struct FieldSet<'a> {
    entries: SmallVec<[(&'static str, &'a str); 2]>,
}

impl<'a> FieldSet<'a> {
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Per-cluster record of which local namespaces should be projected onto that cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingState {
    pub cluster_id: ClusterId,
    /// Local namespace -> remote namespace.
    #[serde(default)]
    pub desired_mapping: BTreeMap<String, String>,
}

impl MappingState {
    pub fn new(cluster_id: impl Into<ClusterId>) -> Self {
        Self { cluster_id: cluster_id.into(), desired_mapping: BTreeMap::new() }
    }

    pub fn is_desired(&self, local_namespace: &str) -> bool {
        self.desired_mapping.contains_key(local_namespace)
    }
}

/// Object the selection expression is attached to; events are recorded against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Namespace being offloaded and the name it takes on remote clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceScope {
    pub namespace: String,
    pub remote_namespace: String,
    pub subject: Subject,
}

impl NamespaceScope {
    /// Scope whose remote namespace keeps the local name.
    pub fn new(namespace: impl Into<String>, subject_name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            remote_namespace: namespace.clone(),
            subject: Subject { namespace: namespace.clone(), name: subject_name.into() },
            namespace,
        }
    }

    pub fn with_remote_namespace(mut self, remote: impl Into<String>) -> Self {
        self.remote_namespace = remote.into();
        self
    }
}

/// Label selector restricting mapping-state listing to locally owned records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalScope {
    pub label_selector: String,
}

impl Default for LocalScope {
    fn default() -> Self {
        Self { label_selector: format!("{}!=true", REPLICATED_LABEL) }
    }
}

pub mod prelude {
    pub use super::{Candidate, ClusterId, FieldSet, LocalScope, MappingState, NamespaceScope, Subject};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_expose_name_only_when_set() {
        let named = Candidate::new("c1", "vk-c1");
        assert_eq!(named.fields().get(FIELD_METADATA_NAME), Some("vk-c1"));
        assert_eq!(named.fields().len(), 1);

        let anonymous = Candidate::new("c2", "");
        assert!(anonymous.fields().is_empty());
        assert_eq!(anonymous.fields().get(FIELD_METADATA_NAME), None);
    }

    #[test]
    fn candidate_deserializes_from_camel_case() {
        let c: Candidate = serde_json::from_value(serde_json::json!({
            "clusterId": "east",
            "name": "vk-east",
            "labels": { "region": "eu" }
        }))
        .unwrap();
        assert_eq!(c.cluster_id.as_str(), "east");
        assert_eq!(c.labels.get("region").map(String::as_str), Some("eu"));
    }

    #[test]
    fn local_scope_excludes_replicated_records() {
        assert_eq!(LocalScope::default().label_selector, "fleetmap.io/replicated!=true");
    }
}
