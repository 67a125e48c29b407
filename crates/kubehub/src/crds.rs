//! Custom resources read and written by the controller.

use std::collections::BTreeMap;

use fleetmap_core::{Candidate, MappingState, REMOTE_CLUSTER_ID_LABEL};
use k8s_openapi::api::core::v1::NodeSelector;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Local stand-in for a peered remote cluster.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(group = "fleetmap.io", version = "v1alpha1", kind = "VirtualNode", namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct VirtualNodeSpec {
    pub cluster_identity: ClusterIdentity,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIdentity {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    #[serde(default)]
    pub cluster_name: String,
}

/// Per-cluster table of local namespaces that should exist remotely.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(group = "fleetmap.io", version = "v1alpha1", kind = "NamespaceMap", namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMapSpec {
    /// Local namespace -> remote namespace.
    #[serde(default)]
    pub desired_mapping: BTreeMap<String, String>,
}

/// Offloading request attached to a namespace.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(group = "fleetmap.io", version = "v1alpha1", kind = "NamespaceOffloading", namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct NamespaceOffloadingSpec {
    #[serde(default)]
    pub cluster_selector: NodeSelector,
    /// Defaults to the local namespace name.
    #[serde(default)]
    pub remote_namespace_name: Option<String>,
}

impl From<&VirtualNode> for Candidate {
    fn from(vn: &VirtualNode) -> Self {
        Candidate {
            cluster_id: vn.spec.cluster_identity.cluster_id.as_str().into(),
            name: vn.name_any(),
            labels: vn.labels().clone(),
        }
    }
}

/// Mapping state of a NamespaceMap; `None` when it does not name its remote cluster.
pub fn mapping_state(nm: &NamespaceMap) -> Option<MappingState> {
    let id = nm.labels().get(REMOTE_CLUSTER_ID_LABEL)?;
    Some(MappingState { cluster_id: id.as_str().into(), desired_mapping: nm.spec.desired_mapping.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_node_becomes_candidate() {
        let vn: VirtualNode = serde_json::from_value(serde_json::json!({
            "apiVersion": "fleetmap.io/v1alpha1",
            "kind": "VirtualNode",
            "metadata": { "name": "vk-east", "namespace": "tenant-east", "labels": { "region": "eu" } },
            "spec": { "clusterIdentity": { "clusterID": "east-1234", "clusterName": "east" } }
        }))
        .unwrap();
        let c = Candidate::from(&vn);
        assert_eq!(c.cluster_id.as_str(), "east-1234");
        assert_eq!(c.name, "vk-east");
        assert_eq!(c.labels.get("region").map(String::as_str), Some("eu"));
    }

    #[test]
    fn namespace_map_requires_cluster_label() {
        let mut nm: NamespaceMap = serde_json::from_value(serde_json::json!({
            "apiVersion": "fleetmap.io/v1alpha1",
            "kind": "NamespaceMap",
            "metadata": { "name": "east", "namespace": "tenant-east" },
            "spec": { "desiredMapping": { "team-a": "team-a-east" } }
        }))
        .unwrap();
        assert!(mapping_state(&nm).is_none());

        nm.labels_mut().insert(REMOTE_CLUSTER_ID_LABEL.to_string(), "east-1234".to_string());
        let m = mapping_state(&nm).unwrap();
        assert_eq!(m.cluster_id.as_str(), "east-1234");
        assert!(m.is_desired("team-a"));
    }

    #[test]
    fn offloading_selector_defaults_to_empty() {
        let o: NamespaceOffloading = serde_json::from_value(serde_json::json!({
            "apiVersion": "fleetmap.io/v1alpha1",
            "kind": "NamespaceOffloading",
            "metadata": { "name": "offloading", "namespace": "team-a" },
            "spec": {}
        }))
        .unwrap();
        assert!(o.spec.cluster_selector.node_selector_terms.is_empty());
        assert!(o.spec.remote_namespace_name.is_none());
    }
}
