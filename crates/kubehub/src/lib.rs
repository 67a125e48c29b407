//! fleetmap kubehub: kube-backed registry, mapping store and event reporter.

#![forbid(unsafe_code)]

pub mod controller;
pub mod crds;

use anyhow::{anyhow, Context, Result};
use fleetmap_core::{Candidate, ClusterId, LocalScope, MappingState, NamespaceScope, Subject, REMOTE_CLUSTER_ID_LABEL};
use fleetmap_reconcile::{ClusterRegistry, EventReporter, MappingStore};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, Resource, ResourceExt,
};
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, warn};

use crate::crds::{mapping_state, NamespaceMap, NamespaceOffloading, VirtualNode};

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// Lists VirtualNodes and local NamespaceMaps across all namespaces.
#[derive(Clone)]
pub struct KubeRegistry {
    client: Client,
}

impl KubeRegistry {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ClusterRegistry for KubeRegistry {
    async fn list_candidates(&self) -> Result<Vec<Candidate>> {
        let api: Api<VirtualNode> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.context("listing VirtualNodes")?;
        Ok(list.items.iter().map(Candidate::from).collect())
    }

    async fn list_mapping_state(&self, scope: &LocalScope) -> Result<Vec<MappingState>> {
        let api: Api<NamespaceMap> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&scope.label_selector);
        let list = api.list(&lp).await.context("listing NamespaceMaps")?;
        if list.items.is_empty() {
            debug!("no NamespaceMaps present in the cluster");
        }
        let mut out = Vec::with_capacity(list.items.len());
        for nm in list.items.iter() {
            match mapping_state(nm) {
                Some(m) => out.push(m),
                None => warn!(name = %nm.name_any(), ns = ?nm.namespace(), "NamespaceMap without {} label; ignored", REMOTE_CLUSTER_ID_LABEL),
            }
        }
        Ok(out)
    }
}

/// Edits `spec.desiredMapping` of the NamespaceMap belonging to a cluster with JSON merge patches.
#[derive(Clone)]
pub struct KubeMappingStore {
    client: Client,
    local: LocalScope,
}

impl KubeMappingStore {
    pub fn new(client: Client, local: LocalScope) -> Self { Self { client, local } }

    async fn find(&self, cluster: &ClusterId) -> Result<NamespaceMap> {
        let api: Api<NamespaceMap> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&cluster_selector(&self.local, cluster));
        let mut list = api.list(&lp).await.with_context(|| format!("listing NamespaceMap for cluster {}", cluster))?;
        if list.items.len() > 1 {
            warn!(cluster = %cluster, count = list.items.len(), "multiple NamespaceMaps for cluster; using the first");
        }
        if list.items.is_empty() {
            return Err(anyhow!("NamespaceMap for cluster {} not found", cluster));
        }
        Ok(list.items.swap_remove(0))
    }

    async fn patch(&self, nm: &NamespaceMap, body: Json) -> Result<()> {
        let ns = nm.namespace().ok_or_else(|| anyhow!("NamespaceMap {} has no namespace", nm.name_any()))?;
        let api: Api<NamespaceMap> = Api::namespaced(self.client.clone(), &ns);
        api.patch(&nm.name_any(), &PatchParams::default(), &Patch::Merge(&body))
            .await
            .with_context(|| format!("patching NamespaceMap {}/{}", ns, nm.name_any()))?;
        counter!("namespacemap_patches_total", 1u64);
        Ok(())
    }
}

fn cluster_selector(local: &LocalScope, cluster: &ClusterId) -> String {
    if local.label_selector.is_empty() {
        format!("{}={}", REMOTE_CLUSTER_ID_LABEL, cluster)
    } else {
        format!("{},{}={}", local.label_selector, REMOTE_CLUSTER_ID_LABEL, cluster)
    }
}

fn add_patch(scope: &NamespaceScope) -> Json {
    json!({ "spec": { "desiredMapping": { scope.namespace.as_str(): scope.remote_namespace.as_str() } } })
}

/// A null value deletes the key under merge-patch semantics.
fn remove_patch(scope: &NamespaceScope) -> Json {
    json!({ "spec": { "desiredMapping": { scope.namespace.as_str(): Json::Null } } })
}

#[async_trait::async_trait]
impl MappingStore for KubeMappingStore {
    async fn add_desired_mapping(&self, scope: &NamespaceScope, cluster: &ClusterId) -> Result<()> {
        let nm = self.find(cluster).await?;
        if nm.spec.desired_mapping.get(&scope.namespace) == Some(&scope.remote_namespace) {
            return Ok(());
        }
        self.patch(&nm, add_patch(scope)).await?;
        debug!(cluster = %cluster, ns = %scope.namespace, remote = %scope.remote_namespace, "desired mapping added");
        Ok(())
    }

    async fn remove_desired_mapping(&self, scope: &NamespaceScope, cluster: &ClusterId) -> Result<()> {
        let nm = self.find(cluster).await?;
        if !nm.spec.desired_mapping.contains_key(&scope.namespace) {
            return Ok(());
        }
        self.patch(&nm, remove_patch(scope)).await?;
        debug!(cluster = %cluster, ns = %scope.namespace, "desired mapping removed");
        Ok(())
    }
}

/// Publishes Warning events on the NamespaceOffloading named by the subject.
#[derive(Clone)]
pub struct KubeEventReporter {
    client: Client,
    reporter: Reporter,
}

impl KubeEventReporter {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter { controller: controller.to_string(), instance: std::env::var("HOSTNAME").ok() };
        Self { client, reporter }
    }
}

fn offloading_ref(subject: &Subject) -> ObjectReference {
    ObjectReference {
        api_version: Some(NamespaceOffloading::api_version(&()).to_string()),
        kind: Some(NamespaceOffloading::kind(&()).to_string()),
        namespace: Some(subject.namespace.clone()),
        name: Some(subject.name.clone()),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl EventReporter for KubeEventReporter {
    async fn warn(&self, subject: &Subject, reason: &str, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), offloading_ref(subject));
        let ev = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(ev).await {
            warn!(subject = %subject, error = %e, "failed to publish event");
        }
    }
}
