//! fleetmap store: in-RAM collaborators for the reconciler and a coalescing work queue.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use fleetmap_core::{Candidate, ClusterId, LocalScope, MappingState, NamespaceScope, Subject};
use fleetmap_reconcile::{ClusterRegistry, EventReporter, MappingStore};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Coalescing FIFO of keys: a key already queued is not queued twice.
pub struct WorkQueue<K> {
    queued: FxHashSet<K>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone> WorkQueue<K> {
    pub fn new() -> Self { Self { queued: FxHashSet::default(), order: VecDeque::new() } }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }

    /// Returns false when the key was already pending.
    pub fn push(&mut self, key: K) -> bool {
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    /// Drain every pending key in arrival order.
    pub fn drain_ready(&mut self) -> Vec<K> {
        self.queued.clear();
        self.order.drain(..).collect()
    }
}

impl<K: Eq + Hash + Clone> Default for WorkQueue<K> {
    fn default() -> Self { Self::new() }
}

/// Serializable registry contents, e.g. loaded from a YAML fixture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    #[serde(default)]
    pub virtual_nodes: Vec<Candidate>,
    #[serde(default)]
    pub namespace_maps: Vec<MappingState>,
}

#[derive(Default)]
struct Faults {
    list: bool,
    add: FxHashSet<ClusterId>,
    remove: FxHashSet<ClusterId>,
}

/// In-memory registry and mapping store sharing one set of mapping records, so a pass
/// reads back what the previous pass wrote. All records count as local.
#[derive(Default)]
pub struct MemoryCluster {
    candidates: ArcSwap<Vec<Candidate>>,
    mappings: Mutex<FxHashMap<ClusterId, MappingState>>,
    faults: Mutex<Faults>,
    writes: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    pub fn from_fixture(f: Fixture) -> Self {
        let me = Self::new();
        me.set_candidates(f.virtual_nodes);
        for m in f.namespace_maps { me.insert_mapping(m); }
        me
    }

    /// Swap the whole candidate set (membership change).
    pub fn set_candidates(&self, candidates: Vec<Candidate>) {
        self.candidates.store(Arc::new(candidates));
    }

    pub fn candidates(&self) -> Arc<Vec<Candidate>> { self.candidates.load_full() }

    pub fn insert_mapping(&self, state: MappingState) {
        lock(&self.mappings).insert(state.cluster_id.clone(), state);
    }

    pub fn mapping(&self, cluster: &ClusterId) -> Option<MappingState> {
        lock(&self.mappings).get(cluster).cloned()
    }

    /// Clusters (sorted) onto which `namespace` is currently desired.
    pub fn desired_clusters(&self, namespace: &str) -> Vec<ClusterId> {
        let mut out: Vec<ClusterId> = lock(&self.mappings)
            .values()
            .filter(|m| m.is_desired(namespace))
            .map(|m| m.cluster_id.clone())
            .collect();
        out.sort();
        out
    }

    /// Successful add/remove calls served so far.
    pub fn write_count(&self) -> u64 { self.writes.load(Ordering::Relaxed) }

    pub fn fail_listing(&self, on: bool) { lock(&self.faults).list = on; }
    pub fn fail_add(&self, cluster: impl Into<ClusterId>) { lock(&self.faults).add.insert(cluster.into()); }
    pub fn fail_remove(&self, cluster: impl Into<ClusterId>) { lock(&self.faults).remove.insert(cluster.into()); }
    pub fn clear_faults(&self) { *lock(&self.faults) = Faults::default(); }

    fn update(&self, cluster: &ClusterId, f: impl FnOnce(&mut MappingState)) -> Result<()> {
        let mut maps = lock(&self.mappings);
        let state = maps.get_mut(cluster).ok_or_else(|| anyhow!("NamespaceMap for cluster {} not found", cluster))?;
        f(state);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterRegistry for MemoryCluster {
    async fn list_candidates(&self) -> Result<Vec<Candidate>> {
        if lock(&self.faults).list {
            return Err(anyhow!("registry unavailable"));
        }
        Ok(self.candidates.load_full().to_vec())
    }

    async fn list_mapping_state(&self, _scope: &LocalScope) -> Result<Vec<MappingState>> {
        if lock(&self.faults).list {
            return Err(anyhow!("registry unavailable"));
        }
        let mut out: Vec<MappingState> = lock(&self.mappings).values().cloned().collect();
        out.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        Ok(out)
    }
}

#[async_trait::async_trait]
impl MappingStore for MemoryCluster {
    async fn add_desired_mapping(&self, scope: &NamespaceScope, cluster: &ClusterId) -> Result<()> {
        if lock(&self.faults).add.contains(cluster) {
            return Err(anyhow!("injected add failure for {}", cluster));
        }
        self.update(cluster, |m| {
            m.desired_mapping.insert(scope.namespace.clone(), scope.remote_namespace.clone());
        })?;
        debug!(cluster = %cluster, ns = %scope.namespace, "desired mapping ensured");
        Ok(())
    }

    async fn remove_desired_mapping(&self, scope: &NamespaceScope, cluster: &ClusterId) -> Result<()> {
        if lock(&self.faults).remove.contains(cluster) {
            return Err(anyhow!("injected remove failure for {}", cluster));
        }
        self.update(cluster, |m| {
            m.desired_mapping.remove(&scope.namespace);
        })?;
        debug!(cluster = %cluster, ns = %scope.namespace, "desired mapping cleared");
        Ok(())
    }
}

/// A recorded warning event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedEvent {
    pub subject: Subject,
    pub reason: String,
    pub message: String,
}

/// Event reporter that keeps events in memory.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingReporter {
    pub fn new() -> Self { Self::default() }
    pub fn events(&self) -> Vec<RecordedEvent> { lock(&self.events).clone() }
}

#[async_trait::async_trait]
impl EventReporter for RecordingReporter {
    async fn warn(&self, subject: &Subject, reason: &str, message: &str) {
        lock(&self.events).push(RecordedEvent {
            subject: subject.clone(),
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
