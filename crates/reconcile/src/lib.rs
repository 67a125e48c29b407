//! fleetmap reconcile: one pass converges per-cluster desired mappings to a cluster selector.
//!
//! A pass reads the registry, checks that virtual nodes and mapping records agree in
//! cardinality, decides every candidate with the selector, and only then issues idempotent
//! add/remove writes. Write failures do not stop the pass; they are aggregated at the end.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use fleetmap_core::{Candidate, ClusterId, LocalScope, MappingState, NamespaceScope, Subject};
use fleetmap_selector::{CompiledSelector, FieldPath, SelectorErrors};
use k8s_openapi::api::core::v1::NodeSelector;
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Event reason used when the selector cannot be evaluated.
pub const REASON_INVALID: &str = "Invalid";

/// Read access to virtual nodes and per-cluster mapping records.
#[async_trait::async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn list_candidates(&self) -> Result<Vec<Candidate>>;
    async fn list_mapping_state(&self, scope: &LocalScope) -> Result<Vec<MappingState>>;
}

/// Idempotent writes on the desired-mapping table of one cluster.
#[async_trait::async_trait]
pub trait MappingStore: Send + Sync {
    /// Ensure `scope.namespace` is projected onto `cluster`; a no-op if already present.
    async fn add_desired_mapping(&self, scope: &NamespaceScope, cluster: &ClusterId) -> Result<()>;
    /// Ensure `scope.namespace` is not projected onto `cluster`; a no-op if absent.
    async fn remove_desired_mapping(&self, scope: &NamespaceScope, cluster: &ClusterId) -> Result<()>;
}

/// Human-visible warnings. Delivery is best-effort.
#[async_trait::async_trait]
pub trait EventReporter: Send + Sync {
    async fn warn(&self, subject: &Subject, reason: &str, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingOp {
    Add,
    Remove,
}

impl fmt::Display for MappingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { MappingOp::Add => "add", MappingOp::Remove => "remove" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergenceFailure {
    pub cluster_id: ClusterId,
    pub op: MappingOp,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to read cluster registry: {0:#}")]
    Registry(anyhow::Error),
    #[error("number of VirtualNodes ({candidates}) does not match that of NamespaceMaps ({mappings})")]
    Cardinality { candidates: usize, mappings: usize },
    #[error("invalid ClusterSelector: {0}")]
    InvalidSelector(#[source] SelectorErrors),
    #[error("failed to configure all desired mappings ({} of {attempted} failed)", .failures.len())]
    Convergence { attempted: usize, failures: Vec<ConvergenceFailure> },
}

impl ReconcileError {
    /// An invalid selector reproduces identically until the selector or membership changes.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::InvalidSelector(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Registry(_) => "registry",
            ReconcileError::Cardinality { .. } => "cardinality",
            ReconcileError::InvalidSelector(_) => "invalid_selector",
            ReconcileError::Convergence { .. } => "convergence",
        }
    }
}

/// Outcome of a fully converged pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Clusters the namespace is now mapped onto.
    pub selected: Vec<ClusterId>,
    /// Clusters the namespace is now absent from.
    pub deselected: Vec<ClusterId>,
}

pub struct Reconciler {
    registry: Arc<dyn ClusterRegistry>,
    store: Arc<dyn MappingStore>,
    events: Arc<dyn EventReporter>,
    local_scope: LocalScope,
}

impl Reconciler {
    pub fn new(registry: Arc<dyn ClusterRegistry>, store: Arc<dyn MappingStore>, events: Arc<dyn EventReporter>) -> Self {
        Self { registry, store, events, local_scope: LocalScope::default() }
    }

    pub fn with_local_scope(mut self, scope: LocalScope) -> Self {
        self.local_scope = scope;
        self
    }

    /// Run one reconciliation pass for `scope` against `selector`.
    pub async fn reconcile(&self, scope: &NamespaceScope, selector: &NodeSelector) -> Result<PassReport, ReconcileError> {
        let t0 = Instant::now();
        let res = self.run_pass(scope, selector).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let outcome = match &res {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        counter!("reconcile_passes_total", 1u64, "outcome" => outcome);
        match &res {
            Ok(r) => info!(ns = %scope.namespace, selected = r.selected.len(), deselected = r.deselected.len(), "pass converged"),
            Err(e) => warn!(ns = %scope.namespace, kind = e.kind(), error = %e, "pass failed"),
        }
        res
    }

    async fn run_pass(&self, scope: &NamespaceScope, selector: &NodeSelector) -> Result<PassReport, ReconcileError> {
        let candidates = self
            .registry
            .list_candidates()
            .await
            .context("failed to retrieve VirtualNodes")
            .map_err(ReconcileError::Registry)?;
        let mappings = self
            .registry
            .list_mapping_state(&self.local_scope)
            .await
            .context("failed to retrieve NamespaceMaps")
            .map_err(ReconcileError::Registry)?;
        let by_cluster: BTreeMap<ClusterId, MappingState> =
            mappings.into_iter().map(|m| (m.cluster_id.clone(), m)).collect();

        if candidates.len() != by_cluster.len() {
            return Err(ReconcileError::Cardinality { candidates: candidates.len(), mappings: by_cluster.len() });
        }

        let compiled = CompiledSelector::compile_at(selector, &FieldPath::root("spec.clusterSelector"));
        let mut decisions: Vec<(&ClusterId, bool)> = Vec::with_capacity(candidates.len());
        for c in &candidates {
            match compiled.matches(Some(c)) {
                Ok(matched) => {
                    debug!(node = %c.name, cluster = %c.cluster_id, matched, "selector evaluated");
                    decisions.push((&c.cluster_id, matched));
                }
                Err(e) => {
                    counter!("selector_match_errors_total", 1u64);
                    // Same error for every candidate; stop before any write.
                    self.events
                        .warn(&scope.subject, REASON_INVALID, &format!("Invalid ClusterSelector: {}", e))
                        .await;
                    return Err(ReconcileError::InvalidSelector(e));
                }
            }
        }

        let mut report = PassReport::default();
        let mut failures = Vec::new();
        for (cluster, matched) in decisions {
            let op = if matched { MappingOp::Add } else { MappingOp::Remove };
            let res = if !by_cluster.contains_key(cluster) {
                Err(anyhow::anyhow!("no NamespaceMap for cluster {}", cluster))
            } else if matched {
                self.store.add_desired_mapping(scope, cluster).await
            } else {
                self.store.remove_desired_mapping(scope, cluster).await
            };
            match res {
                Ok(()) => {
                    counter!("mapping_writes_total", 1u64, "op" => op.to_string(), "result" => "ok");
                    match op {
                        MappingOp::Add => report.selected.push(cluster.clone()),
                        MappingOp::Remove => report.deselected.push(cluster.clone()),
                    }
                }
                Err(e) => {
                    counter!("mapping_writes_total", 1u64, "op" => op.to_string(), "result" => "err");
                    warn!(cluster = %cluster, %op, error = %e, "desired mapping update failed");
                    failures.push(ConvergenceFailure { cluster_id: cluster.clone(), op, error: format!("{:#}", e) });
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(ReconcileError::Convergence { attempted: candidates.len(), failures })
        }
    }
}
