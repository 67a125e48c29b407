//! Controller loop: watch offloadings, virtual nodes and namespace maps, coalesce the
//! resulting triggers and run one reconciliation pass at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetmap_core::{LocalScope, NamespaceScope};
use fleetmap_reconcile::{PassReport, ReconcileError, Reconciler};
use fleetmap_store::WorkQueue;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams},
    runtime::{watcher, watcher::Event, WatchStreamExt},
    Client, ResourceExt,
};
use tokio::signal;
use tracing::{debug, info, warn};

use crate::crds::{NamespaceMap, NamespaceOffloading, VirtualNode};
use crate::{KubeEventReporter, KubeMappingStore, KubeRegistry};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Coalescing window for watch triggers.
    pub resync: Duration,
    /// Delay before retrying passes that failed with a retryable error.
    pub retry: Duration,
    /// Controller name on published events.
    pub reporter: String,
    pub local_scope: LocalScope,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync: Duration::from_millis(250),
            retry: Duration::from_secs(10),
            reporter: "fleetmap-controller".to_string(),
            local_scope: LocalScope::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffloadingKey {
    pub namespace: String,
    pub name: String,
}

impl OffloadingKey {
    fn of(o: &NamespaceOffloading) -> Self {
        Self { namespace: o.namespace().unwrap_or_default(), name: o.name_any() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Trigger {
    /// Cluster membership or mapping records changed: every offloading is affected.
    Membership,
    Offloading(OffloadingKey),
}

fn offloading_trigger(ev: Event<NamespaceOffloading>) -> Trigger {
    match ev {
        Event::Applied(o) | Event::Deleted(o) => Trigger::Offloading(OffloadingKey::of(&o)),
        Event::Restarted(_) => Trigger::Membership,
    }
}

/// Pass scope of an offloading; the remote namespace defaults to the local name.
pub fn scope_of(o: &NamespaceOffloading) -> NamespaceScope {
    let ns = o.namespace().unwrap_or_default();
    let remote = o.spec.remote_namespace_name.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| ns.clone());
    NamespaceScope::new(ns, o.name_any()).with_remote_namespace(remote)
}

pub fn reconciler(client: Client, cfg: &ControllerConfig) -> Reconciler {
    Reconciler::new(
        Arc::new(KubeRegistry::new(client.clone())),
        Arc::new(KubeMappingStore::new(client.clone(), cfg.local_scope.clone())),
        Arc::new(KubeEventReporter::new(client, &cfg.reporter)),
    )
    .with_local_scope(cfg.local_scope.clone())
}

/// Run a single pass for one NamespaceOffloading.
pub async fn reconcile_once(client: Client, cfg: &ControllerConfig, namespace: &str, name: &str) -> Result<PassReport> {
    let api: Api<NamespaceOffloading> = Api::namespaced(client.clone(), namespace);
    let o = api.get(name).await.with_context(|| format!("fetching NamespaceOffloading {}/{}", namespace, name))?;
    let r = reconciler(client, cfg);
    Ok(r.reconcile(&scope_of(&o), &o.spec.cluster_selector).await?)
}

struct Runner {
    offloadings: Api<NamespaceOffloading>,
    reconciler: Reconciler,
}

impl Runner {
    /// Returns true when the pass should be retried later.
    async fn pass(&self, o: &NamespaceOffloading) -> bool {
        match self.reconciler.reconcile(&scope_of(o), &o.spec.cluster_selector).await {
            Ok(_) => false,
            Err(e @ ReconcileError::InvalidSelector(_)) => {
                debug!(error = %e, "not retrying until the selector changes");
                false
            }
            Err(_) => true,
        }
    }

    async fn run_all(&self, retry: &mut WorkQueue<OffloadingKey>) {
        let list = match self.offloadings.list(&ListParams::default()).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "listing NamespaceOffloadings failed");
                return;
            }
        };
        for o in list.items.iter() {
            if self.pass(o).await { retry.push(OffloadingKey::of(o)); }
        }
    }

    async fn run_one(&self, key: OffloadingKey, retry: &mut WorkQueue<OffloadingKey>) {
        let api: Api<NamespaceOffloading> = Api::namespaced(self.offloadings.clone().into_client(), &key.namespace);
        match api.get_opt(&key.name).await {
            Ok(Some(o)) => {
                if self.pass(&o).await { retry.push(key); }
            }
            Ok(None) => debug!(ns = %key.namespace, name = %key.name, "offloading gone; nothing to do"),
            Err(e) => {
                warn!(ns = %key.namespace, name = %key.name, error = %e, "fetching offloading failed");
                retry.push(key);
            }
        }
    }
}

/// Watch and reconcile until Ctrl-C or until every watch stream ends.
pub async fn run(client: Client, cfg: ControllerConfig) -> Result<()> {
    let offloadings: Api<NamespaceOffloading> = Api::all(client.clone());
    let nodes: Api<VirtualNode> = Api::all(client.clone());
    let maps: Api<NamespaceMap> = Api::all(client.clone());
    let wc = watcher::Config::default();

    let streams: Vec<BoxStream<'static, Result<Trigger, watcher::Error>>> = vec![
        watcher(offloadings.clone(), wc.clone()).default_backoff().map_ok(offloading_trigger).boxed(),
        watcher(nodes, wc.clone()).default_backoff().map_ok(|_| Trigger::Membership).boxed(),
        watcher(maps, wc).default_backoff().map_ok(|_| Trigger::Membership).boxed(),
    ];
    let mut triggers = futures::stream::select_all(streams);

    let runner = Runner { offloadings, reconciler: reconciler(client, &cfg) };
    let mut pending: WorkQueue<OffloadingKey> = WorkQueue::new();
    let mut retry: WorkQueue<OffloadingKey> = WorkQueue::new();
    let mut everything = false;
    let mut ticker = tokio::time::interval(cfg.resync);
    let mut retry_ticker = tokio::time::interval(cfg.retry);
    info!(resync_ms = cfg.resync.as_millis() as u64, retry_s = cfg.retry.as_secs(), "controller started");

    loop {
        tokio::select! {
            maybe = triggers.next() => {
                match maybe {
                    Some(Ok(Trigger::Membership)) => everything = true,
                    Some(Ok(Trigger::Offloading(key))) => { pending.push(key); }
                    Some(Err(e)) => warn!(error = %e, "watch error"),
                    None => {
                        warn!("watch streams ended; stopping controller");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if everything {
                    everything = false;
                    pending.drain_ready();
                    runner.run_all(&mut retry).await;
                } else {
                    for key in pending.drain_ready() {
                        runner.run_one(key, &mut retry).await;
                    }
                }
            }
            _ = retry_ticker.tick() => {
                for key in retry.drain_ready() {
                    pending.push(key);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down controller");
                break;
            }
        }
    }
    Ok(())
}
