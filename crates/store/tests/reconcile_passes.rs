use std::sync::Arc;

use fleetmap_core::{Candidate, ClusterId, MappingState, NamespaceScope};
use fleetmap_reconcile::{ReconcileError, Reconciler, REASON_INVALID};
use fleetmap_store::{Fixture, MemoryCluster, RecordingReporter};
use k8s_openapi::api::core::v1::NodeSelector;

fn selector(yaml: &str) -> NodeSelector {
    serde_yaml::from_str(yaml).unwrap()
}

fn eu_only() -> NodeSelector {
    selector(
        r#"
nodeSelectorTerms:
  - matchExpressions:
      - key: region
        operator: In
        values: [eu]
"#,
    )
}

fn node(id: &str, region: &str) -> Candidate {
    Candidate::new(id, format!("vk-{}", id)).with_label("region", region)
}

fn cluster_of(nodes: Vec<Candidate>) -> Arc<MemoryCluster> {
    let maps = nodes.iter().map(|n| MappingState::new(n.cluster_id.clone())).collect();
    Arc::new(MemoryCluster::from_fixture(Fixture { virtual_nodes: nodes, namespace_maps: maps }))
}

fn reconciler(mc: &Arc<MemoryCluster>, events: &Arc<RecordingReporter>) -> Reconciler {
    Reconciler::new(mc.clone(), mc.clone(), events.clone())
}

fn scope() -> NamespaceScope {
    NamespaceScope::new("team-a", "offloading").with_remote_namespace("team-a-remote")
}

fn ids(v: &[&str]) -> Vec<ClusterId> {
    v.iter().map(|s| ClusterId::from(*s)).collect()
}

#[tokio::test]
async fn cardinality_mismatch_issues_no_writes() {
    let mc = Arc::new(MemoryCluster::new());
    mc.set_candidates(vec![node("a", "eu"), node("b", "eu"), node("c", "us")]);
    mc.insert_mapping(MappingState::new("a"));
    mc.insert_mapping(MappingState::new("b"));
    let events = Arc::new(RecordingReporter::new());

    let err = reconciler(&mc, &events).reconcile(&scope(), &eu_only()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Cardinality { candidates: 3, mappings: 2 }), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(err.to_string(), "number of VirtualNodes (3) does not match that of NamespaceMaps (2)");
    assert_eq!(mc.write_count(), 0);
    assert!(events.events().is_empty());
}

#[tokio::test]
async fn repeated_passes_converge_to_the_same_state() {
    let mc = cluster_of(vec![node("a", "eu"), node("b", "us"), node("c", "eu")]);
    let events = Arc::new(RecordingReporter::new());
    let r = reconciler(&mc, &events);

    let first = r.reconcile(&scope(), &eu_only()).await.unwrap();
    let after_first: Vec<_> = ["a", "b", "c"].iter().map(|id| mc.mapping(&ClusterId::from(*id))).collect();
    let second = r.reconcile(&scope(), &eu_only()).await.unwrap();
    let after_second: Vec<_> = ["a", "b", "c"].iter().map(|id| mc.mapping(&ClusterId::from(*id))).collect();

    assert_eq!(first, second);
    assert_eq!(first.selected, ids(&["a", "c"]));
    assert_eq!(first.deselected, ids(&["b"]));
    assert_eq!(after_first, after_second);
    assert_eq!(mc.desired_clusters("team-a"), ids(&["a", "c"]));
    let a = mc.mapping(&ClusterId::from("a")).unwrap();
    assert_eq!(a.desired_mapping.len(), 1);
    assert_eq!(a.desired_mapping.get("team-a").map(String::as_str), Some("team-a-remote"));
}

#[tokio::test]
async fn label_change_retracts_mapping() {
    let mc = cluster_of(vec![node("a", "eu"), node("b", "eu")]);
    let events = Arc::new(RecordingReporter::new());
    let r = reconciler(&mc, &events);

    r.reconcile(&scope(), &eu_only()).await.unwrap();
    assert_eq!(mc.desired_clusters("team-a"), ids(&["a", "b"]));

    mc.set_candidates(vec![node("a", "eu"), node("b", "us")]);
    let report = r.reconcile(&scope(), &eu_only()).await.unwrap();
    assert_eq!(report.deselected, ids(&["b"]));
    assert_eq!(mc.desired_clusters("team-a"), ids(&["a"]));
}

#[tokio::test]
async fn one_failed_removal_does_not_stop_the_others() {
    let mc = cluster_of(vec![node("a", "us"), node("b", "us"), node("c", "us")]);
    for id in ["a", "b", "c"] {
        let mut m = MappingState::new(id);
        m.desired_mapping.insert("team-a".into(), "team-a-remote".into());
        mc.insert_mapping(m);
    }
    mc.fail_remove("a");
    let events = Arc::new(RecordingReporter::new());

    let err = reconciler(&mc, &events).reconcile(&scope(), &eu_only()).await.unwrap_err();
    match &err {
        ReconcileError::Convergence { attempted, failures } => {
            assert_eq!(*attempted, 3);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].cluster_id.as_str(), "a");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_retryable());
    assert_eq!(mc.desired_clusters("team-a"), ids(&["a"]), "b and c were still retracted");
    assert_eq!(mc.write_count(), 2);

    mc.clear_faults();
    reconciler(&mc, &events).reconcile(&scope(), &eu_only()).await.unwrap();
    assert!(mc.desired_clusters("team-a").is_empty());
}

#[tokio::test]
async fn invalid_selector_records_event_and_keeps_mappings() {
    let mc = cluster_of(vec![node("a", "eu"), node("b", "us")]);
    let events = Arc::new(RecordingReporter::new());
    let r = reconciler(&mc, &events);
    r.reconcile(&scope(), &eu_only()).await.unwrap();

    let broken = selector(
        r#"
nodeSelectorTerms:
  - matchFields:
      - key: metadata.name
        operator: In
        values: [vk-a, vk-b]
"#,
    );
    let err = r.reconcile(&scope(), &broken).await.unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidSelector(_)));
    assert!(!err.is_retryable());

    let recorded = events.events();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].reason, REASON_INVALID);
    assert_eq!(recorded[0].subject.name, "offloading");
    assert!(recorded[0].message.contains("spec.clusterSelector.nodeSelectorTerms[0].matchFields[0].values"));
    assert!(recorded[0].message.contains("must have one element"));
    assert_eq!(mc.desired_clusters("team-a"), ids(&["a"]), "previous decision untouched");
}

#[tokio::test]
async fn valid_matching_term_masks_broken_term() {
    let mc = cluster_of(vec![node("a", "eu"), node("b", "us")]);
    let events = Arc::new(RecordingReporter::new());
    let sel = selector(
        r#"
nodeSelectorTerms:
  - matchFields:
      - key: metadata.name
        operator: In
        values: []
  - matchExpressions:
      - key: region
        operator: Exists
"#,
    );
    let report = reconciler(&mc, &events).reconcile(&scope(), &sel).await.unwrap();
    assert_eq!(report.selected, ids(&["a", "b"]));
    assert!(events.events().is_empty());
}

#[tokio::test]
async fn error_on_a_later_candidate_leaves_earlier_matches_unwritten() {
    let mc = cluster_of(vec![node("a", "eu"), node("b", "us")]);
    let events = Arc::new(RecordingReporter::new());
    let sel = selector(
        r#"
nodeSelectorTerms:
  - matchExpressions:
      - key: cores
        operator: Gt
        values: [many]
  - matchExpressions:
      - key: region
        operator: In
        values: [eu]
"#,
    );
    let err = reconciler(&mc, &events).reconcile(&scope(), &sel).await.unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidSelector(_)), "{err:?}");
    assert_eq!(mc.write_count(), 0, "a matched but must not be written");
    assert!(mc.desired_clusters("team-a").is_empty());
    let recorded = events.events();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].message.contains("spec.clusterSelector.nodeSelectorTerms[0].matchExpressions[0].values[0]"));
}

#[tokio::test]
async fn registry_outage_is_reported_before_any_write() {
    let mc = cluster_of(vec![node("a", "eu")]);
    mc.fail_listing(true);
    let events = Arc::new(RecordingReporter::new());
    let err = reconciler(&mc, &events).reconcile(&scope(), &eu_only()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Registry(_)));
    assert_eq!(mc.write_count(), 0);
}
