use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleetmap_core::{Candidate, LocalScope, NamespaceScope};
use fleetmap_kubehub::controller::{self, ControllerConfig};
use fleetmap_reconcile::{PassReport, ReconcileError, Reconciler};
use fleetmap_selector::CompiledSelector;
use fleetmap_store::{Fixture, MemoryCluster, RecordedEvent, RecordingReporter};
use k8s_openapi::api::core::v1::NodeSelector;
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fleetmapctl", version, about = "Map namespaces onto peered clusters by cluster selector")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long = "log", env = "FLEETMAP_LOG", global = true, default_value = "info")]
    log: String,

    /// Prometheus listener, host:port
    #[arg(long = "metrics-addr", env = "FLEETMAP_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    /// Label selector scoping local NamespaceMaps
    #[arg(long = "local-selector", env = "FLEETMAP_LOCAL_SELECTOR", global = true, default_value = "fleetmap.io/replicated!=true")]
    local_selector: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate a cluster selector against virtual nodes read from a file
    Match {
        /// YAML NodeSelector (nodeSelectorTerms: ...)
        #[arg(long = "selector")]
        selector: PathBuf,
        /// YAML list of nodes: clusterId, name, labels
        #[arg(long = "nodes")]
        nodes: PathBuf,
    },
    /// Run one offline pass over a fixture and print the resulting mappings
    Plan {
        /// YAML fixture with virtualNodes and namespaceMaps
        #[arg(long = "fixture")]
        fixture: PathBuf,
        #[arg(long = "selector")]
        selector: PathBuf,
        /// Local namespace being offloaded
        #[arg(long = "ns")]
        namespace: String,
        /// Remote namespace name (default: same as local)
        #[arg(long = "remote-ns")]
        remote_namespace: Option<String>,
    },
    /// Run one live pass for a NamespaceOffloading
    Reconcile {
        #[arg(long = "ns")]
        namespace: String,
        #[arg(long = "name", default_value = "offloading")]
        name: String,
        #[arg(long = "reporter", env = "FLEETMAP_REPORTER", default_value = "fleetmap-controller")]
        reporter: String,
    },
    /// Watch the cluster and reconcile continuously
    Run {
        /// Coalescing tick in milliseconds
        #[arg(long = "resync-ms", env = "FLEETMAP_RESYNC_MS", default_value_t = 250)]
        resync_ms: u64,
        /// Retry interval for failed passes in seconds
        #[arg(long = "retry-secs", default_value_t = 10)]
        retry_secs: u64,
        #[arg(long = "reporter", env = "FLEETMAP_REPORTER", default_value = "fleetmap-controller")]
        reporter: String,
    },
}

fn init_tracing(env: &str) {
    let filter = tracing_subscriber::EnvFilter::from_str(env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    if let Some(addr) = addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FLEETMAP_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct Verdict {
    node: String,
    cluster_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn verdicts(selector: &NodeSelector, nodes: &[Candidate]) -> Vec<Verdict> {
    let compiled = CompiledSelector::compile(selector);
    nodes
        .iter()
        .map(|n| {
            let (matched, error) = match compiled.matches(Some(n)) {
                Ok(m) => (Some(m), None),
                Err(e) => (None, Some(e.to_string())),
            };
            Verdict { node: n.name.clone(), cluster_id: n.cluster_id.to_string(), matched, error }
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<PassReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    events: Vec<RecordedEvent>,
    /// Clusters the namespace is desired on after the pass.
    desired: Vec<String>,
}

fn print_report(report: &PassReport) {
    for id in &report.selected { println!("+ {}", id); }
    for id in &report.deselected { println!("- {}", id); }
}

fn print_error(e: &ReconcileError) {
    eprintln!("pass failed: {}", e);
    if let ReconcileError::Convergence { failures, .. } = e {
        for f in failures {
            eprintln!("  {} {}: {}", f.op, f.cluster_id, f.error);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr.as_deref());
    let local_scope = LocalScope { label_selector: cli.local_selector.clone() };

    match cli.command {
        Commands::Match { selector, nodes } => {
            let selector: NodeSelector = read_yaml(&selector)?;
            let nodes: Vec<Candidate> = read_yaml(&nodes)?;
            info!(terms = selector.node_selector_terms.len(), nodes = nodes.len(), "match invoked");
            let out = verdicts(&selector, &nodes);
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:<24} RESULT", "NODE", "CLUSTER");
                    for v in &out {
                        let result = match (&v.matched, &v.error) {
                            (Some(true), _) => "match".to_string(),
                            (Some(false), _) => "no match".to_string(),
                            (None, Some(e)) => format!("error: {}", e),
                            (None, None) => "-".to_string(),
                        };
                        println!("{:<24} {:<24} {}", v.node, v.cluster_id, result);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Commands::Plan { fixture, selector, namespace, remote_namespace } => {
            let fixture: Fixture = read_yaml(&fixture)?;
            let selector: NodeSelector = read_yaml(&selector)?;
            info!(ns = %namespace, nodes = fixture.virtual_nodes.len(), maps = fixture.namespace_maps.len(), "plan invoked");
            let mc = Arc::new(MemoryCluster::from_fixture(fixture));
            let events = Arc::new(RecordingReporter::new());
            let reconciler = Reconciler::new(mc.clone(), mc.clone(), events.clone()).with_local_scope(local_scope);
            let mut scope = NamespaceScope::new(namespace.as_str(), "offloading");
            if let Some(remote) = remote_namespace {
                scope = scope.with_remote_namespace(remote);
            }
            let res = reconciler.reconcile(&scope, &selector).await;
            let desired: Vec<String> = mc.desired_clusters(&namespace).iter().map(ToString::to_string).collect();
            match cli.output {
                Output::Human => {
                    match &res {
                        Ok(report) => print_report(report),
                        Err(e) => print_error(e),
                    }
                    for ev in events.events() {
                        println!("event {} {}: {}", ev.reason, ev.subject, ev.message);
                    }
                    println!("desired on: {}", if desired.is_empty() { "-".to_string() } else { desired.join(", ") });
                }
                Output::Json => {
                    let out = PlanOutput {
                        report: res.as_ref().ok().cloned(),
                        error: res.as_ref().err().map(ToString::to_string),
                        events: events.events(),
                        desired,
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            res.map_err(|e| anyhow!(e))?;
        }
        Commands::Reconcile { namespace, name, reporter } => {
            info!(ns = %namespace, name = %name, "reconcile invoked");
            let client = fleetmap_kubehub::get_kube_client().await?;
            let cfg = ControllerConfig { reporter, local_scope, ..ControllerConfig::default() };
            match controller::reconcile_once(client, &cfg, &namespace, &name).await {
                Ok(report) => match cli.output {
                    Output::Human => print_report(&report),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                },
                Err(e) => {
                    error!(error = ?e, "reconcile failed");
                    match e.downcast_ref::<ReconcileError>() {
                        Some(re) => print_error(re),
                        None => eprintln!("reconcile error: {:#}", e),
                    }
                    return Err(e);
                }
            }
        }
        Commands::Run { resync_ms, retry_secs, reporter } => {
            let client = fleetmap_kubehub::get_kube_client().await?;
            let cfg = ControllerConfig {
                resync: Duration::from_millis(resync_ms.max(1)),
                retry: Duration::from_secs(retry_secs.max(1)),
                reporter,
                local_scope,
            };
            info!(?cfg, "run invoked");
            controller::run(client, cfg).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts_report_matches_and_errors() {
        let selector: NodeSelector = serde_yaml::from_str(
            r#"
nodeSelectorTerms:
  - matchExpressions:
      - key: region
        operator: In
        values: [eu]
"#,
        )
        .unwrap();
        let nodes = vec![
            Candidate::new("a", "vk-a").with_label("region", "eu"),
            Candidate::new("b", "vk-b").with_label("region", "us"),
        ];
        let out = verdicts(&selector, &nodes);
        assert_eq!(out[0].matched, Some(true));
        assert_eq!(out[1].matched, Some(false));

        let broken: NodeSelector = serde_yaml::from_str(
            r#"
nodeSelectorTerms:
  - matchExpressions:
      - key: region
        operator: Gt
        values: [eu]
"#,
        )
        .unwrap();
        let out = verdicts(&broken, &nodes);
        assert!(out.iter().all(|v| v.matched.is_none() && v.error.is_some()));
    }

    #[test]
    fn cli_parses_plan() {
        let cli = Cli::try_parse_from([
            "fleetmapctl", "-o", "json", "plan", "--fixture", "f.yaml", "--selector", "s.yaml", "--ns", "team-a",
        ])
        .unwrap();
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::Plan { ref namespace, remote_namespace: None, .. } if namespace == "team-a"));
    }
}
