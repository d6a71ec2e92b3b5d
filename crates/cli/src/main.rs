#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use hydra_apply::{OnConverged, PriorityGate, ReconcileConfig, ReconcileHandle, ReconcileSummary, Reconciler};
use hydra_core::{Gvk, Tables};
use hydra_gateway::{build_router, GatewayState};
use hydra_kubehub::{KubeTarget, MemoryTarget, TargetApi};
use hydra_loader::{load_snapshot, Snapshot};
use hydra_store::{rewrite_node_addresses, service_network};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hydractl", version, about = "Hydrate a must-gather snapshot into a Kubernetes API server")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Root of the extracted snapshot
    #[arg(long = "data-dir", env = "HYDRA_DATA_DIR", global = true, default_value = "/data")]
    data_dir: PathBuf,

    /// Extra type to never replay, e.g. "v1/ConfigMap" or "apps/v1/Deployment" (repeatable)
    #[arg(long = "exclude", global = true, action = ArgAction::Append, value_parser = parse_gvk)]
    exclude: Vec<Gvk>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the snapshot and report what would be hydrated, without contacting any API server
    Inspect,
    /// Hydrate the target API server and serve captured logs until interrupted
    Run {
        /// Leave node addresses as captured (log retrieval through the API server will not work)
        #[arg(long = "disable-logs", action = ArgAction::SetTrue)]
        disable_logs: bool,
        /// Log gateway listen address
        #[arg(long = "listen", env = "HYDRA_LISTEN", default_value = "0.0.0.0:10250")]
        listen: SocketAddr,
        /// latch | every-pass | advisory
        #[arg(long = "priority-gate", default_value = "latch")]
        priority_gate: PriorityGate,
        /// continue | stop
        #[arg(long = "on-converged", default_value = "continue")]
        on_converged: OnConverged,
        /// Largest backoff exponent; delays grow as 2^n seconds
        #[arg(long = "backoff-cap", default_value_t = 5)]
        backoff_cap: u32,
        /// Buckets applied concurrently after the priority types
        #[arg(long = "bucket-concurrency", default_value_t = 4)]
        bucket_concurrency: usize,
        /// Hydrate into an in-memory target instead of a live API server
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("HYDRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HYDRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid HYDRA_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_gvk(key: &str) -> Result<Gvk, String> {
    Gvk::parse_key(key).ok_or_else(|| format!("invalid GVK key '{}' (expected v1/Kind or group/v1/Kind)", key))
}

#[derive(Serialize)]
struct BucketRow {
    gvk: String,
    records: usize,
}

#[derive(Serialize)]
struct InspectReport<'a> {
    root: &'a std::path::Path,
    buckets: Vec<BucketRow>,
    report: &'a hydra_loader::LoadReport,
    logs: Vec<&'a str>,
    service_network: String,
}

fn inspect(snap: &Snapshot, output: Output) -> Result<()> {
    let report = InspectReport {
        root: &snap.root,
        buckets: snap.cache.buckets().map(|b| BucketRow { gvk: b.gvk().to_string(), records: b.len() }).collect(),
        report: &snap.report,
        logs: snap.logs.entries().into_iter().map(|(k, _)| k).collect(),
        service_network: service_network(&snap.cache),
    };
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Output::Human => {
            println!("snapshot: {}", report.root.display());
            println!("{:<64} {}", "GVK", "RECORDS");
            for b in &report.buckets {
                println!("{:<64} {}", b.gvk, b.records);
            }
            println!(
                "documents: {}  cached: {}  excluded: {}  skipped: {}",
                report.report.documents,
                report.report.cached,
                report.report.excluded,
                report.report.skipped.len()
            );
            for s in &report.report.skipped {
                println!("  skipped {}: {}", s.path.display(), s.reason);
            }
            println!("log paths: {}", report.logs.len());
            for l in &report.logs {
                println!("  {}", l);
            }
            println!("service network: {}", report.service_network);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct RunSummary {
    passes: u64,
    converged: bool,
    cancelled: bool,
    remaining: usize,
    remaining_by_type: Vec<BucketRow>,
}

impl From<&ReconcileSummary> for RunSummary {
    fn from(s: &ReconcileSummary) -> Self {
        let remaining_by_type = s
            .last
            .as_ref()
            .map(|r| r.remaining_by_type.iter().map(|(g, n)| BucketRow { gvk: g.to_string(), records: *n }).collect())
            .unwrap_or_default();
        Self { passes: s.passes, converged: s.converged, cancelled: s.cancelled, remaining: s.remaining, remaining_by_type }
    }
}

fn print_summary(summary: &ReconcileSummary, output: Output) -> Result<()> {
    let row = RunSummary::from(summary);
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&row)?),
        Output::Human => {
            let state = if row.converged { "converged" } else if row.cancelled { "cancelled" } else { "stopped" };
            println!("hydration {} after {} passes, {} resources remaining", state, row.passes, row.remaining);
            for b in &row.remaining_by_type {
                println!("  {:<64} {}", b.gvk, b.records);
            }
        }
    }
    Ok(())
}

async fn run(
    mut snap: Snapshot,
    tables: Tables,
    output: Output,
    disable_logs: bool,
    listen: SocketAddr,
    config: ReconcileConfig,
    dry_run: bool,
) -> Result<()> {
    if disable_logs {
        info!("log access disabled; node addresses left as captured");
    } else if let Err(e) = rewrite_node_addresses(&mut snap.cache) {
        warn!(error = %e, "unable to rewrite node addresses, log retrieval will be broken");
    }
    info!(service_network = %service_network(&snap.cache), "cluster service network");

    let target: Arc<dyn TargetApi> = if dry_run {
        info!("dry run: hydrating into an in-memory target");
        Arc::new(MemoryTarget::new())
    } else {
        Arc::new(KubeTarget::try_default().await?)
    };

    let listener = hydra_gateway::bind(listen).await?;
    let logs = Arc::new(snap.logs);
    info!(
        gate = %config.priority_gate,
        on_converged = %config.on_converged,
        concurrency = config.bucket_concurrency,
        pending = snap.cache.pending_total(),
        "starting reconciliation"
    );
    let handle = Reconciler::new(snap.cache, target, tables.priority, config).spawn();
    let router = build_router(GatewayState { logs, status: Some(handle.status()) });
    let mut gateway = tokio::spawn(hydra_gateway::serve(listener, router));

    let ReconcileHandle { status: _, cancel, mut task } = handle;
    let summary = tokio::select! {
        res = &mut task => res.context("reconcile task failed")?,
        _ = signal::ctrl_c() => {
            info!("interrupt received, stopping reconciliation");
            cancel.cancel();
            task.await.context("reconcile task failed")?
        }
        res = &mut gateway => {
            match res {
                Ok(Ok(())) => error!("log gateway exited"),
                Ok(Err(e)) => error!(error = %e, "log gateway failed"),
                Err(e) => error!(error = %e, "log gateway task failed"),
            }
            anyhow::bail!("log gateway is no longer serving");
        }
    };
    gateway.abort();
    print_summary(&summary, output)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let tables = Tables::default().with_extra_exclusions(cli.exclude.iter().cloned());
    let snap = load_snapshot(&cli.data_dir, &tables)?;

    match cli.command {
        Commands::Inspect => inspect(&snap, cli.output),
        Commands::Run { disable_logs, listen, priority_gate, on_converged, backoff_cap, bucket_concurrency, dry_run } => {
            let config = ReconcileConfig { priority_gate, on_converged, backoff_cap, bucket_concurrency, ..ReconcileConfig::default() };
            run(snap, tables, cli.output, disable_logs, listen, config, dry_run).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse_into_config_values() {
        let cli = Cli::try_parse_from([
            "hydractl", "--exclude", "v1/ConfigMap", "run", "--priority-gate", "advisory", "--on-converged", "stop", "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.exclude, vec![Gvk::new("", "v1", "ConfigMap")]);
        match cli.command {
            Commands::Run { priority_gate, on_converged, dry_run, backoff_cap, .. } => {
                assert_eq!(priority_gate, PriorityGate::Advisory);
                assert_eq!(on_converged, OnConverged::Stop);
                assert!(dry_run);
                assert_eq!(backoff_cap, 5);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn bad_gvk_keys_are_rejected() {
        assert!(Cli::try_parse_from(["hydractl", "--exclude", "ConfigMap", "inspect"]).is_err());
    }
}
