//! Reconciliation loop.
//!
//! Each pass applies the priority types in list order, then every other non-empty bucket. Records
//! that fail stay pending and are retried on the next pass after an exponential backoff. Progress
//! is published as a [`HydrationStatus`] snapshot readers can load without locking.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use futures::StreamExt;
use hydra_core::{BucketStatus, Gvk, HydrationStatus, PriorityList};
use hydra_kubehub::TargetApi;
use hydra_store::ResourceCache;
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashSet;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{apply_bucket, ApplyStats};

/// How the priority phase gates the general phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PriorityGate {
    /// Priority types are retried until none is pending, then never revisited. The general phase
    /// waits for that.
    #[default]
    Latch,
    /// Priority phase runs every pass; the general phase only runs on passes it left clean.
    EveryPass,
    /// Priority phase runs first every pass but never blocks the general phase.
    Advisory,
}

impl FromStr for PriorityGate {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latch" => Ok(Self::Latch),
            "every-pass" => Ok(Self::EveryPass),
            "advisory" => Ok(Self::Advisory),
            other => Err(format!("unknown priority gate '{}' (expected latch, every-pass or advisory)", other)),
        }
    }
}

impl fmt::Display for PriorityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Latch => "latch",
            Self::EveryPass => "every-pass",
            Self::Advisory => "advisory",
        })
    }
}

/// What the loop does once a pass leaves nothing pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnConverged {
    #[default]
    Continue,
    Stop,
}

impl FromStr for OnConverged {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Self::Continue),
            "stop" => Ok(Self::Stop),
            other => Err(format!("unknown convergence action '{}' (expected continue or stop)", other)),
        }
    }
}

impl fmt::Display for OnConverged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Continue => "continue",
            Self::Stop => "stop",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub priority_gate: PriorityGate,
    pub on_converged: OnConverged,
    pub backoff_start: u32,
    pub backoff_cap: u32,
    pub backoff_unit: Duration,
    /// Buckets applied concurrently in the general phase.
    pub bucket_concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            priority_gate: PriorityGate::default(),
            on_converged: OnConverged::default(),
            backoff_start: 1,
            backoff_cap: 5,
            backoff_unit: Duration::from_secs(1),
            bucket_concurrency: 4,
        }
    }
}

/// `2^exp` units; the exponent grows by one per call until it reaches the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    exp: u32,
    cap: u32,
    unit: Duration,
}

impl Backoff {
    pub fn new(start: u32, cap: u32, unit: Duration) -> Self {
        Self { exp: start.min(cap), cap, unit }
    }

    pub fn from_config(cfg: &ReconcileConfig) -> Self {
        Self::new(cfg.backoff_start, cfg.backoff_cap, cfg.backoff_unit)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.unit.saturating_mul(2u32.saturating_pow(self.exp));
        if self.exp < self.cap {
            self.exp += 1;
        }
        delay
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub pass: u64,
    /// Priority buckets that had pending records and were attempted.
    pub priority_attempted: usize,
    pub priority_done: bool,
    pub general_attempted: usize,
    pub stats: ApplyStats,
    pub remaining: usize,
    pub remaining_by_type: Vec<(Gvk, usize)>,
}

impl PassReport {
    pub fn converged(&self) -> bool { self.remaining == 0 }
}

#[derive(Debug, Clone)]
pub struct ReconcileSummary {
    pub passes: u64,
    pub converged: bool,
    pub cancelled: bool,
    pub last: Option<PassReport>,
    pub remaining: usize,
}

/// Read side of the published status.
#[derive(Clone)]
pub struct StatusHandle {
    snap: Arc<ArcSwap<HydrationStatus>>,
    pass_rx: watch::Receiver<u64>,
}

impl StatusHandle {
    pub fn current(&self) -> Arc<HydrationStatus> { self.snap.load_full() }
    /// Changes each time a pass completes; the value is the pass number.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.pass_rx.clone() }
}

/// Stops the loop at the next pass boundary or during backoff. Dropping it does not cancel.
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// A spawned reconciliation loop.
pub struct ReconcileHandle {
    pub status: StatusHandle,
    pub cancel: CancelHandle,
    pub task: JoinHandle<ReconcileSummary>,
}

impl ReconcileHandle {
    pub fn status(&self) -> StatusHandle { self.status.clone() }

    /// Wait for the loop to end on its own.
    pub async fn join(self) -> Result<ReconcileSummary> {
        self.task.await.context("reconcile task failed")
    }

    /// Cancel, then wait for the loop to wind down.
    pub async fn shutdown(self) -> Result<ReconcileSummary> {
        self.cancel.cancel();
        self.task.await.context("reconcile task failed")
    }
}

/// Owns the cache for the lifetime of the loop; it is the only writer.
pub struct Reconciler {
    cache: ResourceCache,
    target: Arc<dyn TargetApi>,
    priority: PriorityList,
    config: ReconcileConfig,
    priority_done: bool,
    pass: u64,
    status: Arc<ArcSwap<HydrationStatus>>,
    pass_tx: watch::Sender<u64>,
}

impl Reconciler {
    pub fn new(cache: ResourceCache, target: Arc<dyn TargetApi>, priority: PriorityList, config: ReconcileConfig) -> Self {
        let initial = HydrationStatus {
            total_remaining: cache.pending_total(),
            buckets: bucket_status(&cache.pending_by_type()),
            ..HydrationStatus::default()
        };
        let (pass_tx, _) = watch::channel(0u64);
        Self {
            cache,
            target,
            priority,
            config,
            priority_done: false,
            pass: 0,
            status: Arc::new(ArcSwap::from_pointee(initial)),
            pass_tx,
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle { snap: Arc::clone(&self.status), pass_rx: self.pass_tx.subscribe() }
    }

    pub fn cache(&self) -> &ResourceCache { &self.cache }

    /// Run one pass over the cache and publish the resulting status.
    pub async fn run_pass(&mut self) -> PassReport {
        self.pass += 1;
        let started = Instant::now();
        let mut report = PassReport { pass: self.pass, ..PassReport::default() };
        let mut attempted: FxHashSet<Gvk> = FxHashSet::default();

        let enter_priority = !(self.config.priority_gate == PriorityGate::Latch && self.priority_done);
        if enter_priority {
            let order: Vec<Gvk> = self.priority.iter().cloned().collect();
            for gvk in order {
                let records = self.cache.take_pending(&gvk);
                attempted.insert(gvk.clone());
                if records.is_empty() {
                    continue;
                }
                debug!(pass = self.pass, gvk = %gvk, records = records.len(), "applying priority bucket");
                report.priority_attempted += 1;
                let out = apply_bucket(self.target.as_ref(), gvk.clone(), records).await;
                report.stats.merge(out.stats);
                self.cache.restore_pending(&gvk, out.pending);
            }
            let left: usize = self.priority.iter().filter_map(|g| self.cache.bucket(g)).map(|b| b.len()).sum();
            self.priority_done = left == 0;
            if left > 0 {
                info!(pass = self.pass, remaining = left, "priority resources still pending");
            }
        }
        report.priority_done = self.priority_done;

        let general_allowed = match self.config.priority_gate {
            PriorityGate::Latch | PriorityGate::EveryPass => self.priority_done,
            PriorityGate::Advisory => true,
        };
        if general_allowed {
            let work: Vec<(Gvk, Vec<_>)> = self
                .cache
                .gvks()
                .into_iter()
                .filter(|g| !attempted.contains(g))
                .filter_map(|g| {
                    let records = self.cache.take_pending(&g);
                    if records.is_empty() { None } else { Some((g, records)) }
                })
                .collect();
            report.general_attempted = work.len();
            let target = Arc::clone(&self.target);
            let outcomes: Vec<_> = futures::stream::iter(work)
                .map(|(gvk, records)| apply_bucket(target.as_ref(), gvk, records))
                .buffer_unordered(self.config.bucket_concurrency.max(1))
                .collect()
                .await;
            for out in outcomes {
                report.stats.merge(out.stats);
                self.cache.restore_pending(&out.gvk, out.pending);
            }
        } else {
            debug!(pass = self.pass, "general phase gated on priority resources");
        }

        report.remaining = self.cache.pending_total();
        report.remaining_by_type = self.cache.pending_by_type();
        let elapsed = started.elapsed();
        counter!("hydra_passes_total", 1u64);
        gauge!("hydra_pending_records", report.remaining as f64);
        histogram!("hydra_pass_ms", elapsed.as_secs_f64() * 1000.0);
        info!(
            pass = report.pass,
            applied = report.stats.applied,
            failed = report.stats.failed,
            remaining = report.remaining,
            priority_done = report.priority_done,
            took_ms = %elapsed.as_millis(),
            "reconcile pass finished"
        );
        self.publish(&report);
        report
    }

    fn publish(&self, report: &PassReport) {
        self.status.store(Arc::new(HydrationStatus {
            pass: report.pass,
            priority_done: report.priority_done,
            converged: report.converged(),
            total_remaining: report.remaining,
            buckets: bucket_status(&report.remaining_by_type),
            last_pass_at: Some(chrono::Utc::now()),
        }));
        self.pass_tx.send_replace(report.pass);
    }

    /// Loop until cancelled or, with [`OnConverged::Stop`], until a pass leaves nothing pending.
    pub async fn run(mut self, cancel: oneshot::Receiver<()>) -> ReconcileSummary {
        let mut cancel = Some(cancel);
        let mut backoff = Backoff::from_config(&self.config);
        let mut summary = ReconcileSummary { passes: 0, converged: false, cancelled: false, last: None, remaining: self.cache.pending_total() };
        loop {
            if cancel_requested(&mut cancel) {
                summary.cancelled = true;
                break;
            }
            let report = self.run_pass().await;
            summary.passes += 1;
            summary.converged = report.converged();
            summary.remaining = report.remaining;
            if summary.converged {
                info!(pass = report.pass, "no errors found in reconciliation");
            } else {
                error!(pass = report.pass, remaining = report.remaining, "unable to apply all resources");
            }
            summary.last = Some(report);
            if summary.converged && self.config.on_converged == OnConverged::Stop {
                break;
            }
            let delay = backoff.next_delay();
            debug!(delay_ms = %delay.as_millis(), "backing off");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            tokio::select! {
                _ = &mut sleep => {}
                true = wait_cancel(&mut cancel) => {
                    summary.cancelled = true;
                    break;
                }
            }
        }
        info!(passes = summary.passes, converged = summary.converged, cancelled = summary.cancelled, "reconcile loop stopped");
        summary
    }

    /// Run the loop on the tokio runtime.
    pub fn spawn(self) -> ReconcileHandle {
        let status = self.status_handle();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(self.run(rx));
        ReconcileHandle { status, cancel: CancelHandle { tx: Some(tx) }, task }
    }
}

fn bucket_status(by_type: &[(Gvk, usize)]) -> Vec<BucketStatus> {
    by_type.iter().map(|(g, n)| BucketStatus { gvk: g.to_string(), remaining: *n }).collect()
}

fn cancel_requested(rx: &mut Option<oneshot::Receiver<()>>) -> bool {
    let Some(r) = rx.as_mut() else { return false };
    match r.try_recv() {
        Ok(()) => true,
        Err(oneshot::error::TryRecvError::Empty) => false,
        Err(oneshot::error::TryRecvError::Closed) => {
            *rx = None;
            false
        }
    }
}

/// Resolves to true on an explicit cancel; a dropped sender resolves to false once and is forgotten.
async fn wait_cancel(rx: &mut Option<oneshot::Receiver<()>>) -> bool {
    let outcome = match rx.as_mut() {
        Some(r) => r.await,
        None => std::future::pending().await,
    };
    match outcome {
        Ok(()) => true,
        Err(_) => {
            *rx = None;
            false
        }
    }
}
