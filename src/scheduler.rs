//! Periodic evaluation of every active site.
//!
//! Each tick:
//!   1. resolves PENDING alerts older than the configured age to ERROR
//!   2. lists active sites
//!   3. on a bounded worker pool, per site: collects a fresh snapshot when
//!      the latest is older than the collection interval, then evaluates
//!
//! A site's failure, including a panic, is logged and counted; it never
//! aborts the batch. Shutdown lets sites already running finish and skips
//! the rest; any PENDING alert still on record afterwards is resolved to
//! ERROR before the loop returns.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use rayon::prelude::*;

use crate::alert::stalenesses::reconcile_stale_pending;
use crate::config::SchedulerConfig;
use crate::error::ConfigError;
use crate::ingest::FeatureCollector;
use crate::logging::{Source, log_cycle_summary, log_evaluation_failure};
use crate::model::Site;
use crate::pipeline::{AlertOutcome, EvaluationOutcome, SiteEvaluator};
use crate::storage::Storage;

// ---------------------------------------------------------------------------
// Cycle summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Active sites at the start of the cycle.
    pub total: usize,
    pub evaluated: usize,
    pub failed: usize,
    /// Sites not started because shutdown was requested.
    pub skipped: usize,
    pub collected: usize,
    pub alerts_dispatched: usize,
    pub alerts_suppressed: usize,
    /// Stale PENDING alerts resolved by the sweep.
    pub reconciled: usize,
}

enum SiteResult {
    Evaluated { outcome: EvaluationOutcome, collected: bool },
    Failed { collected: bool },
    Skipped,
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Stops a running scheduler. Cloneable; any clone may trigger it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stopping: Arc<AtomicBool>,
    wake: Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // A full channel means a wake-up is already queued.
        let _ = self.wake.try_send(());
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct SiteEvaluationScheduler {
    evaluator: Arc<SiteEvaluator>,
    collector: Option<FeatureCollector>,
    config: SchedulerConfig,
    pool: rayon::ThreadPool,
    stopping: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl SiteEvaluationScheduler {
    pub fn new(evaluator: Arc<SiteEvaluator>, config: SchedulerConfig) -> Result<Self, ConfigError> {
        // rayon reads 0 as "one per CPU"
        if config.worker_limit == 0 {
            return Err(ConfigError::Invalid("scheduler.worker_limit must be at least 1".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_limit)
            .thread_name(|i| format!("site-worker-{}", i))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("cannot start {} workers: {}", config.worker_limit, e)))?;
        let (wake_tx, wake_rx) = bounded(1);

        Ok(Self {
            evaluator,
            collector: None,
            config,
            pool,
            stopping: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        })
    }

    /// Collect fresh snapshots before evaluating.
    pub fn with_collector(mut self, collector: FeatureCollector) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stopping: self.stopping.clone(),
            wake: self.wake_tx.clone(),
        }
    }

    fn storage(&self) -> &dyn Storage {
        self.evaluator.storage().as_ref()
    }

    /// Runs one cycle as of `now`.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> CycleSummary {
        let mut summary = CycleSummary::default();

        match reconcile_stale_pending(self.storage(), self.config.pending_alert_max_age(), now) {
            Ok(count) => summary.reconciled = count,
            Err(e) => tracing::error!(source = %Source::Storage, error = %e, "pending alert sweep failed"),
        }

        let sites = match self.storage().active_sites() {
            Ok(sites) => sites,
            Err(e) => {
                tracing::error!(source = %Source::Storage, error = %e, "cannot list active sites; skipping cycle");
                return summary;
            }
        };
        summary.total = sites.len();

        let results: Vec<SiteResult> = self
            .pool
            .install(|| sites.par_iter().map(|site| self.process_site(site, now)).collect());

        for result in results {
            match result {
                SiteResult::Evaluated { outcome, collected } => {
                    summary.evaluated += 1;
                    summary.collected += usize::from(collected);
                    match outcome.alert {
                        AlertOutcome::Dispatched(_) => summary.alerts_dispatched += 1,
                        AlertOutcome::Suppressed { .. } => summary.alerts_suppressed += 1,
                        AlertOutcome::NotRequired => {}
                    }
                }
                SiteResult::Failed { collected } => {
                    summary.failed += 1;
                    summary.collected += usize::from(collected);
                }
                SiteResult::Skipped => summary.skipped += 1,
            }
        }

        log_cycle_summary(
            summary.total,
            summary.evaluated,
            summary.failed,
            summary.alerts_dispatched,
            summary.alerts_suppressed,
        );
        summary
    }

    fn process_site(&self, site: &Site, now: DateTime<Utc>) -> SiteResult {
        if self.stopping.load(Ordering::SeqCst) {
            return SiteResult::Skipped;
        }

        let mut collected = false;
        let result = catch_unwind(AssertUnwindSafe(|| {
            collected = self.collect_if_due(site, now);
            self.evaluator.evaluate_site_at(&site.id, now)
        }));

        match result {
            Ok(Ok(outcome)) => SiteResult::Evaluated { outcome, collected },
            Ok(Err(e)) => {
                log_evaluation_failure(&site.id, &e);
                SiteResult::Failed { collected }
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(source = %Source::Scheduler, site_id = %site.id, reason = %reason, "site evaluation panicked");
                SiteResult::Failed { collected }
            }
        }
    }

    fn collect_if_due(&self, site: &Site, now: DateTime<Utc>) -> bool {
        let Some(collector) = &self.collector else {
            return false;
        };
        let due = match collector.needs_collection(&site.id, self.config.collection_interval(), now) {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(source = %Source::Weather, site_id = %site.id, error = %e, "cannot check snapshot age");
                return false;
            }
        };
        if !due {
            return false;
        }
        match collector.collect_site(site, now) {
            Ok(_) => true,
            Err(e) => {
                // Evaluation still runs on the previous snapshot until it goes stale.
                tracing::warn!(source = %Source::Weather, site_id = %site.id, error = %e, "feature collection failed");
                false
            }
        }
    }

    /// Runs a cycle immediately, then one per interval until shut down.
    pub fn run(&self) {
        tracing::info!(
            source = %Source::Scheduler,
            interval_secs = self.config.interval_secs,
            workers = self.config.worker_limit,
            "scheduler started"
        );

        let ticker = tick(self.config.interval());
        while !self.stopping.load(Ordering::SeqCst) {
            self.run_cycle(Utc::now());
            select! {
                recv(ticker) -> _ => {}
                recv(self.wake_rx) -> _ => {}
            }
        }

        let resolved = self.resolve_abandoned_alerts(Utc::now());
        tracing::info!(source = %Source::Scheduler, resolved_alerts = resolved, "scheduler stopped");
    }

    /// Resolves every PENDING alert created before `now` to ERROR. Only
    /// called once no cycle is running, so none of them can still complete.
    pub fn resolve_abandoned_alerts(&self, now: DateTime<Utc>) -> usize {
        match reconcile_stale_pending(self.storage(), Duration::zero(), now) {
            Ok(0) => 0,
            Ok(count) => {
                tracing::warn!(source = %Source::Scheduler, count, "in-flight alerts resolved on shutdown");
                count
            }
            Err(e) => {
                tracing::error!(source = %Source::Storage, error = %e, "cannot resolve in-flight alerts on shutdown");
                0
            }
        }
    }
}
