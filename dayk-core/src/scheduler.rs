//! Fetch scheduler: bounded worker pool over the dispatchable symbols.
//!
//! Workers run on a private `rayon` pool sized to the configured
//! concurrency. Each job sends its [`Outcome`] over an `mpsc` channel back to
//! the thread that called [`FetchScheduler::run`]; that thread alone mutates
//! the [`CheckpointSet`] and writes the checkpoint table, so updates are
//! applied one at a time in completion order.

use crate::artifact::ArtifactStore;
use crate::checkpoint::{CheckpointError, CheckpointSet, CheckpointStore, Status, UpdateResult};
use crate::config::{ConfigError, MarketConfig, SchedulePolicy};
use crate::cooldown::PoolCooldown;
use crate::provider::HistoryProvider;
use crate::worker::{FetchWorker, Outcome};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Observer for a scheduler run. Called on the scheduler's own thread.
pub trait FetchProgress {
    /// Called once before the first outcome, with the dispatch-set size.
    fn on_start(&self, total: usize);

    /// Called after each outcome has been applied to the checkpoint set.
    fn on_outcome(&self, outcome: &Outcome, done: usize, total: usize);

    /// Called once the run is over and stats are final.
    fn on_finish(&self, stats: &RunStats);
}

/// Progress observer that does nothing.
pub struct SilentProgress;

impl FetchProgress for SilentProgress {
    fn on_start(&self, _total: usize) {}
    fn on_outcome(&self, _outcome: &Outcome, _done: usize, _total: usize) {}
    fn on_finish(&self, _stats: &RunStats) {}
}

/// Aggregate statistics for one run.
///
/// `success` includes `skipped`: both mean the symbol needs nothing more.
/// `success + fail == total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Size of the dispatch set.
    pub total: usize,
    pub success: usize,
    pub fail: usize,
    /// Of `success`: artifacts actually downloaded this run.
    pub downloaded: usize,
    /// Of `success`: already fresh, or no data at the provider.
    pub skipped: usize,
    /// Checkpoint flushes that failed, final flush included.
    pub persist_failures: usize,
    /// Pool-wide pauses taken.
    pub cooldowns: usize,
    pub elapsed_secs: f64,
}

impl RunStats {
    fn record(&mut self, status: Status) {
        match status {
            Status::Success => {
                self.success += 1;
                self.downloaded += 1;
            }
            Status::Skipped => {
                self.success += 1;
                self.skipped += 1;
            }
            Status::Failed | Status::Pending => self.fail += 1,
        }
    }

    /// Whether the counters add up: every dispatched symbol is counted once.
    pub fn is_consistent(&self) -> bool {
        self.success + self.fail == self.total && self.downloaded + self.skipped == self.success
    }
}

/// What a completed run hands back.
#[derive(Debug)]
pub struct ScheduleResult {
    pub checkpoint: CheckpointSet,
    pub stats: RunStats,
    /// Set when the final, unconditional flush failed. The on-disk table is
    /// then the last snapshot that did persist.
    pub flush_error: Option<CheckpointError>,
}

/// Errors that stop a run before any symbol is dispatched.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Dispatches symbols to fetch workers and folds their outcomes into the
/// checkpoint.
pub struct FetchScheduler {
    market: String,
    worker: Arc<FetchWorker>,
    store: CheckpointStore,
    schedule: SchedulePolicy,
    cooldown: Arc<PoolCooldown>,
}

impl FetchScheduler {
    /// Build a scheduler for one market. The config is validated here, since
    /// the flush and cooldown cadences must be non-zero.
    pub fn new(config: &MarketConfig, provider: Arc<dyn HistoryProvider>) -> Result<Self, SchedulerError> {
        config.validate()?;
        let cooldown = Arc::new(PoolCooldown::new());
        let worker = FetchWorker::new(
            provider,
            ArtifactStore::new(&config.data_dir),
            config.freshness,
            config.fetch.clone(),
            Arc::clone(&cooldown),
        );
        Ok(Self {
            market: config.market.clone(),
            worker: Arc::new(worker),
            store: CheckpointStore::new(&config.checkpoint_path),
            schedule: config.schedule.clone(),
            cooldown,
        })
    }

    /// The checkpoint table this scheduler flushes to.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// The gate shared by every worker of this scheduler's pool.
    pub fn cooldown(&self) -> &PoolCooldown {
        &self.cooldown
    }

    /// Fetch every pending or failed symbol in `checkpoint`.
    pub fn run(
        &self,
        mut checkpoint: CheckpointSet,
        progress: &dyn FetchProgress,
    ) -> Result<ScheduleResult, SchedulerError> {
        let started = Instant::now();
        let dispatch = checkpoint.start_dispatch();
        let total = dispatch.len();

        progress.on_start(total);

        if total == 0 {
            info!(market = %self.market, "nothing to dispatch");
            let stats = RunStats::default();
            progress.on_finish(&stats);
            return Ok(ScheduleResult {
                checkpoint,
                stats,
                flush_error: None,
            });
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.schedule.concurrency)
            .thread_name(|i| format!("dayk-fetch-{i}"))
            .panic_handler(|_| error!("fetch worker panicked"))
            .build()?;

        info!(
            market = %self.market,
            total,
            workers = self.schedule.concurrency,
            "dispatching symbols"
        );

        let mut in_flight: HashSet<String> = dispatch.iter().map(|e| e.symbol_id.clone()).collect();
        let (tx, rx) = mpsc::channel::<Outcome>();
        for entry in dispatch {
            let tx = tx.clone();
            let worker = Arc::clone(&self.worker);
            pool.spawn(move || {
                let outcome = worker.fetch(&entry);
                // Receiver only goes away if the scheduler thread itself died
                let _ = tx.send(outcome);
            });
        }
        // The loop below ends once every job has dropped its sender
        drop(tx);

        let mut stats = RunStats {
            total,
            ..RunStats::default()
        };
        let mut done = 0usize;

        for outcome in rx {
            if !in_flight.remove(&outcome.symbol_id) {
                warn!(symbol = %outcome.symbol_id, "outcome for a symbol not in flight, ignored");
                continue;
            }
            self.apply(&mut checkpoint, &outcome);
            done += 1;
            stats.record(outcome.status);
            progress.on_outcome(&outcome, done, total);

            if done < total {
                self.between_completions(&checkpoint, done, &mut stats);
            }
        }

        // A panicked job never reports back; count it as failed.
        for symbol_id in in_flight {
            error!(symbol = %symbol_id, "no outcome received, marking failed");
            let outcome = Outcome {
                symbol_id,
                status: Status::Failed,
                error_detail: "worker panicked".into(),
                error_kind: None,
                attempts: 0,
                completed_at: Utc::now(),
            };
            self.apply(&mut checkpoint, &outcome);
            done += 1;
            stats.record(outcome.status);
            progress.on_outcome(&outcome, done, total);
        }

        let flush_error = match self.store.persist(&checkpoint) {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "final checkpoint flush failed");
                stats.persist_failures += 1;
                Some(e)
            }
        };

        stats.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            market = %self.market,
            total = stats.total,
            success = stats.success,
            fail = stats.fail,
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            elapsed_secs = stats.elapsed_secs,
            "run complete"
        );
        progress.on_finish(&stats);

        Ok(ScheduleResult {
            checkpoint,
            stats,
            flush_error,
        })
    }

    fn apply(&self, checkpoint: &mut CheckpointSet, outcome: &Outcome) {
        match checkpoint.apply(outcome) {
            UpdateResult::Applied => {}
            UpdateResult::Stale => {
                debug!(symbol = %outcome.symbol_id, "older outcome ignored");
            }
            UpdateResult::UnknownSymbol => {
                warn!(symbol = %outcome.symbol_id, "outcome for unknown symbol");
            }
        }
    }

    /// Periodic flush and pool-wide pause, driven by the completion count.
    fn between_completions(&self, checkpoint: &CheckpointSet, done: usize, stats: &mut RunStats) {
        if done % self.schedule.flush_every == 0 {
            match self.store.persist(checkpoint) {
                Ok(()) => debug!(done, "checkpoint flushed"),
                Err(e) => {
                    // Keep going; the next flush may succeed
                    error!(done, error = %e, "checkpoint flush failed, progress since last flush is at risk");
                    stats.persist_failures += 1;
                }
            }
        }

        if let Some(every) = self.schedule.cooldown_every {
            if done % every == 0 {
                let pause = self.schedule.cooldown_secs.sample_secs();
                info!(done, pause_secs = pause.as_secs(), "pausing worker pool");
                self.cooldown.trip(pause);
                stats.cooldowns += 1;
            }
        }
    }
}
