//! One market's end-to-end run: discover → checkpoint → schedule → report.

use crate::artifact::ArtifactStore;
use crate::checkpoint::{CheckpointError, CheckpointRecord, CheckpointSet};
use crate::config::{ConfigError, MarketConfig};
use crate::provider::HistoryProvider;
use crate::scheduler::{FetchProgress, FetchScheduler, RunStats, SchedulerError};
use crate::universe::UniverseSource;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Run-level failures. Per-symbol problems never show up here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(
        "no work available: universe discovery produced nothing and there is no checkpoint at {}",
        path.display()
    )]
    NoWorkAvailable { path: PathBuf },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("checkpoint not persisted: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Pool(#[from] SchedulerError),
}

/// What the reporting side receives.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub market: String,
    pub stats: RunStats,
    /// Failed symbols after the run, with their last error.
    pub failures: Vec<CheckpointRecord>,
    /// Set when the final checkpoint flush failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_error: Option<String>,
}

/// A finished run.
#[derive(Debug)]
pub struct PipelineRun {
    pub report: RunReport,
    pub checkpoint: CheckpointSet,
    flush_error: Option<CheckpointError>,
}

impl PipelineRun {
    /// Split into the report and the outcome of the final checkpoint flush.
    /// The report is complete either way.
    pub fn finish(self) -> (RunReport, Result<(), PipelineError>) {
        let flushed = match self.flush_error {
            Some(e) => Err(PipelineError::Checkpoint(e)),
            None => Ok(()),
        };
        (self.report, flushed)
    }
}

pub struct Pipeline {
    config: MarketConfig,
    artifacts: ArtifactStore,
    scheduler: FetchScheduler,
}

impl Pipeline {
    /// Validate `config` and wire up the scheduler for it.
    pub fn new(config: MarketConfig, provider: Arc<dyn HistoryProvider>) -> Result<Self, PipelineError> {
        config.validate()?;
        let scheduler = FetchScheduler::new(&config, provider)?;
        Ok(Self {
            artifacts: ArtifactStore::new(&config.data_dir),
            config,
            scheduler,
        })
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &FetchScheduler {
        &self.scheduler
    }

    /// Produce the checkpoint set to run against.
    ///
    /// A non-empty discovered universe replaces the table (rebuilt and
    /// persisted). If discovery fails or comes back empty, the persisted
    /// checkpoint is resumed instead; with neither available the run aborts.
    pub fn prepare(&self, universe: Option<&dyn UniverseSource>) -> Result<CheckpointSet, PipelineError> {
        let store = self.scheduler.store();

        if let Some(source) = universe {
            match source.discover() {
                Ok(entries) if !entries.is_empty() => {
                    let set = store.rebuild(&entries, &self.artifacts, &self.config.freshness);
                    let counts = set.counts();
                    info!(
                        market = %self.config.market,
                        source = %source.describe(),
                        symbols = set.len(),
                        pending = counts.pending,
                        fresh = counts.skipped,
                        "universe discovered, checkpoint rebuilt"
                    );
                    if let Err(e) = store.persist(&set) {
                        error!(error = %e, "failed to persist rebuilt checkpoint");
                    }
                    return Ok(set);
                }
                Ok(_) => warn!(source = %source.describe(), "universe discovery returned no symbols"),
                Err(e) => warn!(error = %e, "universe discovery failed"),
            }
        }

        let set = store.load();
        if set.is_empty() {
            return Err(PipelineError::NoWorkAvailable {
                path: store.path().to_path_buf(),
            });
        }
        if universe.is_some() {
            warn!(path = %store.path().display(), records = set.len(), "resuming from existing checkpoint");
        } else {
            info!(path = %store.path().display(), records = set.len(), "resuming from checkpoint");
        }
        Ok(set)
    }

    /// Prepare, then fetch everything that is pending or failed.
    pub fn run(
        &self,
        universe: Option<&dyn UniverseSource>,
        progress: &dyn FetchProgress,
    ) -> Result<PipelineRun, PipelineError> {
        let checkpoint = self.prepare(universe)?;
        let result = self.scheduler.run(checkpoint, progress)?;

        let report = RunReport {
            market: self.config.market.clone(),
            stats: result.stats,
            failures: result.checkpoint.failures(),
            checkpoint_error: result.flush_error.as_ref().map(ToString::to_string),
        };
        Ok(PipelineRun {
            report,
            checkpoint: result.checkpoint,
            flush_error: result.flush_error,
        })
    }
}
