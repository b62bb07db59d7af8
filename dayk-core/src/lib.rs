//! dayk core: checkpointed, resumable daily-price fetch pipeline.
//!
//! This crate provides:
//! - Symbol entries and deterministic artifact naming
//! - Freshness policy (same-day or size-only) over stored artifacts
//! - Atomic per-symbol artifact writes
//! - Durable CSV checkpoint table with atomic flushes
//! - Fetch worker with jittered retries and no-data detection
//! - Bounded worker pool scheduler with periodic flush and pool cooldown
//! - Universe sources and the Yahoo Finance history provider
//! - Per-market configuration presets

pub mod artifact;
pub mod checkpoint;
pub mod config;
pub mod cooldown;
pub mod freshness;
pub mod pipeline;
pub mod provider;
pub mod scheduler;
pub mod symbol;
pub mod universe;
pub mod worker;

pub use artifact::{ArtifactError, ArtifactStore};
pub use checkpoint::{
    CheckpointError, CheckpointRecord, CheckpointSet, CheckpointStore, Status, StatusCounts,
    UpdateResult,
};
pub use config::{ConfigError, FetchPolicy, JitterRange, MarketConfig, SchedulePolicy};
pub use cooldown::PoolCooldown;
pub use freshness::{ArtifactRef, Cadence, FreshnessPolicy};
pub use pipeline::{Pipeline, PipelineError, PipelineRun, RunReport};
pub use provider::{DailyBar, ErrorKind, HistoryProvider, Lookback, ProviderError, YahooProvider};
pub use scheduler::{FetchProgress, FetchScheduler, RunStats, ScheduleResult, SchedulerError, SilentProgress};
pub use symbol::{dedup_entries, SymbolEntry};
pub use universe::{
    DailyCachedUniverse, JsonUniverse, ListFileUniverse, StaticUniverse, TomlUniverse,
    UniverseError, UniverseSource,
};
pub use worker::{Delay, FetchWorker, Outcome, Sleeper, ThreadSleeper};
