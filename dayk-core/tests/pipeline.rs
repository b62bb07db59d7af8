//! End-to-end runs against a scripted provider: no network, real files.

use chrono::{NaiveDate, Utc};
use dayk_core::{
    ArtifactStore, CheckpointRecord, CheckpointSet, CheckpointStore, DailyBar, FetchProgress,
    HistoryProvider, Lookback, MarketConfig, Outcome, Pipeline, PipelineError, ProviderError,
    RunStats, SilentProgress, StaticUniverse, Status, SymbolEntry, UniverseError, UniverseSource,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Series,
    NoData,
    Empty,
    Timeout,
    RateLimitedOnce,
    TimeoutOnce,
}

/// Answers each symbol according to a fixed behavior and counts calls.
struct ScriptedProvider {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedProvider {
    fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .iter()
                .map(|(s, b)| (s.to_string(), *b))
                .collect(),
            calls: Mutex::new(HashMap::new()),
        })
    }

    fn calls(&self, symbol: &str) -> u32 {
        self.calls.lock().unwrap().get(symbol).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

fn series() -> Vec<DailyBar> {
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    (0..40)
        .map(|i| DailyBar {
            date: start + chrono::Duration::days(i),
            open: 100.0 + i as f64,
            high: 101.0 + i as f64,
            low: 99.0 + i as f64,
            close: 100.5 + i as f64,
            adj_close: 100.5 + i as f64,
            volume: 10_000 + i as u64,
        })
        .collect()
}

impl HistoryProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch_history(&self, symbol: &str, window: Lookback) -> Result<Vec<DailyBar>, ProviderError> {
        assert_eq!(window, Lookback::Years(2));
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(symbol.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        match self.behaviors.get(symbol).copied().unwrap_or(Behavior::Series) {
            Behavior::Series => Ok(series()),
            Behavior::NoData => Err(ProviderError::no_data("No data found, symbol may be delisted")),
            Behavior::Empty => Ok(Vec::new()),
            Behavior::Timeout => Err(ProviderError::timeout("operation timed out")),
            Behavior::RateLimitedOnce if call == 1 => {
                Err(ProviderError::rate_limited("Too Many Requests"))
            }
            Behavior::TimeoutOnce if call == 1 => Err(ProviderError::timeout("operation timed out")),
            Behavior::RateLimitedOnce | Behavior::TimeoutOnce => Ok(series()),
        }
    }
}

struct FailingUniverse;

impl UniverseSource for FailingUniverse {
    fn describe(&self) -> String {
        "failing".into()
    }

    fn discover(&self) -> Result<Vec<SymbolEntry>, UniverseError> {
        Err(UniverseError::Parse {
            path: "listing.html".into(),
            message: "unexpected page layout".into(),
        })
    }
}

/// Collects every outcome the scheduler reports.
#[derive(Default)]
struct Recorder {
    outcomes: Mutex<Vec<Outcome>>,
    finished: Mutex<Option<RunStats>>,
}

impl FetchProgress for Recorder {
    fn on_start(&self, _total: usize) {}

    fn on_outcome(&self, outcome: &Outcome, _done: usize, _total: usize) {
        self.outcomes.lock().unwrap().push(outcome.clone());
    }

    fn on_finish(&self, stats: &RunStats) {
        *self.finished.lock().unwrap() = Some(stats.clone());
    }
}

fn config(dir: &Path) -> MarketConfig {
    let mut config = MarketConfig::tw().with_zero_delays();
    config.data_dir = dir.join("data/dayK");
    config.checkpoint_path = dir.join("logs/checkpoint.csv");
    config.fetch.provider_suffix = None;
    config.schedule.concurrency = 4;
    config
}

fn universe(items: &[&str]) -> StaticUniverse {
    StaticUniverse::from_items(items.iter().copied())
}

fn status_of(set: &CheckpointSet, symbol: &str) -> Status {
    set.get(symbol).map(|r| r.status).unwrap()
}

#[test]
fn valid_series_and_no_data_end_success_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[("AAA", Behavior::Series), ("BBB", Behavior::NoData)]);
    let pipeline = Pipeline::new(config(dir.path()), provider.clone()).unwrap();

    let run = pipeline
        .run(Some(&universe(&["AAA&Alpha", "BBB&Beta"])), &SilentProgress)
        .unwrap();
    let (report, flushed) = run.finish();
    flushed.unwrap();

    assert_eq!(
        (report.stats.total, report.stats.success, report.stats.fail),
        (2, 2, 0)
    );
    assert!(report.failures.is_empty());

    let on_disk = CheckpointStore::new(dir.path().join("logs/checkpoint.csv")).load();
    assert_eq!(status_of(&on_disk, "AAA"), Status::Success);
    assert_eq!(status_of(&on_disk, "BBB"), Status::Skipped);
    assert_eq!(on_disk.get("BBB").unwrap().last_error, "");

    let artifact = dir.path().join("data/dayK/AAA_Alpha.csv");
    let text = std::fs::read_to_string(artifact).unwrap();
    assert!(text.starts_with("date,open,high,low,close,adj_close,volume\n2023-01-02,"));
    assert!(!dir.path().join("data/dayK/BBB_Beta.csv").exists());
}

#[test]
fn fresh_artifact_is_never_sent_to_the_provider() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let artifacts = ArtifactStore::new(&config.data_dir);
    artifacts
        .write(&SymbolEntry::new("AAA", "Alpha"), series())
        .unwrap();

    let provider = ScriptedProvider::new(&[("BBB", Behavior::NoData)]);
    let pipeline = Pipeline::new(config, provider.clone()).unwrap();
    let run = pipeline
        .run(Some(&universe(&["AAA&Alpha", "BBB&Beta"])), &SilentProgress)
        .unwrap();

    assert_eq!(provider.calls("AAA"), 0);
    assert_eq!(status_of(&run.checkpoint, "AAA"), Status::Skipped);
    assert_eq!(status_of(&run.checkpoint, "BBB"), Status::Skipped);
    // AAA was settled at rebuild time, so only BBB was dispatched
    assert_eq!(run.report.stats.total, 1);
}

#[test]
fn second_run_makes_no_calls_for_fresh_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[("CCC", Behavior::NoData)]);
    let pipeline = Pipeline::new(config(dir.path()), provider.clone()).unwrap();
    let listing = universe(&["AAA&Alpha", "BBB&Beta", "CCC&Gamma"]);

    pipeline.run(Some(&listing), &SilentProgress).unwrap();
    assert_eq!(provider.total_calls(), 3);

    // Rediscovered universe: fresh artifacts short-circuit
    let again = pipeline.run(Some(&listing), &SilentProgress).unwrap();
    assert_eq!(provider.calls("AAA"), 1);
    assert_eq!(provider.calls("BBB"), 1);
    assert_eq!(status_of(&again.checkpoint, "AAA"), Status::Skipped);

    // Resuming the checkpoint: nothing is dispatchable at all
    let before = provider.total_calls();
    let resumed = pipeline.run(None, &SilentProgress).unwrap();
    assert_eq!(resumed.report.stats.total, 0);
    assert_eq!(provider.total_calls(), before);
}

#[test]
fn interrupted_run_resumes_only_unfinished_symbols() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let ids = ["S1", "S2", "S3", "S4", "S5", "S6"];

    // State left behind by a run killed after two symbols were flushed
    let mut set = CheckpointSet::from_records(
        ids.iter()
            .map(|id| CheckpointRecord::new(&SymbolEntry::new(*id, "Name"), Status::Pending)),
    );
    set.update("S2", Status::Success, "");
    set.update("S5", Status::Success, "");
    CheckpointStore::new(&config.checkpoint_path)
        .persist(&set)
        .unwrap();

    let provider = ScriptedProvider::new(&[]);
    let pipeline = Pipeline::new(config, provider.clone()).unwrap();
    let run = pipeline.run(None, &SilentProgress).unwrap();

    assert_eq!(run.report.stats.total, 4);
    assert_eq!(provider.calls("S2"), 0);
    assert_eq!(provider.calls("S5"), 0);
    for id in ["S1", "S3", "S4", "S6"] {
        assert_eq!(provider.calls(id), 1, "{id}");
    }
    assert_eq!(run.checkpoint.counts().success, 6);
}

#[test]
fn stamp_from_a_clock_ahead_does_not_hide_this_runs_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = CheckpointStore::new(&config.checkpoint_path);

    // Written by a host whose clock ran an hour fast
    let mut set = CheckpointSet::from_records([CheckpointRecord::new(
        &SymbolEntry::new("SKEW", "Skewed"),
        Status::Pending,
    )]);
    set.update_at(
        "SKEW",
        Status::Failed,
        "timeout: earlier",
        Utc::now() + chrono::Duration::hours(1),
    );
    store.persist(&set).unwrap();

    let provider = ScriptedProvider::new(&[]);
    let pipeline = Pipeline::new(config, provider.clone()).unwrap();
    let run = pipeline.run(None, &SilentProgress).unwrap();

    assert_eq!(provider.calls("SKEW"), 1);
    assert_eq!((run.report.stats.success, run.report.stats.fail), (1, 0));
    let record = run.checkpoint.get("SKEW").unwrap();
    assert_eq!(record.status, Status::Success);
    assert!(record.last_error.is_empty());
    assert_eq!(status_of(&store.load(), "SKEW"), Status::Success);
}

#[test]
fn every_dispatched_symbol_gets_exactly_one_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let items: Vec<String> = (0..25).map(|i| format!("T{i:02}&Name {i}")).collect();
    let behaviors: Vec<(String, Behavior)> = (0..25)
        .map(|i| {
            let b = match i % 4 {
                0 => Behavior::Series,
                1 => Behavior::NoData,
                2 => Behavior::Timeout,
                _ => Behavior::Empty,
            };
            (format!("T{i:02}"), b)
        })
        .collect();
    let refs: Vec<(&str, Behavior)> = behaviors.iter().map(|(s, b)| (s.as_str(), *b)).collect();
    let provider = ScriptedProvider::new(&refs);

    let mut config = config(dir.path());
    config.schedule.flush_every = 3;
    let pipeline = Pipeline::new(config, provider).unwrap();

    let recorder = Recorder::default();
    let listing = StaticUniverse::from_items(items.iter().map(String::as_str));
    let run = pipeline.run(Some(&listing), &recorder).unwrap();

    let outcomes = recorder.outcomes.into_inner().unwrap();
    assert_eq!(outcomes.len(), 25);
    let mut seen: Vec<&str> = outcomes.iter().map(|o| o.symbol_id.as_str()).collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 25);

    for outcome in &outcomes {
        let record = run.checkpoint.get(&outcome.symbol_id).unwrap();
        assert_eq!(record.status, outcome.status);
        assert_eq!(record.updated_at, Some(outcome.completed_at));
    }
    assert_eq!(
        recorder.finished.into_inner().unwrap().as_ref(),
        Some(&run.report.stats)
    );
}

#[test]
fn empty_series_is_skipped_with_empty_error() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[("ZZZ", Behavior::Empty)]);
    let pipeline = Pipeline::new(config(dir.path()), provider.clone()).unwrap();
    let run = pipeline
        .run(Some(&universe(&["ZZZ&Gone"])), &SilentProgress)
        .unwrap();

    let record = run.checkpoint.get("ZZZ").unwrap();
    assert_eq!(record.status, Status::Skipped);
    assert!(record.last_error.is_empty());
    assert_eq!(provider.calls("ZZZ"), 1);
}

#[test]
fn persistent_timeout_fails_after_exact_attempt_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.fetch.max_attempts = 3;
    let provider = ScriptedProvider::new(&[("SLOW", Behavior::Timeout)]);
    let pipeline = Pipeline::new(config, provider.clone()).unwrap();

    let run = pipeline
        .run(Some(&universe(&["SLOW&Slow Co"])), &SilentProgress)
        .unwrap();

    assert_eq!(provider.calls("SLOW"), 3);
    let record = run.checkpoint.get("SLOW").unwrap();
    assert_eq!(record.status, Status::Failed);
    assert!(record.last_error.contains("timed out"));
    assert_eq!(run.report.failures.len(), 1);
    assert_eq!((run.report.stats.success, run.report.stats.fail), (0, 1));
}

#[test]
fn rate_limit_is_retried_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[("HOT", Behavior::RateLimitedOnce)]);
    let pipeline = Pipeline::new(config(dir.path()), provider.clone()).unwrap();

    let run = pipeline
        .run(Some(&universe(&["HOT&Hot Co"])), &SilentProgress)
        .unwrap();
    assert_eq!(provider.calls("HOT"), 2);
    assert_eq!(status_of(&run.checkpoint, "HOT"), Status::Success);
}

#[test]
fn failed_symbols_are_retried_on_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.fetch.max_attempts = 1;
    let provider = ScriptedProvider::new(&[("FLAKY", Behavior::TimeoutOnce)]);
    let pipeline = Pipeline::new(config, provider.clone()).unwrap();

    let first = pipeline
        .run(Some(&universe(&["FLAKY&Flaky", "OK&Fine"])), &SilentProgress)
        .unwrap();
    assert_eq!(status_of(&first.checkpoint, "FLAKY"), Status::Failed);

    let second = pipeline.run(None, &SilentProgress).unwrap();
    assert_eq!(second.report.stats.total, 1);
    assert_eq!(status_of(&second.checkpoint, "FLAKY"), Status::Success);
    assert!(second.checkpoint.get("FLAKY").unwrap().last_error.is_empty());
    assert_eq!(provider.calls("OK"), 1);
}

#[test]
fn no_universe_and_no_checkpoint_aborts_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[]);
    let pipeline = Pipeline::new(config(dir.path()), provider.clone()).unwrap();

    let err = pipeline
        .run(Some(&FailingUniverse), &SilentProgress)
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoWorkAvailable { .. }));
    assert!(err.to_string().contains("no work available"));
    assert_eq!(provider.total_calls(), 0);
}

#[test]
fn failed_discovery_with_checkpoint_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.fetch.max_attempts = 1;
    let provider = ScriptedProvider::new(&[("FLAKY", Behavior::TimeoutOnce)]);
    let pipeline = Pipeline::new(config, provider.clone()).unwrap();

    pipeline
        .run(Some(&universe(&["FLAKY&Flaky", "OK&Fine"])), &SilentProgress)
        .unwrap();
    let run = pipeline.run(Some(&FailingUniverse), &SilentProgress).unwrap();

    assert_eq!(run.report.stats.total, 1);
    assert_eq!(run.checkpoint.len(), 2);
    assert_eq!(status_of(&run.checkpoint, "FLAKY"), Status::Success);
}

#[test]
fn rediscovery_drops_symbols_that_left_the_universe() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[]);
    let pipeline = Pipeline::new(config(dir.path()), provider).unwrap();

    pipeline
        .run(Some(&universe(&["AAA&Alpha", "BBB&Beta"])), &SilentProgress)
        .unwrap();
    let run = pipeline
        .run(Some(&universe(&["AAA&Alpha", "CCC&Gamma"])), &SilentProgress)
        .unwrap();

    let ids: Vec<&str> = run.checkpoint.records().map(|r| r.symbol_id.as_str()).collect();
    assert_eq!(ids, vec!["AAA", "CCC"]);
    assert_eq!(status_of(&run.checkpoint, "CCC"), Status::Success);
}

fn behavior() -> impl Strategy<Value = Behavior> {
    prop_oneof![
        Just(Behavior::Series),
        Just(Behavior::NoData),
        Just(Behavior::Empty),
        Just(Behavior::Timeout),
        Just(Behavior::RateLimitedOnce),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn stats_always_add_up(behaviors in prop::collection::vec(behavior(), 1..12)) {
        let dir = tempfile::tempdir().unwrap();
        let named: Vec<(String, Behavior)> = behaviors
            .iter()
            .enumerate()
            .map(|(i, b)| (format!("P{i:02}"), *b))
            .collect();
        let refs: Vec<(&str, Behavior)> = named.iter().map(|(s, b)| (s.as_str(), *b)).collect();
        let items: Vec<String> = named.iter().map(|(s, _)| format!("{s}&Prop")).collect();

        let pipeline = Pipeline::new(config(dir.path()), ScriptedProvider::new(&refs)).unwrap();
        let listing = StaticUniverse::from_items(items.iter().map(String::as_str));
        let stats = pipeline.run(Some(&listing), &SilentProgress).unwrap().report.stats;

        let timeouts = behaviors.iter().filter(|b| **b == Behavior::Timeout).count();
        prop_assert_eq!(stats.total, behaviors.len());
        prop_assert_eq!(stats.success + stats.fail, stats.total);
        prop_assert_eq!(stats.fail, timeouts);
        prop_assert!(stats.is_consistent());
    }
}
