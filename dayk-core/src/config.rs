//! Per-market pipeline configuration.
//!
//! Every setting the pipeline needs (directories, thresholds, worker counts,
//! delays) lives in one [`MarketConfig`] value passed in at construction, so
//! several markets can run side by side with independent settings.
//!
//! Configs are layered: a built-in preset, then an optional TOML file whose
//! keys override the preset, then command-line overrides.

use crate::freshness::{Cadence, FreshnessPolicy};
use crate::provider::Lookback;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating a config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unknown market preset '{0}' (expected one of: tw, us)")]
    UnknownPreset(String),
}

/// Inclusive `[min, max]` range sampled uniformly. Units are given by the
/// field name that holds it (`_ms`, `_secs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterRange(pub u64, pub u64);

impl JitterRange {
    pub const ZERO: JitterRange = JitterRange(0, 0);

    pub fn min(&self) -> u64 {
        self.0
    }

    pub fn max(&self) -> u64 {
        self.1
    }

    pub fn is_valid(&self) -> bool {
        self.0 <= self.1
    }

    /// Uniform draw from `[min, max]`; `min` when the range is degenerate.
    pub fn sample(&self) -> u64 {
        if self.0 >= self.1 {
            return self.0;
        }
        rand::thread_rng().gen_range(self.0..=self.1)
    }

    /// [`Self::sample`] as milliseconds.
    pub fn sample_millis(&self) -> Duration {
        Duration::from_millis(self.sample())
    }

    /// [`Self::sample`] as seconds.
    pub fn sample_secs(&self) -> Duration {
        Duration::from_secs(self.sample())
    }
}

/// Per-symbol fetch behavior: lookback window, attempt budget, delays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    /// Years of daily bars requested per symbol.
    pub lookback_years: u32,
    /// Provider calls per symbol before giving up.
    pub max_attempts: u32,
    /// Randomized sleep before every provider call.
    pub pre_call_delay_ms: JitterRange,
    /// Sleep after a rate-limited attempt (worker-local).
    pub rate_limit_cooldown_secs: JitterRange,
    /// Sleep after any other failed attempt.
    pub retry_delay_secs: JitterRange,
    /// Appended to symbols that carry no `.` suffix of their own (e.g. `.TW`).
    pub provider_suffix: Option<String>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            lookback_years: 2,
            max_attempts: 2,
            pre_call_delay_ms: JitterRange(400, 1200),
            rate_limit_cooldown_secs: JitterRange(20, 40),
            retry_delay_secs: JitterRange(3, 6),
            provider_suffix: None,
        }
    }
}

impl FetchPolicy {
    pub fn lookback(&self) -> Lookback {
        Lookback::Years(self.lookback_years)
    }

    /// Symbol as the provider knows it.
    pub fn provider_symbol(&self, symbol_id: &str) -> String {
        match &self.provider_suffix {
            Some(suffix) if !suffix.is_empty() && !symbol_id.contains('.') => {
                format!("{symbol_id}{suffix}")
            }
            _ => symbol_id.to_string(),
        }
    }
}

/// Pool size and the scheduler's flush / cooldown cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulePolicy {
    /// Worker threads, i.e. provider calls in flight at once.
    pub concurrency: usize,
    /// Persist the checkpoint every N completions.
    pub flush_every: usize,
    /// Pause the whole pool every M completions. `None` disables it.
    pub cooldown_every: Option<usize>,
    /// Length of that pause.
    pub cooldown_secs: JitterRange,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            concurrency: 8,
            flush_every: 10,
            cooldown_every: None,
            cooldown_secs: JitterRange(10, 20),
        }
    }
}

/// Provider client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Hard per-request timeout.
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self { timeout_secs: 20 }
    }
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Complete configuration for one market's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Label used in logs and reports.
    pub market: String,
    /// Directory holding one artifact per symbol.
    pub data_dir: PathBuf,
    /// Durable checkpoint table (CSV).
    pub checkpoint_path: PathBuf,
    /// Once-a-day cache for the discovered universe. `None` disables it.
    pub universe_cache: Option<PathBuf>,
    pub freshness: FreshnessPolicy,
    pub fetch: FetchPolicy,
    pub schedule: SchedulePolicy,
    pub provider: ProviderSettings,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self::tw()
    }
}

impl MarketConfig {
    /// Taiwan listed/OTC shares: large worker pool, frequent flushes,
    /// size-only freshness.
    pub fn tw() -> Self {
        Self {
            market: "tw-share".into(),
            data_dir: PathBuf::from("data/tw-share/dayK"),
            checkpoint_path: PathBuf::from("logs/tw-share/checkpoint_tw.csv"),
            universe_cache: None,
            freshness: FreshnessPolicy {
                cadence: Cadence::SizeOnly,
                min_size_bytes: 100,
                utc_offset_hours: 8,
            },
            fetch: FetchPolicy {
                provider_suffix: Some(".TW".into()),
                ..FetchPolicy::default()
            },
            schedule: SchedulePolicy::default(),
            provider: ProviderSettings::default(),
        }
    }

    /// US common stocks: thousands of symbols and a stricter provider, so
    /// fewer workers, same-day freshness and a pool-wide pause every 100.
    pub fn us() -> Self {
        Self {
            market: "us-share".into(),
            data_dir: PathBuf::from("data/us-share/dayK"),
            checkpoint_path: PathBuf::from("logs/us-share/checkpoint_us.csv"),
            universe_cache: Some(PathBuf::from("data/us-share/us_stock_list.json")),
            freshness: FreshnessPolicy {
                cadence: Cadence::SameDay,
                min_size_bytes: 1000,
                utc_offset_hours: 8,
            },
            fetch: FetchPolicy::default(),
            schedule: SchedulePolicy {
                concurrency: 4,
                flush_every: 100,
                cooldown_every: Some(100),
                cooldown_secs: JitterRange(10, 20),
            },
            provider: ProviderSettings::default(),
        }
    }

    /// Look up a built-in preset by short name.
    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "tw" | "tw-share" => Ok(Self::tw()),
            "us" | "us-share" => Ok(Self::us()),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }

    /// Load a TOML file on top of `base`.
    pub fn from_file_over(base: &MarketConfig, path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_over(base, &content)
    }

    /// Parse TOML whose keys override the matching keys of `base`.
    pub fn from_toml_over(base: &MarketConfig, content: &str) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::try_from(base)?;
        let overlay: toml::Table = toml::from_str(content)?;
        merge_values(&mut merged, toml::Value::Table(overlay));
        let config: MarketConfig = merged.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the full effective config, every key included.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Zero every delay. Used for tests and local stubs where sleeping
    /// only slows things down.
    pub fn with_zero_delays(mut self) -> Self {
        self.fetch.pre_call_delay_ms = JitterRange::ZERO;
        self.fetch.rate_limit_cooldown_secs = JitterRange::ZERO;
        self.fetch.retry_delay_secs = JitterRange::ZERO;
        self.schedule.cooldown_secs = JitterRange::ZERO;
        self
    }

    /// Reject values the pipeline cannot run with (zero counts and
    /// cadences, inverted ranges, out-of-range offsets).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.market.trim().is_empty() {
            return invalid("market label must not be empty");
        }
        if self.schedule.concurrency == 0 {
            return invalid("schedule.concurrency must be at least 1");
        }
        if self.schedule.flush_every == 0 {
            return invalid("schedule.flush_every must be at least 1");
        }
        if self.schedule.cooldown_every == Some(0) {
            return invalid("schedule.cooldown_every must be at least 1");
        }
        if self.fetch.max_attempts == 0 {
            return invalid("fetch.max_attempts must be at least 1");
        }
        if self.fetch.lookback_years == 0 {
            return invalid("fetch.lookback_years must be at least 1");
        }
        if self.provider.timeout_secs == 0 {
            return invalid("provider.timeout_secs must be at least 1");
        }
        if !(-14..=14).contains(&self.freshness.utc_offset_hours) {
            return invalid("freshness.utc_offset_hours must be within -14..=14");
        }
        let ranges = [
            ("fetch.pre_call_delay_ms", self.fetch.pre_call_delay_ms),
            ("fetch.rate_limit_cooldown_secs", self.fetch.rate_limit_cooldown_secs),
            ("fetch.retry_delay_secs", self.fetch.retry_delay_secs),
            ("schedule.cooldown_secs", self.schedule.cooldown_secs),
        ];
        for (name, range) in ranges {
            if !range.is_valid() {
                return Err(ConfigError::Invalid(format!(
                    "{name}: min {} exceeds max {}",
                    range.min(),
                    range.max()
                )));
            }
        }
        Ok(())
    }
}

/// Recursively overlay tables; any non-table value replaces the base value.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        MarketConfig::tw().validate().unwrap();
        MarketConfig::us().validate().unwrap();
        assert!(matches!(
            MarketConfig::preset("jp"),
            Err(ConfigError::UnknownPreset(_))
        ));
    }

    #[test]
    fn overlay_overrides_only_given_keys() {
        let config = MarketConfig::from_toml_over(
            &MarketConfig::us(),
            r#"
data_dir = "/tmp/us"

[schedule]
concurrency = 2

[freshness]
cadence = "size_only"
"#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/us"));
        assert_eq!(config.schedule.concurrency, 2);
        assert_eq!(config.schedule.flush_every, 100);
        assert_eq!(config.schedule.cooldown_every, Some(100));
        assert_eq!(config.freshness.cadence, Cadence::SizeOnly);
        assert_eq!(config.freshness.min_size_bytes, 1000);
        assert_eq!(config.market, "us-share");
    }

    #[test]
    fn overlay_sets_jitter_ranges_as_arrays() {
        let config = MarketConfig::from_toml_over(
            &MarketConfig::tw(),
            "[fetch]\npre_call_delay_ms = [0, 50]\nmax_attempts = 3\n",
        )
        .unwrap();
        assert_eq!(config.fetch.pre_call_delay_ms, JitterRange(0, 50));
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(config.fetch.provider_suffix.as_deref(), Some(".TW"));
    }

    #[test]
    fn toml_roundtrip_preserves_preset() {
        let us = MarketConfig::us();
        let text = us.to_toml().unwrap();
        let back = MarketConfig::from_toml_over(&MarketConfig::tw(), &text).unwrap();
        assert_eq!(back.schedule, us.schedule);
        assert_eq!(back.freshness, us.freshness);
        assert_eq!(back.data_dir, us.data_dir);
        assert_eq!(back.universe_cache, us.universe_cache);
    }

    #[test]
    fn rejects_invalid_values() {
        for overlay in [
            "[schedule]\nconcurrency = 0",
            "[schedule]\nflush_every = 0",
            "[schedule]\ncooldown_every = 0",
            "[fetch]\nmax_attempts = 0",
            "[fetch]\nretry_delay_secs = [9, 3]",
            "[freshness]\nutc_offset_hours = 20",
            "[provider]\ntimeout_secs = 0",
        ] {
            let result = MarketConfig::from_toml_over(&MarketConfig::tw(), overlay);
            assert!(
                matches!(result, Err(ConfigError::Invalid(_))),
                "expected rejection for {overlay:?}"
            );
        }
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let result = MarketConfig::from_toml_over(&MarketConfig::tw(), "[schedule\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn provider_symbol_appends_suffix_once() {
        let tw = MarketConfig::tw().fetch;
        assert_eq!(tw.provider_symbol("2330"), "2330.TW");
        assert_eq!(tw.provider_symbol("6488.TWO"), "6488.TWO");
        assert_eq!(MarketConfig::us().fetch.provider_symbol("AAPL"), "AAPL");
    }

    #[test]
    fn jitter_sampling_stays_in_range() {
        let range = JitterRange(3, 6);
        for _ in 0..100 {
            let v = range.sample();
            assert!((3..=6).contains(&v));
        }
        assert_eq!(JitterRange::ZERO.sample_secs(), Duration::ZERO);
    }

    #[test]
    fn with_zero_delays_clears_all_sleeps() {
        let config = MarketConfig::us().with_zero_delays();
        assert_eq!(config.fetch.rate_limit_cooldown_secs, JitterRange::ZERO);
        assert_eq!(config.schedule.cooldown_secs, JitterRange::ZERO);
        assert_eq!(config.schedule.cooldown_every, Some(100));
    }
}
