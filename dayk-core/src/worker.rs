//! Fetch worker: one symbol in, one [`Outcome`] out.
//!
//! Every per-symbol error is contained here. The freshness check runs
//! before any network call; the provider is then called up to
//! `max_attempts` times with jittered delays, and a successful series is
//! written atomically to the artifact store.

use crate::artifact::ArtifactStore;
use crate::checkpoint::Status;
use crate::config::FetchPolicy;
use crate::cooldown::PoolCooldown;
use crate::freshness::FreshnessPolicy;
use crate::provider::{ErrorKind, HistoryProvider, ProviderError};
use crate::symbol::SymbolEntry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// The delays a worker takes around provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Jitter before every provider call.
    PreCall,
    /// After a rate-limited attempt that has a retry left.
    RateLimited,
    /// After any other failed attempt that has a retry left.
    Retry,
}

/// Carries out a worker's delays.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Delay, duration: Duration);
}

/// Blocks the calling thread for the whole duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, _delay: Delay, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// A worker's result for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub symbol_id: String,
    pub status: Status,
    /// Empty unless `status` is failed.
    pub error_detail: String,
    pub error_kind: Option<ErrorKind>,
    /// Provider calls made; zero when the artifact was already fresh.
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl Outcome {
    fn finished(entry: &SymbolEntry, status: Status, attempts: u32) -> Self {
        Self {
            symbol_id: entry.symbol_id.clone(),
            status,
            error_detail: String::new(),
            error_kind: None,
            attempts,
            completed_at: Utc::now(),
        }
    }

    fn failed(entry: &SymbolEntry, kind: ErrorKind, detail: String, attempts: u32) -> Self {
        Self {
            error_detail: detail,
            error_kind: Some(kind),
            ..Self::finished(entry, Status::Failed, attempts)
        }
    }

    /// Whether the provider was contacted at all.
    pub fn was_fetched(&self) -> bool {
        self.attempts > 0
    }
}

/// Fetches a single symbol. Shared by all pool threads behind an `Arc`.
pub struct FetchWorker {
    provider: Arc<dyn HistoryProvider>,
    artifacts: ArtifactStore,
    freshness: FreshnessPolicy,
    policy: FetchPolicy,
    cooldown: Arc<PoolCooldown>,
    sleeper: Arc<dyn Sleeper>,
}

impl FetchWorker {
    pub fn new(
        provider: Arc<dyn HistoryProvider>,
        artifacts: ArtifactStore,
        freshness: FreshnessPolicy,
        policy: FetchPolicy,
        cooldown: Arc<PoolCooldown>,
    ) -> Self {
        Self {
            provider,
            artifacts,
            freshness,
            policy,
            cooldown,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    /// Route delays through `sleeper` instead of blocking the thread.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// The store artifacts are written to.
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Fetch one symbol. Never fails: every problem ends up in the outcome.
    pub fn fetch(&self, entry: &SymbolEntry) -> Outcome {
        if self.freshness.is_fresh(&self.artifacts.probe(entry)) {
            debug!(symbol = %entry.symbol_id, "artifact fresh, not fetching");
            return Outcome::finished(entry, Status::Skipped, 0);
        }

        let provider_symbol = self.policy.provider_symbol(&entry.symbol_id);
        let window = self.policy.lookback();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = ProviderError::other("no attempt made");

        for attempt in 1..=max_attempts {
            self.sleeper
                .sleep(Delay::PreCall, self.policy.pre_call_delay_ms.sample_millis());
            self.cooldown.wait();

            let err = match self.provider.fetch_history(&provider_symbol, window) {
                Ok(bars) if bars.is_empty() => {
                    debug!(symbol = %entry.symbol_id, attempt, "provider returned no rows");
                    return Outcome::finished(entry, Status::Skipped, attempt);
                }
                Ok(bars) => {
                    let rows = bars.len();
                    return match self.artifacts.write(entry, bars) {
                        Ok(path) => {
                            debug!(symbol = %entry.symbol_id, rows, path = %path.display(), "artifact written");
                            Outcome::finished(entry, Status::Success, attempt)
                        }
                        Err(e) => {
                            warn!(symbol = %entry.symbol_id, error = %e, "artifact write failed");
                            Outcome::failed(entry, ErrorKind::Other, e.to_string(), attempt)
                        }
                    };
                }
                Err(e) if e.kind == ErrorKind::NoData => {
                    debug!(symbol = %entry.symbol_id, attempt, reason = %e.message, "no data, not retrying");
                    return Outcome::finished(entry, Status::Skipped, attempt);
                }
                Err(e) => e,
            };

            let (delay, range) = if err.kind == ErrorKind::RateLimited {
                warn!(symbol = %entry.symbol_id, attempt, error = %err, "rate limited");
                (Delay::RateLimited, self.policy.rate_limit_cooldown_secs)
            } else {
                debug!(symbol = %entry.symbol_id, attempt, error = %err, "attempt failed");
                (Delay::Retry, self.policy.retry_delay_secs)
            };
            if attempt < max_attempts {
                self.sleeper.sleep(delay, range.sample_secs());
            }
            last_error = err;
        }

        Outcome::failed(entry, last_error.kind, last_error.to_string(), max_attempts)
    }
}
