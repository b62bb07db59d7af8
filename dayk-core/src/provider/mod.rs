//! Market-data provider trait and structured error types.
//!
//! The pipeline treats the provider as an opaque remote service: one call per
//! (attempt, symbol). Retry policy lives in the fetch worker, so a provider
//! performs exactly one request per call and reports *what kind* of failure
//! happened through [`ErrorKind`] rather than through message text.

pub mod yahoo;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use yahoo::YahooProvider;

/// One daily OHLCV bar as returned by the provider.
///
/// Field names double as the artifact's lower-cased CSV header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: u64,
}

/// Failure category, used to pick the retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider asked us to slow down (HTTP 429 or equivalent).
    RateLimited,
    /// Symbol has no history: delisted, invalid, or never traded.
    NoData,
    /// The per-call timeout elapsed.
    Timeout,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NoData => "no_data",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider failure: structured kind plus opaque diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoData, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }
}

/// How far back to request history, ending today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lookback {
    Years(u32),
    Days(u32),
}

impl Lookback {
    /// Provider range token, e.g. `2y` or `30d`.
    pub fn as_range(&self) -> String {
        match self {
            Lookback::Years(n) => format!("{n}y"),
            Lookback::Days(n) => format!("{n}d"),
        }
    }
}

impl fmt::Display for Lookback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_range())
    }
}

/// A source of daily price history.
///
/// Implementations must enforce their own per-call timeout; a hung call
/// would otherwise hold a worker slot forever. An `Ok` with no bars is
/// treated the same as [`ErrorKind::NoData`].
pub trait HistoryProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch daily bars for `symbol` over `window`. Exactly one attempt.
    fn fetch_history(&self, symbol: &str, window: Lookback) -> Result<Vec<DailyBar>, ProviderError>;
}
