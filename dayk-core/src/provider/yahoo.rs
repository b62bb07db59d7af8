//! Yahoo Finance history provider.
//!
//! Fetches daily bars from Yahoo's v8 chart API using a `range=` lookback.
//! One HTTP request per call; the fetch worker owns retries and backoff.
//!
//! Yahoo Finance has no official API and publishes no rate limits. HTTP 429
//! and 403 both mean "back off" in practice and are reported as
//! [`ErrorKind::RateLimited`].

use super::{DailyBar, ErrorKind, HistoryProvider, Lookback, ProviderError};
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use std::time::Duration;

const CHART_BASE_URL: &str = "https://query2.finance.yahoo.com/v8/finance/chart";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

fn value_at<T: Copy>(column: &[Option<T>], i: usize) -> Option<T> {
    column.get(i).copied().flatten()
}

impl QuoteData {
    /// Row `i` as a bar, or `None` when Yahoo sent an all-null row (a
    /// market holiday). Missing prices inside a real row become NaN.
    fn bar_at(&self, i: usize, date: NaiveDate, adj_close: Option<f64>) -> Option<DailyBar> {
        let prices = [&self.open, &self.high, &self.low, &self.close].map(|col| value_at(col, i));
        let volume = value_at(&self.volume, i);
        if volume.is_none() && prices.iter().all(Option::is_none) {
            return None;
        }

        let [open, high, low, close] = prices.map(|p| p.unwrap_or(f64::NAN));
        Some(DailyBar {
            date,
            open,
            high,
            low,
            close,
            adj_close: adj_close.or(prices[3]).unwrap_or(f64::NAN),
            volume: volume.unwrap_or(0),
        })
    }
}

/// Yahoo Finance provider backed by a blocking `reqwest` client.
pub struct YahooProvider {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl YahooProvider {
    /// Build a provider whose every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: CHART_BASE_URL.to_string(),
        })
    }

    /// Chart API URL for a symbol and lookback window.
    fn chart_url(&self, symbol: &str, window: Lookback) -> Result<reqwest::Url, ProviderError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ProviderError::other(format!("bad base url: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ProviderError::other("base url cannot carry a path"))?;
            segments.push(symbol);
        }
        url.query_pairs_mut()
            .append_pair("range", &window.as_range())
            .append_pair("interval", "1d")
            .append_pair("includeAdjustedClose", "true");
        Ok(url)
    }

    /// Map a non-success HTTP status to an error kind.
    fn classify_status(status: reqwest::StatusCode, retry_after: Option<&str>) -> ProviderError {
        match status {
            reqwest::StatusCode::TOO_MANY_REQUESTS => ProviderError::rate_limited(format!(
                "HTTP 429 Too Many Requests (retry-after: {})",
                retry_after.unwrap_or("unspecified")
            )),
            reqwest::StatusCode::FORBIDDEN => {
                ProviderError::rate_limited("HTTP 403 Forbidden: provider is refusing requests")
            }
            reqwest::StatusCode::NOT_FOUND => ProviderError::no_data("HTTP 404 Not Found"),
            other => ProviderError::other(format!("HTTP {other}")),
        }
    }
}

/// Parse a chart response into bars.
///
/// A result with no timestamps or only empty rows is `NoData`: Yahoo answers
/// that way for delisted symbols.
fn parse_response(symbol: &str, resp: ChartResponse) -> Result<Vec<DailyBar>, ProviderError> {
    let result = match resp.chart.result {
        Some(result) => result,
        None => {
            return Err(match resp.chart.error {
                Some(err) if err.code == "Not Found" => {
                    ProviderError::no_data(format!("{symbol}: {}", err.description))
                }
                Some(err) => ProviderError::other(format!("{}: {}", err.code, err.description)),
                None => ProviderError::other("empty result with no error"),
            });
        }
    };

    let Some(data) = result.into_iter().next() else {
        return Err(ProviderError::no_data(format!("{symbol}: result array is empty")));
    };

    let timestamps = match data.timestamp {
        Some(ts) if !ts.is_empty() => ts,
        _ => return Err(ProviderError::no_data(format!("{symbol}: no timestamps"))),
    };

    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::other(format!("{symbol}: no quote data")))?;

    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose);

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let date = DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| ProviderError::other(format!("invalid timestamp: {ts}")))?;
        let adj_close = adj_closes.as_deref().and_then(|col| value_at(col, i));
        bars.extend(quote.bar_at(i, date, adj_close));
    }

    if bars.is_empty() {
        return Err(ProviderError::no_data(format!("{symbol}: all rows empty")));
    }

    Ok(bars)
}

impl HistoryProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch_history(&self, symbol: &str, window: Lookback) -> Result<Vec<DailyBar>, ProviderError> {
        let url = self.chart_url(symbol, window)?;

        let resp = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                ProviderError::timeout(e.to_string())
            } else {
                ProviderError::other(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(Self::classify_status(status, retry_after.as_deref()));
        }

        let chart: ChartResponse = resp.json().map_err(|e| {
            let kind = if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                ErrorKind::Other
            };
            ProviderError::new(kind, format!("failed to parse response for {symbol}: {e}"))
        })?;

        parse_response(symbol, chart)
    }
}
