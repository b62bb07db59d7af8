//! Symbol universe sources.
//!
//! Discovering listings (scraping exchange pages and so on) happens outside
//! this crate; what arrives here is a file in one of three formats:
//!
//! - list file: one `SYMBOL&Name` item per line, `#` comments allowed
//! - JSON: an array of `SYMBOL&Name` strings
//! - TOML: `[[symbols]]` tables with `id` and optional `name`
//!
//! Every source returns entries deduplicated by symbol id.

use crate::freshness::{ArtifactRef, Cadence, FreshnessPolicy};
use crate::symbol::{dedup_entries, SymbolEntry, UNKNOWN_NAME};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from reading a universe.
#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("failed to read universe {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse universe {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("failed to write universe cache {}: {message}", path.display())]
    Write { path: PathBuf, message: String },
}

/// Produces the set of symbols a run should cover.
pub trait UniverseSource: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    fn discover(&self) -> Result<Vec<SymbolEntry>, UniverseError>;
}

fn read_file(path: &Path) -> Result<String, UniverseError> {
    fs::read_to_string(path).map_err(|source| UniverseError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Plain-text listing, one `SYMBOL&Name` per line.
#[derive(Debug, Clone)]
pub struct ListFileUniverse {
    path: PathBuf,
}

impl ListFileUniverse {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(content: &str) -> Vec<SymbolEntry> {
        dedup_entries(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .filter_map(SymbolEntry::parse_item),
        )
    }
}

impl UniverseSource for ListFileUniverse {
    fn describe(&self) -> String {
        format!("list file {}", self.path.display())
    }

    fn discover(&self) -> Result<Vec<SymbolEntry>, UniverseError> {
        Ok(Self::parse(&read_file(&self.path)?))
    }
}

/// JSON array of `SYMBOL&Name` strings.
#[derive(Debug, Clone)]
pub struct JsonUniverse {
    path: PathBuf,
}

impl JsonUniverse {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(content: &str) -> Result<Vec<SymbolEntry>, serde_json::Error> {
        let items: Vec<String> = serde_json::from_str(content)?;
        Ok(dedup_entries(
            items.iter().filter_map(|item| SymbolEntry::parse_item(item)),
        ))
    }
}

impl UniverseSource for JsonUniverse {
    fn describe(&self) -> String {
        format!("json list {}", self.path.display())
    }

    fn discover(&self) -> Result<Vec<SymbolEntry>, UniverseError> {
        Self::parse(&read_file(&self.path)?).map_err(|e| UniverseError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TomlListing {
    #[serde(default)]
    symbols: Vec<TomlSymbol>,
}

#[derive(Debug, Deserialize)]
struct TomlSymbol {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

/// TOML listing:
///
/// ```toml
/// [[symbols]]
/// id = "2330"
/// name = "台積電"
/// ```
#[derive(Debug, Clone)]
pub struct TomlUniverse {
    path: PathBuf,
}

impl TomlUniverse {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(content: &str) -> Result<Vec<SymbolEntry>, toml::de::Error> {
        let listing: TomlListing = toml::from_str(content)?;
        Ok(dedup_entries(listing.symbols.into_iter().map(|s| {
            let name = s
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| UNKNOWN_NAME.to_string());
            SymbolEntry::new(s.id.trim(), name)
        })))
    }
}

impl UniverseSource for TomlUniverse {
    fn describe(&self) -> String {
        format!("toml listing {}", self.path.display())
    }

    fn discover(&self) -> Result<Vec<SymbolEntry>, UniverseError> {
        Self::parse(&read_file(&self.path)?).map_err(|e| UniverseError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}

/// A fixed, in-memory universe.
#[derive(Debug, Clone, Default)]
pub struct StaticUniverse {
    entries: Vec<SymbolEntry>,
}

impl StaticUniverse {
    pub fn new(entries: impl IntoIterator<Item = SymbolEntry>) -> Self {
        Self {
            entries: dedup_entries(entries),
        }
    }

    /// Build from `SYMBOL&Name` items.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(items.into_iter().filter_map(SymbolEntry::parse_item))
    }
}

impl UniverseSource for StaticUniverse {
    fn describe(&self) -> String {
        format!("{} static entries", self.entries.len())
    }

    fn discover(&self) -> Result<Vec<SymbolEntry>, UniverseError> {
        Ok(self.entries.clone())
    }
}

/// Wraps a slow source with a once-a-day JSON cache.
///
/// A cache written on the current local day (in the configured offset) is
/// reused as-is; otherwise the inner source is asked and the cache rewritten.
/// A failed cache write is logged and does not fail discovery.
pub struct DailyCachedUniverse {
    inner: Box<dyn UniverseSource>,
    cache_path: PathBuf,
    utc_offset_hours: i32,
}

impl DailyCachedUniverse {
    pub fn new(inner: Box<dyn UniverseSource>, cache_path: impl Into<PathBuf>, utc_offset_hours: i32) -> Self {
        Self {
            inner,
            cache_path: cache_path.into(),
            utc_offset_hours,
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    fn cache_is_current(&self, now: DateTime<Utc>) -> bool {
        let policy = FreshnessPolicy {
            cadence: Cadence::SameDay,
            min_size_bytes: 2,
            utc_offset_hours: self.utc_offset_hours,
        };
        policy.is_fresh_at(&ArtifactRef::probe(&self.cache_path), now)
    }

    /// Discovery as of `now`.
    pub fn discover_at(&self, now: DateTime<Utc>) -> Result<Vec<SymbolEntry>, UniverseError> {
        if self.cache_is_current(now) {
            match read_file(&self.cache_path).and_then(|text| {
                JsonUniverse::parse(&text).map_err(|e| UniverseError::Parse {
                    path: self.cache_path.clone(),
                    message: e.to_string(),
                })
            }) {
                Ok(entries) if !entries.is_empty() => {
                    info!(path = %self.cache_path.display(), symbols = entries.len(), "using today's universe cache");
                    return Ok(entries);
                }
                Ok(_) => debug!("universe cache is empty, refreshing"),
                Err(e) => warn!(error = %e, "universe cache unreadable, refreshing"),
            }
        }

        let entries = self.inner.discover()?;
        if !entries.is_empty() {
            if let Err(e) = self.write_cache(&entries) {
                warn!(error = %e, "failed to write universe cache");
            }
        }
        Ok(entries)
    }

    fn write_cache(&self, entries: &[SymbolEntry]) -> Result<(), UniverseError> {
        let write_err = |message: String| UniverseError::Write {
            path: self.cache_path.clone(),
            message,
        };
        if let Some(parent) = self.cache_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        let items: Vec<String> = entries.iter().map(SymbolEntry::to_item).collect();
        let json = serde_json::to_string_pretty(&items).map_err(|e| write_err(e.to_string()))?;

        let tmp_path = self.cache_path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| write_err(e.to_string()))?;
        fs::rename(&tmp_path, &self.cache_path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            write_err(e.to_string())
        })
    }
}

impl UniverseSource for DailyCachedUniverse {
    fn describe(&self) -> String {
        format!("{} (daily cache {})", self.inner.describe(), self.cache_path.display())
    }

    fn discover(&self) -> Result<Vec<SymbolEntry>, UniverseError> {
        self.discover_at(Utc::now())
    }
}
