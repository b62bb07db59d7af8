//! Freshness policy: is a previously written artifact still good enough?
//!
//! Works from filesystem metadata only (size and modification time); the
//! artifact is never opened.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How often the provider publishes a new daily bar for this market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// The artifact must have been written today (reference timezone).
    SameDay,
    /// Any artifact above the size threshold counts, regardless of age.
    SizeOnly,
}

/// Metadata snapshot of a possibly-missing artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// `None` when the file does not exist (or is not a regular file).
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

impl ArtifactRef {
    /// Stat the path. Errors are folded into "does not exist".
    pub fn probe(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Self {
                size: Some(meta.len()),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                path,
            },
            _ => Self {
                path,
                size: None,
                modified: None,
            },
        }
    }

    pub fn exists(&self) -> bool {
        self.size.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Market-specific freshness rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessPolicy {
    pub cadence: Cadence,
    /// Artifacts of this size or smaller are treated as error pages / truncated writes.
    pub min_size_bytes: u64,
    /// Operator's reference timezone as a whole-hour UTC offset.
    pub utc_offset_hours: i32,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            cadence: Cadence::SizeOnly,
            min_size_bytes: 100,
            utc_offset_hours: 8,
        }
    }
}

impl FreshnessPolicy {
    /// Reference timezone. Out-of-range offsets (rejected by config
    /// validation) fall back to UTC.
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    pub fn is_fresh(&self, artifact: &ArtifactRef) -> bool {
        self.is_fresh_at(artifact, Utc::now())
    }

    /// Same as [`is_fresh`](Self::is_fresh) with an explicit clock.
    pub fn is_fresh_at(&self, artifact: &ArtifactRef, now: DateTime<Utc>) -> bool {
        let Some(size) = artifact.size else {
            return false;
        };
        if size <= self.min_size_bytes {
            return false;
        }
        match self.cadence {
            Cadence::SizeOnly => true,
            Cadence::SameDay => match artifact.modified {
                Some(modified) => {
                    let tz = self.offset();
                    modified.with_timezone(&tz).date_naive() == now.with_timezone(&tz).date_naive()
                }
                None => false,
            },
        }
    }
}
