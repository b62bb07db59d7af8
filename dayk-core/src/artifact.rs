//! Artifact store: one normalized CSV per symbol.
//!
//! Layout: `{data_dir}/{symbol}_{name}.csv`, see [`SymbolEntry::file_stem`]
//!
//! Columns: `date,open,high,low,close,adj_close,volume`, one row per trading
//! day in ascending date order. Writes are atomic (write to `.tmp`, rename
//! into place) so a crash mid-write never leaves a truncated artifact behind
//! under the real name.

use crate::freshness::ArtifactRef;
use crate::provider::DailyBar;
use crate::symbol::SymbolEntry;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from writing an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("no rows to write for {symbol}")]
    Empty { symbol: String },

    #[error("failed to create data dir {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {}: {message}", path.display())]
    Write { path: PathBuf, message: String },

    #[error("atomic rename to {} failed: {source}", path.display())]
    Rename {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Directory of per-symbol artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    data_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the artifact for `entry`. Unique per symbol.
    pub fn path_for(&self, entry: &SymbolEntry) -> PathBuf {
        self.data_dir.join(format!("{}.csv", entry.file_stem()))
    }

    /// Metadata snapshot for the freshness check.
    pub fn probe(&self, entry: &SymbolEntry) -> ArtifactRef {
        ArtifactRef::probe(self.path_for(entry))
    }

    /// Normalize and atomically write `bars` for `entry`.
    pub fn write(&self, entry: &SymbolEntry, bars: Vec<DailyBar>) -> Result<PathBuf, ArtifactError> {
        let bars = normalize(bars);
        if bars.is_empty() {
            return Err(ArtifactError::Empty {
                symbol: entry.symbol_id.clone(),
            });
        }

        fs::create_dir_all(&self.data_dir).map_err(|source| ArtifactError::CreateDir {
            path: self.data_dir.clone(),
            source,
        })?;

        let path = self.path_for(entry);
        let tmp_path = path.with_extension("csv.tmp");

        if let Err(message) = write_csv(&tmp_path, &bars) {
            let _ = fs::remove_file(&tmp_path);
            return Err(ArtifactError::Write {
                path: tmp_path,
                message,
            });
        }

        fs::rename(&tmp_path, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            ArtifactError::Rename {
                path: path.clone(),
                source,
            }
        })?;

        Ok(path)
    }
}

/// Sort by date and collapse duplicate dates, keeping the last occurrence.
pub fn normalize(mut bars: Vec<DailyBar>) -> Vec<DailyBar> {
    // Stable sort keeps provider order within a date, so "last" is well defined
    bars.sort_by_key(|b| b.date);
    let mut out: Vec<DailyBar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(prev) if prev.date == bar.date => *prev = bar,
            _ => out.push(bar),
        }
    }
    out
}

fn write_csv(path: &Path, bars: &[DailyBar]) -> Result<(), String> {
    let file = fs::File::create(path).map_err(|e| format!("create: {e}"))?;
    let mut wtr = csv::Writer::from_writer(BufWriter::new(file));
    for bar in bars {
        wtr.serialize(bar).map_err(|e| format!("row {}: {e}", bar.date))?;
    }
    wtr.flush().map_err(|e| format!("flush: {e}"))?;
    let mut buf = wtr.into_inner().map_err(|e| format!("flush: {e}"))?;
    buf.flush().map_err(|e| format!("flush: {e}"))?;
    let file = buf.into_inner().map_err(|e| format!("flush: {e}"))?;
    file.sync_all().map_err(|e| format!("sync: {e}"))?;
    Ok(())
}
