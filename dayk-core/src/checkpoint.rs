//! Checkpoint store: durable symbol → last-known-outcome table.
//!
//! The table is a human-readable CSV:
//!
//! ```text
//! symbol_id,display_name,status,last_error,updated_at
//! 2330,台積電,success,,2024-03-01T06:12:44.120Z
//! 9999,Gone Co,skipped,,2024-03-01T06:12:45.003Z
//! 1234,Flaky Co,failed,timeout: operation timed out,2024-03-01T06:13:01.551Z
//! ```
//!
//! Persisting writes to `{path}.tmp` and renames over the real file, so a
//! reader (or the next run after a kill) only ever sees a complete snapshot.

use crate::artifact::ArtifactStore;
use crate::freshness::FreshnessPolicy;
use crate::symbol::SymbolEntry;
use crate::worker::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Longest `last_error` kept in the table, in characters.
pub const MAX_ERROR_LEN: usize = 200;

/// Per-symbol progress state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Not attempted yet in the current universe.
    Pending,
    /// Artifact downloaded and written.
    Success,
    /// Nothing to do: artifact already fresh, or the provider has no data.
    Skipped,
    /// Attempt budget exhausted; retried on the next run.
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Success => "success",
            Status::Skipped => "skipped",
            Status::Failed => "failed",
        }
    }

    /// Whether a record in this state is handed to a worker.
    pub fn is_dispatchable(&self) -> bool {
        match self {
            Status::Pending | Status::Failed => true,
            Status::Success | Status::Skipped => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the checkpoint table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub symbol_id: String,
    pub display_name: String,
    pub status: Status,
    #[serde(default)]
    pub last_error: String,
    /// Completion time of the outcome behind `status`; `None` until dispatched.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CheckpointRecord {
    pub fn new(entry: &SymbolEntry, status: Status) -> Self {
        Self {
            symbol_id: entry.symbol_id.clone(),
            display_name: entry.display_name.clone(),
            status,
            last_error: String::new(),
            updated_at: None,
        }
    }

    pub fn entry(&self) -> SymbolEntry {
        SymbolEntry::new(self.symbol_id.clone(), self.display_name.clone())
    }
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.success + self.skipped + self.failed
    }
}

/// Result of applying an update to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Applied,
    /// An outcome newer than this one was already recorded.
    Stale,
    /// No record for this symbol.
    UnknownSymbol,
}

/// In-memory checkpoint table: exactly one record per symbol id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointSet {
    records: BTreeMap<String, CheckpointRecord>,
}

impl CheckpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from records; a later duplicate symbol id replaces an earlier one.
    pub fn from_records(records: impl IntoIterator<Item = CheckpointRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.symbol_id.clone(), r))
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, symbol_id: &str) -> Option<&CheckpointRecord> {
        self.records.get(symbol_id)
    }

    /// Records in symbol order.
    pub fn records(&self) -> impl Iterator<Item = &CheckpointRecord> {
        self.records.values()
    }

    /// Entries whose status is pending or failed.
    pub fn dispatchable(&self) -> Vec<SymbolEntry> {
        self.records
            .values()
            .filter(|r| r.status.is_dispatchable())
            .map(CheckpointRecord::entry)
            .collect()
    }

    /// Hand out the dispatchable entries for a new run.
    ///
    /// Their stored `updated_at` is cleared, so last-write-wins only orders
    /// outcomes of the same run. A stamp left by an earlier run (another
    /// host, a clock step) never makes a fresh outcome stale.
    pub fn start_dispatch(&mut self) -> Vec<SymbolEntry> {
        self.records
            .values_mut()
            .filter(|r| r.status.is_dispatchable())
            .map(|r| {
                r.updated_at = None;
                r.entry()
            })
            .collect()
    }

    /// Failed records, the report-ready view for the reporting side.
    pub fn failures(&self) -> Vec<CheckpointRecord> {
        self.records
            .values()
            .filter(|r| r.status == Status::Failed)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records.values() {
            match record.status {
                Status::Pending => counts.pending += 1,
                Status::Success => counts.success += 1,
                Status::Skipped => counts.skipped += 1,
                Status::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Set one record's status, stamped with the current time.
    pub fn update(&mut self, symbol_id: &str, status: Status, error_detail: &str) -> UpdateResult {
        self.update_at(symbol_id, status, error_detail, Utc::now())
    }

    /// Fold a worker outcome into the table.
    pub fn apply(&mut self, outcome: &Outcome) -> UpdateResult {
        self.update_at(
            &outcome.symbol_id,
            outcome.status,
            &outcome.error_detail,
            outcome.completed_at,
        )
    }

    /// Last-write-wins update keyed on `completed_at`.
    pub fn update_at(
        &mut self,
        symbol_id: &str,
        status: Status,
        error_detail: &str,
        completed_at: DateTime<Utc>,
    ) -> UpdateResult {
        let Some(record) = self.records.get_mut(symbol_id) else {
            return UpdateResult::UnknownSymbol;
        };
        if record.updated_at.is_some_and(|prev| prev > completed_at) {
            return UpdateResult::Stale;
        }
        record.status = status;
        record.last_error = truncate_error(error_detail);
        record.updated_at = Some(completed_at);
        UpdateResult::Applied
    }
}

fn truncate_error(detail: &str) -> String {
    detail.trim().chars().take(MAX_ERROR_LEN).collect()
}

/// Errors from reading or writing the checkpoint table.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("checkpoint CSV on {}: {source}", path.display())]
    Csv { path: PathBuf, source: csv::Error },
}

/// The durable checkpoint table on disk.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the table on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a table has been persisted at [`Self::path`].
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read the persisted table. Absent or unreadable tables yield an empty set.
    pub fn load(&self) -> CheckpointSet {
        if !self.exists() {
            debug!(path = %self.path.display(), "no checkpoint on disk");
            return CheckpointSet::new();
        }
        match self.read() {
            Ok(set) => {
                debug!(path = %self.path.display(), records = set.len(), "checkpoint loaded");
                set
            }
            Err(e) => {
                warn!(error = %e, "checkpoint unreadable, treating as empty");
                CheckpointSet::new()
            }
        }
    }

    fn read(&self) -> Result<CheckpointSet, CheckpointError> {
        let mut rdr = csv::Reader::from_path(&self.path).map_err(|source| CheckpointError::Csv {
            path: self.path.clone(),
            source,
        })?;
        let records = rdr
            .deserialize::<CheckpointRecord>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CheckpointError::Csv {
                path: self.path.clone(),
                source,
            })?;
        Ok(CheckpointSet::from_records(records))
    }

    /// Fresh table for a newly discovered universe.
    ///
    /// Symbols whose artifact is already fresh start out `skipped`, the rest
    /// `pending`. Symbols missing from `entries` are not carried over.
    pub fn rebuild(
        &self,
        entries: &[SymbolEntry],
        artifacts: &ArtifactStore,
        freshness: &FreshnessPolicy,
    ) -> CheckpointSet {
        CheckpointSet::from_records(entries.iter().map(|entry| {
            let status = if freshness.is_fresh(&artifacts.probe(entry)) {
                Status::Skipped
            } else {
                Status::Pending
            };
            CheckpointRecord::new(entry, status)
        }))
    }

    /// Atomically replace the table on disk with `set`.
    pub fn persist(&self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        if let Err(e) = self.write_table(&tmp_path, set) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        fs::rename(&tmp_path, &self.path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            io_err(source)
        })?;

        debug!(path = %self.path.display(), records = set.len(), "checkpoint persisted");
        Ok(())
    }

    fn write_table(&self, tmp_path: &Path, set: &CheckpointSet) -> Result<(), CheckpointError> {
        let csv_err = |source| CheckpointError::Csv {
            path: tmp_path.to_path_buf(),
            source,
        };
        let io_err = |source| CheckpointError::Io {
            path: tmp_path.to_path_buf(),
            source,
        };
        let file = fs::File::create(tmp_path).map_err(io_err)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        // Header written explicitly so an empty set still produces a valid table
        wtr.write_record(["symbol_id", "display_name", "status", "last_error", "updated_at"])
            .map_err(csv_err)?;
        for record in set.records() {
            wtr.serialize(record).map_err(csv_err)?;
        }
        let buf = wtr.into_inner().map_err(|e| io_err(e.into_error()))?;
        let file = buf.into_inner().map_err(|e| io_err(e.into_error()))?;
        // Must hit the disk before the rename makes it the live table
        file.sync_all().map_err(io_err)?;
        Ok(())
    }
}
