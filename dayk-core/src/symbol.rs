//! Symbol entries, the unit of work handed to the pipeline.
//!
//! Entries arrive from a universe source in the listing format `SYMBOL&Name`.
//! The artifact filename for an entry is derived from both parts: the symbol
//! id is percent-escaped (so distinct ids never share a file), the display
//! name is only cleaned up for readability.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write;

/// Display name used when a listing item carries no name.
pub const UNKNOWN_NAME: &str = "unknown";

/// One tradable identifier and its human-readable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub symbol_id: String,
    pub display_name: String,
}

impl SymbolEntry {
    pub fn new(symbol_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            symbol_id: symbol_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Parse a listing item of the form `SYMBOL&Name`.
    ///
    /// Only the first `&` separates the parts, so names may contain `&`.
    /// A bare `SYMBOL` gets [`UNKNOWN_NAME`]. Returns `None` when the symbol
    /// part is empty.
    pub fn parse_item(item: &str) -> Option<Self> {
        let (symbol, name) = match item.split_once('&') {
            Some((symbol, name)) => (symbol.trim(), name.trim()),
            None => (item.trim(), ""),
        };
        if symbol.is_empty() {
            return None;
        }
        let name = if name.is_empty() { UNKNOWN_NAME } else { name };
        Some(Self::new(symbol, name))
    }

    /// Render back into the `SYMBOL&Name` listing format.
    pub fn to_item(&self) -> String {
        format!("{}&{}", self.symbol_id, self.display_name)
    }

    /// Deterministic artifact file stem: `{symbol}_{name}`.
    ///
    /// The escaped symbol never contains `_`, so the stem's prefix up to the
    /// first `_` identifies the symbol exactly.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}",
            escape_symbol(&self.symbol_id),
            sanitize_name(&self.display_name)
        )
    }
}

/// Collapse duplicate symbol ids, keeping the first entry seen and the
/// original order. Entries with an empty symbol id are dropped.
pub fn dedup_entries(entries: impl IntoIterator<Item = SymbolEntry>) -> Vec<SymbolEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| !e.symbol_id.trim().is_empty())
        .filter(|e| seen.insert(e.symbol_id.clone()))
        .collect()
}

/// Injective filename encoding of a symbol id.
///
/// ASCII alphanumerics, `-` and non-leading `.` pass through; every other
/// byte becomes `%XX`. An empty id maps to a lone `%`, which no escape
/// sequence can produce.
fn escape_symbol(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(raw.len());
    for (i, byte) in raw.bytes().enumerate() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0) {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// Keep alphanumerics, `-`, `_` and inner spaces; everything else becomes
/// `_`. Lossy, which is fine: uniqueness comes from the symbol part.
fn sanitize_name(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = mapped.trim();
    if trimmed.is_empty() {
        UNKNOWN_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}
