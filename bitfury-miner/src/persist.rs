//! Clock table record kept across restarts.
//!
//! One line per slot, one `;`-terminated entry per chip:
//!
//! ```text
//! slot_1=0:[0,1,5,0]@{2.01,2.43,3.18,2.60}; 1:[0,0,2,1]@{1.95,2.38,3.02,2.91};
//! ```
//!
//! The bracketed numbers are the selection counts of the four candidate
//! settings, the braced ones their rate estimates in GH/s. Lines that do not
//! mention `slot_` are ignored; lines that do but fail to parse are skipped
//! as a whole with a warning.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::chip::clock::{ClockTable, SETTING_COUNT};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::ChipKey;

/// Persisted clock tables, keyed by chip.
pub type ClockRecord = BTreeMap<ChipKey, ClockTable>;

/// Render `tables` in record format, slots and positions in ascending order.
pub fn format_record<'a>(tables: impl IntoIterator<Item = (ChipKey, &'a ClockTable)>) -> String {
    let mut by_slot: BTreeMap<u8, Vec<(u8, &ClockTable)>> = BTreeMap::new();
    for (key, table) in tables {
        by_slot.entry(key.slot).or_default().push((key.position, table));
    }

    let mut out = String::new();
    for (slot, mut chips) in by_slot {
        chips.sort_by_key(|(pos, _)| *pos);
        out.push_str(&format!("slot_{:X}=", slot));
        for (pos, table) in chips {
            let counts: Vec<String> = table.selection_count.iter().map(u32::to_string).collect();
            let rates: Vec<String> = table
                .rate_estimate
                .iter()
                .map(|r| format!("{:.2}", r))
                .collect();
            out.push_str(&format!(
                "{}:[{}]@{{{}}}; ",
                pos,
                counts.join(","),
                rates.join(",")
            ));
        }
        out.push('\n');
    }
    out
}

/// Parse a whole record, skipping lines that fail to parse.
pub fn parse_record(text: &str) -> ClockRecord {
    let mut record = ClockRecord::new();
    for (index, line) in text.lines().enumerate() {
        match parse_line(line, index + 1) {
            Ok(entries) => record.extend(entries),
            Err(e) => warn!(error = %e, "Skipping clock record line."),
        }
    }
    record
}

/// Parse one line. Lines without a slot marker yield no entries.
pub fn parse_line(line: &str, number: usize) -> Result<Vec<(ChipKey, ClockTable)>> {
    let malformed = |reason: String| Error::MalformedRecord {
        line: number,
        reason,
    };

    let line = line.trim();
    if line.starts_with('#') {
        return Ok(Vec::new());
    }
    let Some(start) = line.find("slot_") else {
        return Ok(Vec::new());
    };
    let rest = &line[start + "slot_".len()..];

    let (slot, entries) = rest
        .split_once('=')
        .ok_or_else(|| malformed("missing '='".into()))?;
    let slot = u8::from_str_radix(slot.trim(), 16)
        .map_err(|e| malformed(format!("bad slot {:?}: {}", slot, e)))?;

    let mut parsed = Vec::new();
    for entry in entries.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (position, table) = parse_entry(entry).map_err(malformed)?;
        parsed.push((ChipKey::new(slot, position), table));
    }
    Ok(parsed)
}

fn parse_entry(entry: &str) -> std::result::Result<(u8, ClockTable), String> {
    let (position, rest) = entry
        .split_once(':')
        .ok_or_else(|| format!("entry {:?} lacks ':'", entry))?;
    let position: u8 = position
        .trim()
        .parse()
        .map_err(|e| format!("bad position {:?}: {}", position, e))?;

    let (counts, rates) = rest
        .split_once('@')
        .ok_or_else(|| format!("entry {:?} lacks '@'", entry))?;
    let counts = counts
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| format!("counts not bracketed in {:?}", entry))?;
    let rates = rates
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| format!("rates not braced in {:?}", entry))?;

    let selection_count = parse_four(counts)?;
    let rate_estimate: [f64; SETTING_COUNT] = parse_four(rates)?;
    if let Some(rate) = rate_estimate.iter().find(|r| !r.is_finite() || **r < 0.0) {
        return Err(format!("bad rate {} in {:?}", rate, entry));
    }

    Ok((
        position,
        ClockTable {
            selection_count,
            rate_estimate,
        },
    ))
}

fn parse_four<T>(list: &str) -> std::result::Result<[T; SETTING_COUNT], String>
where
    T: std::str::FromStr + Default + Copy,
    T::Err: std::fmt::Display,
{
    let mut values = [T::default(); SETTING_COUNT];
    let mut items = list.split(',');
    for value in values.iter_mut() {
        let item = items
            .next()
            .ok_or_else(|| format!("expected {} values in {:?}", SETTING_COUNT, list))?;
        *value = item
            .trim()
            .parse()
            .map_err(|e| format!("bad value {:?}: {}", item, e))?;
    }
    if items.next().is_some() {
        return Err(format!("expected {} values in {:?}", SETTING_COUNT, list));
    }
    Ok(values)
}

/// File backing the clock record.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. A missing file is an empty record.
    pub fn load(&self) -> Result<ClockRecord> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_record(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No clock record yet.");
                Ok(ClockRecord::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the record with `tables`.
    ///
    /// The new content is written next to the record and renamed over it, so
    /// a crash mid-write leaves the previous record intact.
    pub fn save<'a>(&self, tables: impl IntoIterator<Item = (ChipKey, &'a ClockTable)>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, format_record(tables))?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}
