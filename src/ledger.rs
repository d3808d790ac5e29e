//! The conversion ledger: a CSV table with one row per subject and one column
//! per sequence label, shared by every run that converts into the same tree.
//!
//! Cells hold the space separated output paths of a sequence or one of the
//! [`LedgerStatus`] tokens. Every write re-reads and rewrites the whole file
//! under a [`LockGuard`]; when the lock cannot be had in time the entry goes
//! to a side ledger next to the primary one instead.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use csv::{ReaderBuilder, WriterBuilder};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::enums::LedgerStatus;
use crate::lock::{self, LockError, LockGuard};
use crate::orchestrator::ConversionOutcome;

pub const INDEX_COLUMN: &str = "ID";
pub const UPDATED_COLUMN: &str = "Time_Last_Update";
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d-%H:%M:%S";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path} has no header row")]
    MissingHeader { path: PathBuf },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct LedgerRow {
    id: String,
    cells: BTreeMap<String, String>,
}

/// In-memory ledger table. Rows and columns keep their first-seen order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ledger {
    columns: Vec<String>,
    rows: Vec<LedgerRow>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// Empty table with only the last-updated column.
    pub fn new() -> Self {
        Self {
            columns: vec![UPDATED_COLUMN.to_string()],
            rows: Vec::new(),
        }
    }

    pub fn read(path: &Path) -> Result<Self, LedgerError> {
        let csv_error = |source| LedgerError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(csv_error)?;
        let headers = reader.headers().map_err(csv_error)?.clone();
        if headers.is_empty() {
            return Err(LedgerError::MissingHeader {
                path: path.to_path_buf(),
            });
        }

        let mut ledger = Self {
            columns: headers
                .iter()
                .skip(1)
                .map(|h| h.trim_matches('\u{feff}').to_string())
                .collect(),
            rows: Vec::new(),
        };
        if !ledger.columns.iter().any(|c| c == UPDATED_COLUMN) {
            ledger.columns.insert(0, UPDATED_COLUMN.to_string());
        }
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            let Some(id) = record.get(0) else { continue };
            let cells = headers
                .iter()
                .zip(record.iter())
                .skip(1)
                .filter(|(_, value)| !value.is_empty())
                .map(|(column, value)| (column.to_string(), value.to_string()))
                .collect();
            ledger.rows.push(LedgerRow {
                id: id.to_string(),
                cells,
            });
        }
        Ok(ledger)
    }

    /// Reads `path`, or starts an empty table when it does not exist.
    pub fn read_or_new(path: &Path) -> Result<Self, LedgerError> {
        if path.exists() {
            Self::read(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Writes the table to a temporary file next to `path` and renames it
    /// into place, so readers never see a partial table.
    pub fn write(&self, path: &Path) -> Result<(), LedgerError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let file = NamedTempFile::new_in(dir)?;
        let csv_error = |source| LedgerError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut writer = WriterBuilder::new().from_writer(file);
        let header = std::iter::once(INDEX_COLUMN).chain(self.columns.iter().map(String::as_str));
        writer.write_record(header).map_err(csv_error)?;
        for row in &self.rows {
            let values = std::iter::once(row.id.as_str()).chain(
                self.columns
                    .iter()
                    .map(|column| row.cells.get(column).map_or("", String::as_str)),
            );
            writer.write_record(values).map_err(csv_error)?;
        }
        let file = writer
            .into_inner()
            .map_err(|error| LedgerError::Io(error.into_error()))?;
        file.persist(path).map_err(|error| LedgerError::Io(error.error))?;
        Ok(())
    }

    /// Sequence columns, without the last-updated column.
    pub fn sequences(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .map(String::as_str)
            .filter(|column| *column != UPDATED_COLUMN)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|row| row.id.as_str())
    }

    fn row(&self, subject: &str) -> Option<&LedgerRow> {
        self.rows.iter().find(|row| row.id == subject)
    }

    /// Non-empty cell at (subject, column).
    pub fn cell(&self, subject: &str, column: &str) -> Option<&str> {
        self.row(subject)
            .and_then(|row| row.cells.get(column))
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Sets a cell, adding the row and column when they are new.
    pub fn set(&mut self, subject: &str, column: &str, value: impl Into<String>) {
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
        let index = match self.rows.iter().position(|row| row.id == subject) {
            Some(index) => index,
            None => {
                self.rows.push(LedgerRow {
                    id: subject.to_string(),
                    cells: BTreeMap::new(),
                });
                self.rows.len() - 1
            }
        };
        self.rows[index].cells.insert(column.to_string(), value.into());
    }

    pub fn stamp(&mut self, subject: &str, at: NaiveDateTime) {
        self.set(subject, UPDATED_COLUMN, at.format(TIMESTAMP_FORMAT).to_string());
    }

    /// Sets a sequence cell and stamps the subject with `at`.
    pub fn record_at(&mut self, subject: &str, sequence: &str, value: &str, at: NaiveDateTime) {
        self.set(subject, sequence, value);
        self.stamp(subject, at);
    }

    pub fn record(&mut self, subject: &str, sequence: &str, value: &str) {
        self.record_at(subject, sequence, value, Local::now().naive_local());
    }
}

/// Paths referenced by a cell; status tokens reference nothing.
fn cell_paths(cell: &str) -> Vec<&str> {
    if LedgerStatus::from_token(cell.trim()).is_some() {
        return Vec::new();
    }
    cell.split_whitespace().collect()
}

/// Whether a cell names at least one file and all of them exist.
fn all_files_exist(cell: &str) -> bool {
    let paths = cell_paths(cell);
    !paths.is_empty() && paths.iter().all(|path| Path::new(path).exists())
}

/// Number of files referenced by `cell` that exist.
pub fn count_existing_files(cell: &str) -> usize {
    cell_paths(cell)
        .into_iter()
        .filter(|path| Path::new(path).exists())
        .count()
}

/// True when the ledger records output for (subject, sequence) and that
/// output is still on disk.
pub fn is_converted(ledger: &Ledger, subject: &str, sequence: &str) -> bool {
    ledger
        .cell(subject, sequence)
        .is_some_and(all_files_exist)
}

/// Cell text recording `outcome`; `None` for outcomes that are not recorded.
pub fn outcome_cell(outcome: &ConversionOutcome) -> Option<String> {
    match outcome {
        ConversionOutcome::Converted { volumes } if volumes.is_empty() => {
            Some(LedgerStatus::NotAvailable.token().to_string())
        }
        ConversionOutcome::Converted { volumes } => Some(
            volumes
                .iter()
                .map(|v| v.volume.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" "),
        ),
        ConversionOutcome::SortFailed => Some(LedgerStatus::SortFailed.token().to_string()),
        ConversionOutcome::ConvertFailed => Some(LedgerStatus::ConvertFailed.token().to_string()),
        ConversionOutcome::Skipped => None,
    }
}

/// How long to wait for the ledger lock and how often to retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Which file received an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerTarget {
    Primary,
    /// The lock timed out; the entry went to this process's side ledger.
    Side,
}

/// A ledger file shared between processes.
///
/// After one lock timeout the ledger stays degraded: every later lookup and
/// write goes straight to the side ledger without waiting again.
#[derive(Clone, Debug)]
pub struct ConversionLedger {
    path: PathBuf,
    side_path: PathBuf,
    policy: LockPolicy,
    degraded: Cell<bool>,
}

impl ConversionLedger {
    pub fn new(path: impl Into<PathBuf>, policy: LockPolicy) -> Self {
        let path = path.into();
        let mut side_path = path.as_os_str().to_owned();
        side_path.push(format!("_{}", lock::unique_token()));
        Self {
            path,
            side_path: PathBuf::from(side_path),
            policy,
            degraded: Cell::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where entries go when the primary ledger stays locked.
    pub fn side_path(&self) -> &Path {
        &self.side_path
    }

    /// Whether a lock timeout has redirected this ledger to its side file.
    pub fn is_degraded(&self) -> bool {
        self.degraded.get()
    }

    fn lock(&self) -> Result<Option<LockGuard>, LedgerError> {
        if self.degraded.get() {
            return Ok(None);
        }
        match LockGuard::acquire(&self.path, self.policy.timeout, self.policy.poll_interval) {
            Ok(guard) => Ok(Some(guard)),
            Err(LockError::Timeout { path, waited }) => {
                warn!(lock = %path.display(), ?waited, side = %self.side_path.display(), "ledger lock timed out, using side ledger for the rest of the run");
                self.degraded.set(true);
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Whether (subject, sequence) is recorded with output that still exists.
    pub fn is_converted(&self, subject: &str, sequence: &str) -> Result<bool, LedgerError> {
        let guard = self.lock()?;
        let path = if guard.is_some() {
            &self.path
        } else {
            &self.side_path
        };
        if !path.exists() {
            return Ok(false);
        }
        Ok(is_converted(&Ledger::read(path)?, subject, sequence))
    }

    /// Records `outcome` under (subject, sequence) and stamps the subject.
    ///
    /// Returns the file written, or `None` for outcomes that are not recorded.
    pub fn log_outcome(
        &self,
        subject: &str,
        sequence: &str,
        outcome: &ConversionOutcome,
    ) -> Result<Option<LedgerTarget>, LedgerError> {
        let Some(value) = outcome_cell(outcome) else {
            return Ok(None);
        };
        let guard = self.lock()?;
        let (path, target) = match &guard {
            Some(_) => (&self.path, LedgerTarget::Primary),
            None => (&self.side_path, LedgerTarget::Side),
        };
        let mut ledger = Ledger::read_or_new(path)?;
        ledger.record(subject, sequence, &value);
        ledger.write(path)?;
        debug!(ledger = %path.display(), subject, sequence, value = %value, "recorded outcome");
        drop(guard);
        Ok(Some(target))
    }
}

/// Groups sequence columns into one coarse modality column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModalityRule {
    pub modality: String,
    pub keywords: Vec<String>,
    /// Columns containing any of these are left out even when a keyword hits.
    pub excluded: Vec<String>,
}

impl ModalityRule {
    pub fn new(modality: &str, keywords: &[&str], excluded: &[&str]) -> Self {
        let upper = |words: &[&str]| words.iter().map(|w| w.to_uppercase()).collect();
        Self {
            modality: modality.to_uppercase(),
            keywords: upper(keywords),
            excluded: upper(excluded),
        }
    }

    pub fn matches(&self, column: &str) -> bool {
        let column = column.to_uppercase();
        self.keywords.iter().any(|k| column.contains(k.as_str()))
            && !self.excluded.iter().any(|e| column.contains(e.as_str()))
    }
}

pub fn default_modality_rules() -> Vec<ModalityRule> {
    vec![
        ModalityRule::new("T1", &["T1"], &[]),
        ModalityRule::new("T2", &["T2"], &["FLAIR", "QUICK"]),
        ModalityRule::new("FLAIR", &["FLAIR"], &[]),
        ModalityRule::new("DTI", &["DTI", "DWI"], &["TRACE", "FADTI", "EDTI", "DDTI", "ISODTI"]),
        ModalityRule::new("PCASL", &["PCASL"], &["CALI", "M0"]),
        ModalityRule::new("RESTING", &["REST", "RSFMRI"], &[]),
        ModalityRule::new("BOLD_BREATHHOLD", &["BREATH", "HOLD", "HELD"], &[]),
    ]
}

/// Joins two cells, keeping only those whose files all exist.
fn combine_cells(left: Option<String>, right: Option<&str>) -> Option<String> {
    let left = left.filter(|cell| all_files_exist(cell));
    let right = right.filter(|cell| all_files_exist(cell));
    match (left, right) {
        (Some(left), Some(right)) => Some(format!("{left} {right}")),
        (Some(left), None) => Some(left),
        (None, Some(right)) => Some(right.to_string()),
        (None, None) => None,
    }
}

/// One column per modality, joining the cells of every sequence column the
/// rule matches. Every subject of `ledger` appears and is stamped with `at`.
pub fn merge_by_modality_at(ledger: &Ledger, rules: &[ModalityRule], at: NaiveDateTime) -> Ledger {
    let mut merged = Ledger::new();
    for subject in ledger.subjects() {
        merged.stamp(subject, at);
    }
    for rule in rules {
        let columns: Vec<&str> = ledger.sequences().filter(|c| rule.matches(c)).collect();
        if columns.is_empty() {
            warn!(modality = %rule.modality, "no matching column");
            continue;
        }
        info!(modality = %rule.modality, columns = ?columns, "merging columns");
        if !merged.columns.contains(&rule.modality) {
            merged.columns.push(rule.modality.clone());
        }
        for subject in ledger.subjects() {
            let combined = columns.iter().fold(None, |acc, column| {
                combine_cells(acc, ledger.cell(subject, column))
            });
            if let Some(value) = combined {
                merged.set(subject, &rule.modality, value);
            }
        }
    }
    merged
}

pub fn merge_by_modality(ledger: &Ledger, rules: &[ModalityRule]) -> Ledger {
    merge_by_modality_at(ledger, rules, Local::now().naive_local())
}
