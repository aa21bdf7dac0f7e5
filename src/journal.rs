//! Durable transaction log.
//!
//! The log is a JSON-lines file. Every line is one record:
//!
//! ```text
//! {"record":"batch","batch_id":3,"created":"...","kind":"organize","mode":"extension"}
//! {"record":"entry","entry_id":17,"batch_id":3,"outcome":"pending",...}
//! {"record":"entry","entry_id":17,"batch_id":3,"outcome":"committed",...}
//! {"record":"batch_close","batch_id":3,"closed":"...","outcome":"complete"}
//! ```
//!
//! Records are only ever appended and each append is synced to disk before
//! the call returns. An entry's current state is its last record; the
//! outcome moves from `pending` to `committed` or `failed` exactly once.
//!
//! A compacted log starts with a `checkpoint` record carrying the id
//! counters so ids stay monotonic after older batches are dropped.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// File name of the log inside the data directory.
pub const LOG_FILE_NAME: &str = "operations.jsonl";

pub type BatchId = u64;
pub type EntryId = u64;

/// Errors that make the log unusable.
#[derive(Debug)]
pub enum JournalError {
    /// Reading, writing or syncing the log file failed.
    Io { path: PathBuf, source: io::Error },
    /// A record other than the final line could not be parsed.
    Corrupt { line: usize, reason: String },
    /// A record could not be encoded.
    Encode(String),
    /// An outcome was recorded for an entry the log does not know.
    UnknownEntry(EntryId),
    /// An outcome was recorded for an entry that is no longer pending.
    AlreadyResolved { entry: EntryId, outcome: EntryOutcome },
    /// Another thread panicked while holding the log.
    Poisoned,
    /// A failed append could not be rolled back; the file may end in a
    /// partial record, so nothing more is appended until it is reopened.
    Damaged(PathBuf),
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "Transaction log {} unavailable: {}", path.display(), source)
            }
            Self::Corrupt { line, reason } => {
                write!(f, "Transaction log corrupt at line {}: {}", line, reason)
            }
            Self::Encode(reason) => write!(f, "Cannot encode log record: {}", reason),
            Self::UnknownEntry(id) => write!(f, "Unknown log entry {}", id),
            Self::AlreadyResolved { entry, outcome } => {
                write!(f, "Log entry {} is already {}", entry, outcome)
            }
            Self::Poisoned => write!(f, "Transaction log lock poisoned"),
            Self::Damaged(path) => write!(
                f,
                "Transaction log {} holds a partial record; reopen it to recover",
                path.display()
            ),
        }
    }
}

impl std::error::Error for JournalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for JournalError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Poisoned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Organize,
    Undo,
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Organize => write!(f, "organize"),
            Self::Undo => write!(f, "undo"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    Pending,
    Committed,
    Failed,
}

impl std::fmt::Display for EntryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Committed => write!(f, "committed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every file was attempted.
    Complete,
    /// Cancelled before every file was attempted.
    Partial,
    /// Stopped because the log could not be written.
    Aborted,
}

impl std::fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Opening record of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub batch_id: BatchId,
    pub created: DateTime<Utc>,
    pub kind: BatchKind,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverts_batch: Option<BatchId>,
}

/// One attempted file operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEntry {
    pub entry_id: EntryId,
    pub batch_id: BatchId,
    pub timestamp: DateTime<Utc>,
    pub mode: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub outcome: EntryOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Entry undone by this one; set only in undo batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverts: Option<EntryId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchClose {
    pub batch_id: BatchId,
    pub closed: DateTime<Utc>,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LogRecord {
    Checkpoint {
        next_batch_id: BatchId,
        next_entry_id: EntryId,
    },
    Batch(BatchHeader),
    Entry(OperationEntry),
    BatchClose(BatchClose),
}

/// Data for a new pending entry.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub batch_id: BatchId,
    pub mode: &'a str,
    pub source: &'a Path,
    pub destination: &'a Path,
    pub size: u64,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub reverts: Option<EntryId>,
}

/// A batch as seen in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationBatch {
    pub header: BatchHeader,
    pub entries: Vec<EntryId>,
    /// `None` while open, or when the process died before closing it.
    pub outcome: Option<BatchOutcome>,
}

/// Result of [`TransactionLog::compact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub kept: Vec<BatchId>,
    pub dropped: Vec<BatchId>,
}

/// The append-only operation log.
pub struct TransactionLog {
    path: PathBuf,
    file: File,
    records: Vec<LogRecord>,
    next_batch_id: BatchId,
    next_entry_id: EntryId,
    damaged: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("path", &self.path)
            .field("records", &self.records.len())
            .finish()
    }
}

impl TransactionLog {
    /// Opens (or creates) the log at `path` and loads its records.
    ///
    /// A final line that does not parse is the remains of an interrupted
    /// append: it is dropped from the file with a warning.
    ///
    /// # Errors
    ///
    /// Returns `JournalError::Corrupt` when any other line does not parse.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let io_err = |source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err(e)),
        };

        let (records, valid_len) = parse_records(&content)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;

        if valid_len < content.len() {
            file.set_len(valid_len as u64).map_err(io_err)?;
            file.sync_data().map_err(io_err)?;
        } else if !content.is_empty() && !content.ends_with('\n') {
            file.write_all(b"\n").map_err(io_err)?;
            file.sync_data().map_err(io_err)?;
        }

        let (next_batch_id, next_entry_id) = next_ids(&records);
        debug!(
            "Opened transaction log {} ({} records)",
            path.display(),
            records.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            records,
            next_batch_id,
            next_entry_id,
            damaged: false,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and syncs it.
    ///
    /// On failure the file is cut back to its previous length, so a partial
    /// line never ends up in front of a later record.
    fn append(&mut self, record: LogRecord) -> Result<(), JournalError> {
        if self.damaged {
            return Err(JournalError::Damaged(self.path.clone()));
        }

        let mut line =
            serde_json::to_string(&record).map_err(|e| JournalError::Encode(e.to_string()))?;
        line.push('\n');

        let start = self
            .file
            .metadata()
            .map_err(|source| JournalError::Io {
                path: self.path.clone(),
                source,
            })?
            .len();

        if let Err(source) = self.write_line(line.as_bytes()) {
            if let Err(e) = self.file.set_len(start).and_then(|()| self.file.sync_data()) {
                warn!(
                    "Cannot roll back failed append to {}: {}",
                    self.path.display(),
                    e
                );
                self.damaged = true;
            }
            return Err(JournalError::Io {
                path: self.path.clone(),
                source,
            });
        }

        self.records.push(record);
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line)?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("sync failed"));
        }
        self.file.sync_data()
    }

    /// Makes the next append write its line and then fail to sync.
    #[cfg(test)]
    pub(crate) fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    /// Opens a new batch and returns its id.
    pub fn begin_batch(
        &mut self,
        kind: BatchKind,
        mode: &str,
        reverts_batch: Option<BatchId>,
    ) -> Result<BatchId, JournalError> {
        let batch_id = self.next_batch_id;
        self.append(LogRecord::Batch(BatchHeader {
            batch_id,
            created: Utc::now(),
            kind,
            mode: mode.to_string(),
            reverts_batch,
        }))?;
        self.next_batch_id += 1;
        info!("Opened {} batch {} ({})", kind, batch_id, mode);
        Ok(batch_id)
    }

    /// Records an operation about to be attempted.
    pub fn append_pending(&mut self, entry: NewEntry<'_>) -> Result<EntryId, JournalError> {
        let entry_id = self.next_entry_id;
        self.append(LogRecord::Entry(OperationEntry {
            entry_id,
            batch_id: entry.batch_id,
            timestamp: Utc::now(),
            mode: entry.mode.to_string(),
            source: entry.source.to_path_buf(),
            destination: entry.destination.to_path_buf(),
            outcome: EntryOutcome::Pending,
            error: None,
            size: entry.size,
            source_timestamp: entry.source_timestamp,
            reverts: entry.reverts,
        }))?;
        self.next_entry_id += 1;
        Ok(entry_id)
    }

    /// Records the terminal outcome of a pending entry.
    pub fn append_outcome(
        &mut self,
        entry_id: EntryId,
        outcome: EntryOutcome,
        error: Option<String>,
    ) -> Result<(), JournalError> {
        let current = self
            .entry(entry_id)
            .ok_or(JournalError::UnknownEntry(entry_id))?;
        if current.outcome != EntryOutcome::Pending || outcome == EntryOutcome::Pending {
            return Err(JournalError::AlreadyResolved {
                entry: entry_id,
                outcome: current.outcome,
            });
        }

        let resolved = OperationEntry {
            timestamp: Utc::now(),
            outcome,
            error,
            ..current
        };
        self.append(LogRecord::Entry(resolved))
    }

    pub fn close_batch(
        &mut self,
        batch_id: BatchId,
        outcome: BatchOutcome,
    ) -> Result<(), JournalError> {
        self.append(LogRecord::BatchClose(BatchClose {
            batch_id,
            closed: Utc::now(),
            outcome,
        }))?;
        info!("Closed batch {} as {}", batch_id, outcome);
        Ok(())
    }

    /// Current state of one entry.
    pub fn entry(&self, entry_id: EntryId) -> Option<OperationEntry> {
        self.records.iter().rev().find_map(|record| match record {
            LogRecord::Entry(entry) if entry.entry_id == entry_id => Some(entry.clone()),
            _ => None,
        })
    }

    /// All batches in creation order.
    pub fn batches(&self) -> Vec<OperationBatch> {
        let mut batches: BTreeMap<BatchId, OperationBatch> = BTreeMap::new();
        for record in &self.records {
            match record {
                LogRecord::Batch(header) => {
                    batches.insert(
                        header.batch_id,
                        OperationBatch {
                            header: header.clone(),
                            entries: Vec::new(),
                            outcome: None,
                        },
                    );
                }
                LogRecord::Entry(entry) => {
                    if let Some(batch) = batches.get_mut(&entry.batch_id)
                        && !batch.entries.contains(&entry.entry_id)
                    {
                        batch.entries.push(entry.entry_id);
                    }
                }
                LogRecord::BatchClose(close) => {
                    if let Some(batch) = batches.get_mut(&close.batch_id) {
                        batch.outcome = Some(close.outcome);
                    }
                }
                LogRecord::Checkpoint { .. } => {}
            }
        }
        batches.into_values().collect()
    }

    pub fn batch(&self, batch_id: BatchId) -> Option<OperationBatch> {
        self.batches()
            .into_iter()
            .find(|batch| batch.header.batch_id == batch_id)
    }

    /// Current state of every entry of a batch, in the order attempted.
    pub fn entries_for_batch(&self, batch_id: BatchId) -> Vec<OperationEntry> {
        let mut latest: BTreeMap<EntryId, OperationEntry> = BTreeMap::new();
        for record in &self.records {
            if let LogRecord::Entry(entry) = record
                && entry.batch_id == batch_id
            {
                latest.insert(entry.entry_id, entry.clone());
            }
        }
        latest.into_values().collect()
    }

    fn latest_entries(&self) -> BTreeMap<EntryId, &OperationEntry> {
        let mut latest = BTreeMap::new();
        for record in &self.records {
            if let LogRecord::Entry(entry) = record {
                latest.insert(entry.entry_id, entry);
            }
        }
        latest
    }

    /// Entries still pending, which in a closed or abandoned batch means
    /// the outcome of the move is unknown.
    pub fn unresolved(&self) -> Vec<OperationEntry> {
        self.latest_entries()
            .into_values()
            .filter(|entry| entry.outcome == EntryOutcome::Pending)
            .cloned()
            .collect()
    }

    /// Ids of entries undone by a committed undo entry.
    pub fn reverted_entries(&self) -> HashSet<EntryId> {
        self.latest_entries()
            .into_values()
            .filter(|entry| entry.outcome == EntryOutcome::Committed)
            .filter_map(|entry| entry.reverts)
            .collect()
    }

    /// Rewrites the log keeping the newest `keep` batches, every batch with
    /// unresolved entries, and the undo batches of kept batches.
    ///
    /// The new log is written beside the old one, synced, and renamed over it.
    pub fn compact(&mut self, keep: usize) -> Result<CompactionReport, JournalError> {
        let batches = self.batches();
        let unresolved: HashSet<BatchId> =
            self.unresolved().iter().map(|entry| entry.batch_id).collect();

        let mut kept: BTreeSet<BatchId> = batches
            .iter()
            .rev()
            .take(keep)
            .map(|batch| batch.header.batch_id)
            .collect();
        kept.extend(unresolved);
        for batch in &batches {
            if let Some(reverted) = batch.header.reverts_batch
                && kept.contains(&reverted)
            {
                kept.insert(batch.header.batch_id);
            }
        }

        let mut records = vec![LogRecord::Checkpoint {
            next_batch_id: self.next_batch_id,
            next_entry_id: self.next_entry_id,
        }];
        records.extend(
            self.records
                .iter()
                .filter(|record| match record {
                    LogRecord::Batch(header) => kept.contains(&header.batch_id),
                    LogRecord::Entry(entry) => kept.contains(&entry.batch_id),
                    LogRecord::BatchClose(close) => kept.contains(&close.batch_id),
                    LogRecord::Checkpoint { .. } => false,
                })
                .cloned(),
        );

        let mut content = String::new();
        for record in &records {
            let line =
                serde_json::to_string(record).map_err(|e| JournalError::Encode(e.to_string()))?;
            content.push_str(&line);
            content.push('\n');
        }

        let io_err = |source| JournalError::Io {
            path: self.path.clone(),
            source,
        };
        let staging = self.path.with_extension("jsonl.compact");
        {
            let mut staged = File::create(&staging).map_err(io_err)?;
            staged.write_all(content.as_bytes()).map_err(io_err)?;
            staged.sync_all().map_err(io_err)?;
        }
        fs::rename(&staging, &self.path).map_err(io_err)?;
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        self.records = records;
        self.damaged = false;

        let dropped: Vec<BatchId> = batches
            .iter()
            .map(|batch| batch.header.batch_id)
            .filter(|id| !kept.contains(id))
            .collect();
        info!(
            "Compacted transaction log: kept {} batches, dropped {}",
            kept.len(),
            dropped.len()
        );

        Ok(CompactionReport {
            kept: kept.into_iter().collect(),
            dropped,
        })
    }
}

/// Parses log content, returning the records and the byte length of the
/// valid prefix.
fn parse_records(content: &str) -> Result<(Vec<LogRecord>, usize), JournalError> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let mut records = Vec::with_capacity(lines.len());
    let mut valid_len = 0;

    for (index, raw) in lines.iter().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            valid_len += raw.len();
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => {
                records.push(record);
                valid_len += raw.len();
            }
            Err(e) if index + 1 == lines.len() => {
                warn!(
                    "Ignoring truncated final record at line {}: {}",
                    index + 1,
                    e
                );
                return Ok((records, valid_len));
            }
            Err(e) => {
                return Err(JournalError::Corrupt {
                    line: index + 1,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok((records, valid_len))
}

fn next_ids(records: &[LogRecord]) -> (BatchId, EntryId) {
    let mut next_batch = 1;
    let mut next_entry = 1;
    for record in records {
        match record {
            LogRecord::Checkpoint {
                next_batch_id,
                next_entry_id,
            } => {
                next_batch = next_batch.max(*next_batch_id);
                next_entry = next_entry.max(*next_entry_id);
            }
            LogRecord::Batch(header) => next_batch = next_batch.max(header.batch_id + 1),
            LogRecord::Entry(entry) => next_entry = next_entry.max(entry.entry_id + 1),
            LogRecord::BatchClose(_) => {}
        }
    }
    (next_batch, next_entry)
}
