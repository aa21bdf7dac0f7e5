//! Journaled file moves.
//!
//! Every move is bracketed by two log records: a `pending` record written
//! before the filesystem is touched and a `committed` or `failed` record
//! written after. A move that cannot be journaled is never attempted.

use crate::journal::{BatchId, EntryId, EntryOutcome, JournalError, NewEntry, TransactionLog};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// `ENAMETOOLONG` / `ERROR_FILENAME_EXCED_RANGE` for the current platform.
#[cfg(target_os = "linux")]
const NAME_TOO_LONG: i32 = 36;
#[cfg(target_os = "macos")]
const NAME_TOO_LONG: i32 = 63;
#[cfg(windows)]
const NAME_TOO_LONG: i32 = 206;
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const NAME_TOO_LONG: i32 = 63;

/// `EXDEV` / `ERROR_NOT_SAME_DEVICE`.
#[cfg(unix)]
const CROSS_DEVICE: i32 = 18;
#[cfg(windows)]
const CROSS_DEVICE: i32 = 17;
#[cfg(not(any(unix, windows)))]
const CROSS_DEVICE: i32 = 18;

/// Why a single file could not be placed.
#[derive(Debug)]
pub enum MoveError {
    PermissionDenied(PathBuf),
    DiskFull(PathBuf),
    /// The file to move disappeared after it was scanned.
    SourceVanished(PathBuf),
    NotFound(PathBuf),
    CrossDevice(PathBuf),
    NameTooLong(PathBuf),
    /// Something appeared at the destination after it was checked.
    DestinationOccupied(PathBuf),
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    /// No free disambiguated name was found.
    CollisionExhausted(PathBuf),
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// The log could not be written; the whole batch must stop.
    Journal(JournalError),
}

impl MoveError {
    /// Whether this error ends the batch rather than just the file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Journal(_))
    }

    /// Maps an I/O error on `path` to the matching variant.
    pub fn from_io(error: io::Error, path: &Path) -> Self {
        let path = path.to_path_buf();
        match error.kind() {
            io::ErrorKind::PermissionDenied => return Self::PermissionDenied(path),
            io::ErrorKind::StorageFull => return Self::DiskFull(path),
            io::ErrorKind::NotFound => return Self::NotFound(path),
            io::ErrorKind::CrossesDevices => return Self::CrossDevice(path),
            _ => {}
        }
        match error.raw_os_error() {
            Some(NAME_TOO_LONG) => Self::NameTooLong(path),
            Some(CROSS_DEVICE) => Self::CrossDevice(path),
            _ => Self::Io {
                path,
                source: error,
            },
        }
    }
}

impl std::fmt::Display for MoveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied(path) => write!(f, "Permission denied: {}", path.display()),
            Self::DiskFull(path) => write!(f, "No space left writing {}", path.display()),
            Self::SourceVanished(path) => {
                write!(f, "Source no longer exists: {}", path.display())
            }
            Self::NotFound(path) => write!(f, "Not found: {}", path.display()),
            Self::CrossDevice(path) => {
                write!(f, "Cannot move across devices: {}", path.display())
            }
            Self::NameTooLong(path) => write!(f, "Path too long: {}", path.display()),
            Self::DestinationOccupied(path) => {
                write!(f, "Destination already exists: {}", path.display())
            }
            Self::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "Copy of {} has {} bytes, expected {}",
                path.display(),
                actual,
                expected
            ),
            Self::CollisionExhausted(path) => {
                write!(f, "No free name left for {}", path.display())
            }
            Self::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            Self::Journal(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MoveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Journal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<JournalError> for MoveError {
    fn from(e: JournalError) -> Self {
        Self::Journal(e)
    }
}

/// One file to move.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size: u64,
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Entry this move undoes.
    pub reverts: Option<EntryId>,
}

/// Performs moves for one batch, journaling each one.
pub struct MoveExecutor<'a> {
    journal: &'a Mutex<TransactionLog>,
    batch_id: BatchId,
    mode: &'a str,
}

impl<'a> MoveExecutor<'a> {
    pub fn new(journal: &'a Mutex<TransactionLog>, batch_id: BatchId, mode: &'a str) -> Self {
        Self {
            journal,
            batch_id,
            mode,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Moves one file and returns the id of its committed entry.
    ///
    /// # Errors
    ///
    /// A per-file `MoveError` after the failure has been journaled, or
    /// `MoveError::Journal` when the log cannot be written.
    pub fn execute(&self, request: &MoveRequest) -> Result<EntryId, MoveError> {
        let entry_id = self.journal.lock().map_err(JournalError::from)?.append_pending(
            NewEntry {
                batch_id: self.batch_id,
                mode: self.mode,
                source: &request.source,
                destination: &request.destination,
                size: request.size,
                source_timestamp: request.source_timestamp,
                reverts: request.reverts,
            },
        )?;

        let result = move_file(&request.source, &request.destination);

        let mut journal = self.journal.lock().map_err(JournalError::from)?;
        match result {
            Ok(()) => {
                journal.append_outcome(entry_id, EntryOutcome::Committed, None)?;
                debug!(
                    "Moved {} -> {}",
                    request.source.display(),
                    request.destination.display()
                );
                Ok(entry_id)
            }
            Err(e) => {
                journal.append_outcome(entry_id, EntryOutcome::Failed, Some(e.to_string()))?;
                warn!("Failed to move {}: {}", request.source.display(), e);
                Err(e)
            }
        }
    }

    /// Journals a file that could not be placed at all: a pending entry
    /// immediately followed by its failure. Nothing on disk is touched.
    ///
    /// # Errors
    ///
    /// `MoveError::Journal` when the log cannot be written.
    pub fn record_failure(
        &self,
        request: &MoveRequest,
        error: &MoveError,
    ) -> Result<EntryId, MoveError> {
        let mut journal = self.journal.lock().map_err(JournalError::from)?;
        let entry_id = journal.append_pending(NewEntry {
            batch_id: self.batch_id,
            mode: self.mode,
            source: &request.source,
            destination: &request.destination,
            size: request.size,
            source_timestamp: request.source_timestamp,
            reverts: request.reverts,
        })?;
        journal.append_outcome(entry_id, EntryOutcome::Failed, Some(error.to_string()))?;
        warn!("Cannot place {}: {}", request.source.display(), error);
        Ok(entry_id)
    }
}

/// Moves `source` to `destination`, which must not exist.
///
/// Missing destination directories are created. A rename is used when
/// possible; across devices the file is copied under a hidden name beside
/// the destination, synced, checked, and renamed into place before the
/// source is removed.
pub fn move_file(source: &Path, destination: &Path) -> Result<(), MoveError> {
    match fs::symlink_metadata(source) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(MoveError::SourceVanished(source.to_path_buf()));
        }
        Err(e) => return Err(MoveError::from_io(e, source)),
    }
    if fs::symlink_metadata(destination).is_ok() {
        return Err(MoveError::DestinationOccupied(destination.to_path_buf()));
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| MoveError::from_io(e, parent))?;
    }

    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(e) => match MoveError::from_io(e, source) {
            MoveError::CrossDevice(_) => copy_across(source, destination),
            MoveError::NotFound(path) => Err(MoveError::SourceVanished(path)),
            other => Err(other),
        },
    }
}

/// Copy-then-delete move for when source and destination are on different
/// volumes. The final name only ever holds a complete copy.
pub fn copy_across(source: &Path, destination: &Path) -> Result<(), MoveError> {
    let staging = staging_path(destination);

    if let Err(e) = stage_copy(source, &staging) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }

    if fs::symlink_metadata(destination).is_ok() {
        let _ = fs::remove_file(&staging);
        return Err(MoveError::DestinationOccupied(destination.to_path_buf()));
    }
    if let Err(e) = fs::rename(&staging, destination) {
        let _ = fs::remove_file(&staging);
        return Err(MoveError::from_io(e, destination));
    }

    if let Err(e) = fs::remove_file(source) {
        // Keep exactly one copy: the source stays, the placed copy goes.
        let _ = fs::remove_file(destination);
        return Err(MoveError::from_io(e, source));
    }
    Ok(())
}

/// Hidden name beside `destination` for a copy in progress, unique to this
/// process and moment.
fn staging_path(destination: &Path) -> PathBuf {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    parent.join(format!(".{}.partial-{}-{}", name, std::process::id(), nanos))
}

fn stage_copy(source: &Path, staging: &Path) -> Result<(), MoveError> {
    let metadata = fs::metadata(source).map_err(|e| MoveError::from_io(e, source))?;
    fs::copy(source, staging).map_err(|e| MoveError::from_io(e, staging))?;

    let file = OpenOptions::new()
        .write(true)
        .open(staging)
        .map_err(|e| MoveError::from_io(e, staging))?;
    if let Ok(modified) = metadata.modified() {
        file.set_modified(modified)
            .map_err(|e| MoveError::from_io(e, staging))?;
    }
    file.sync_all().map_err(|e| MoveError::from_io(e, staging))?;

    let copied = File::open(staging)
        .and_then(|f| f.metadata())
        .map_err(|e| MoveError::from_io(e, staging))?
        .len();
    if copied != metadata.len() {
        return Err(MoveError::SizeMismatch {
            path: staging.to_path_buf(),
            expected: metadata.len(),
            actual: copied,
        });
    }
    Ok(())
}
