//! Batch coordination.
//!
//! A [`Coordinator`] owns everything that outlives a single batch: the
//! transaction log, the learned-pattern table, the recent-directory lists
//! and the cancellation flag. It runs at most one organize or undo batch at
//! a time, each on its own worker thread.

use crate::classifier::{ClassificationResult, ClassifyContext, OrganizeMode, Strategy, classify};
use crate::collision::{
    CollisionKind, CollisionResolver, ContentTimestamp, FileRecord, NoContentTimestamp,
    occupant_on_disk,
};
use crate::config::{CompiledFilters, ConfigError, OrganizerConfig, RecentDirectories};
use crate::executor::{MoveError, MoveExecutor, MoveRequest};
use crate::journal::{
    BatchId, BatchKind, BatchOutcome, CompactionReport, EntryOutcome, JournalError, LOG_FILE_NAME,
    OperationBatch, OperationEntry, TransactionLog,
};
use crate::patterns::{LearnedPatterns, PatternError};
use crate::undo::{JournaledMover, UndoReport, replay_undo};
use crate::validate::{ValidationError, validate_request};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use walkdir::WalkDir;

/// File name of the learned-pattern store inside the data directory.
pub const PATTERNS_FILE_NAME: &str = "learned_patterns.json";

/// Errors surfaced by the coordinator.
#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    /// Another batch is running.
    Busy,
    Journal(JournalError),
    Pattern(PatternError),
    Config(ConfigError),
    Consistency(ConsistencyError),
    UnknownBatch(BatchId),
    /// Undo batches cannot themselves be undone.
    NotUndoable(BatchId),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A lock was poisoned by a panicking thread.
    Poisoned(&'static str),
    /// The worker thread panicked.
    WorkerPanicked,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "{}", e),
            Self::Busy => write!(f, "Another organize or undo batch is already running"),
            Self::Journal(e) => write!(f, "{}", e),
            Self::Pattern(e) => write!(f, "{}", e),
            Self::Config(e) => write!(f, "{}", e),
            Self::Consistency(e) => write!(f, "{}", e),
            Self::UnknownBatch(id) => write!(f, "No batch with id {}", id),
            Self::NotUndoable(id) => write!(f, "Batch {} is an undo batch", id),
            Self::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            Self::Poisoned(what) => write!(f, "The {} lock was poisoned", what),
            Self::WorkerPanicked => write!(f, "The batch worker thread panicked"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Validation(e) => Some(e),
            Self::Journal(e) => Some(e),
            Self::Pattern(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<JournalError> for EngineError {
    fn from(e: JournalError) -> Self {
        Self::Journal(e)
    }
}

impl From<PatternError> for EngineError {
    fn from(e: PatternError) -> Self {
        Self::Pattern(e)
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Log entries whose outcome is unknown and need a human to check the disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyError {
    pub entries: Vec<OperationEntry>,
}

impl std::fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} operation(s) have no recorded outcome and need manual reconciliation",
            self.entries.len()
        )
    }
}

impl std::error::Error for ConsistencyError {}

/// Cooperative cancellation flag shared with the worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Counts reported while a batch runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub moved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub finished: bool,
}

/// What to organize and how.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganizeRequest {
    pub sources: Vec<PathBuf>,
    pub target: PathBuf,
    pub mode: OrganizeMode,
    /// Organize the files directly inside a source into folders beside them.
    pub in_place: bool,
}

/// A move decided for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMove {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub folder: String,
    pub strategy: Strategy,
    pub collision: Option<CollisionKind>,
}

/// Outcome counts of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub kind: BatchKind,
    pub mode: String,
    pub created: DateTime<Utc>,
    pub outcome: Option<BatchOutcome>,
    pub reverts_batch: Option<BatchId>,
    pub moved: usize,
    pub failed: usize,
    /// Files left alone because no folder applied; not tracked in history.
    pub skipped: usize,
    pub unresolved: usize,
    pub failures: Vec<(PathBuf, String)>,
}

impl BatchSummary {
    fn from_log(journal: &TransactionLog, batch: &OperationBatch) -> Self {
        let entries = journal.entries_for_batch(batch.header.batch_id);
        let count = |outcome| entries.iter().filter(|e| e.outcome == outcome).count();
        Self {
            batch_id: batch.header.batch_id,
            kind: batch.header.kind,
            mode: batch.header.mode.clone(),
            created: batch.header.created,
            outcome: batch.outcome,
            reverts_batch: batch.header.reverts_batch,
            moved: count(EntryOutcome::Committed),
            failed: count(EntryOutcome::Failed),
            skipped: 0,
            unresolved: count(EntryOutcome::Pending),
            failures: entries
                .iter()
                .filter(|e| e.outcome == EntryOutcome::Failed)
                .map(|e| (e.source.clone(), e.error.clone().unwrap_or_default()))
                .collect(),
        }
    }
}

/// A running batch.
pub struct BatchHandle<T> {
    progress: Receiver<Progress>,
    worker: JoinHandle<EngineResult<T>>,
}

impl<T> BatchHandle<T> {
    /// Progress reports; the channel closes when the worker exits.
    pub fn progress(&self) -> &Receiver<Progress> {
        &self.progress
    }

    /// Blocks until the batch has finished.
    pub fn wait(self) -> EngineResult<T> {
        self.worker.join().map_err(|_| EngineError::WorkerPanicked)?
    }
}

/// Marks the coordinator busy until dropped.
struct ActiveGuard(Arc<AtomicBool>);

impl ActiveGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> EngineResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::Busy)?;
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// State handed to worker threads.
#[derive(Clone)]
struct Shared {
    config: Arc<OrganizerConfig>,
    filters: Arc<CompiledFilters>,
    journal: Arc<Mutex<TransactionLog>>,
    patterns: Arc<RwLock<LearnedPatterns>>,
    cancel: CancelToken,
    timestamps: Arc<dyn ContentTimestamp>,
}

/// Owns process-wide organizer state and runs batches.
pub struct Coordinator {
    data_dir: PathBuf,
    shared: Shared,
    recent: Arc<RwLock<RecentDirectories>>,
    active: Arc<AtomicBool>,
}

impl Coordinator {
    /// Opens the data directory and loads the log and learned patterns.
    ///
    /// Entries left pending by an earlier crash are reported with a warning;
    /// use [`Coordinator::check_consistency`] to act on them.
    pub fn open(data_dir: &Path, config: OrganizerConfig) -> EngineResult<Self> {
        config.validate()?;
        let filters = config.compile()?;

        fs::create_dir_all(data_dir).map_err(|e| EngineError::Io {
            path: data_dir.to_path_buf(),
            source: e,
        })?;
        let journal = TransactionLog::open(&data_dir.join(LOG_FILE_NAME))?;
        let patterns = LearnedPatterns::load(&data_dir.join(PATTERNS_FILE_NAME))?;

        let unresolved = journal.unresolved();
        if !unresolved.is_empty() {
            warn!(
                "{} operation(s) in the transaction log have no recorded outcome",
                unresolved.len()
            );
        }

        info!(
            "Opened data directory {} ({} learned patterns)",
            data_dir.display(),
            patterns.len()
        );

        let recent = config.recent_directories.clone();
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            shared: Shared {
                config: Arc::new(config),
                filters: Arc::new(filters),
                journal: Arc::new(Mutex::new(journal)),
                patterns: Arc::new(RwLock::new(patterns)),
                cancel: CancelToken::new(),
                timestamps: Arc::new(NoContentTimestamp),
            },
            recent: Arc::new(RwLock::new(recent)),
            active: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replaces the content timestamp source used for collisions.
    pub fn with_content_timestamps(mut self, timestamps: Arc<dyn ContentTimestamp>) -> Self {
        self.shared.timestamps = timestamps;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &OrganizerConfig {
        &self.shared.config
    }

    /// The token the running batch checks between files.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Asks the running batch to stop after its current file.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Classifies a single name with the current learned patterns.
    pub fn classify(
        &self,
        filename: &str,
        mode: &OrganizeMode,
    ) -> EngineResult<Option<ClassificationResult>> {
        let patterns = self
            .shared
            .patterns
            .read()
            .map_err(|_| EngineError::Poisoned("pattern"))?;
        let ctx = ClassifyContext {
            learned: Some(&patterns),
            modified: None,
        };
        Ok(classify(mode, filename, &ctx))
    }

    /// Starts organizing on a worker thread.
    ///
    /// # Errors
    ///
    /// Validation happens before anything is touched; `EngineError::Busy` if
    /// a batch is already running.
    pub fn start_organize(
        &self,
        request: OrganizeRequest,
    ) -> EngineResult<BatchHandle<BatchSummary>> {
        let paths = validate_request(&request.sources, &request.target, request.in_place)?;
        let guard = ActiveGuard::acquire(&self.active)?;
        self.shared.cancel.reset();

        {
            let mut recent = self
                .recent
                .write()
                .map_err(|_| EngineError::Poisoned("recent directories"))?;
            for source in &paths.sources {
                recent.remember_source(source);
            }
            recent.remember_target(&paths.target);
        }

        let shared = self.shared.clone();
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("refile-organize".to_string())
            .spawn(move || {
                let _guard = guard;
                run_organize(
                    &shared,
                    &paths.sources,
                    &paths.target,
                    request.mode,
                    request.in_place,
                    &tx,
                )
            })
            .map_err(|e| EngineError::Io {
                path: self.data_dir.clone(),
                source: e,
            })?;

        Ok(BatchHandle {
            progress: rx,
            worker,
        })
    }

    /// Organizes and waits for the batch to finish.
    pub fn organize(&self, request: OrganizeRequest) -> EngineResult<BatchSummary> {
        self.start_organize(request)?.wait()
    }

    /// Plans up to `limit` moves without touching the filesystem.
    pub fn preview(&self, request: &OrganizeRequest, limit: usize) -> EngineResult<Vec<PlannedMove>> {
        let paths = validate_request(&request.sources, &request.target, request.in_place)?;
        let patterns = self
            .shared
            .patterns
            .read()
            .map_err(|_| EngineError::Poisoned("pattern"))?
            .clone();

        let timestamps = &*self.shared.timestamps;
        let mut planner = Planner::new(&self.shared.config, &paths.target, request.mode, &patterns);
        let mut planned: HashMap<PathBuf, FileRecord> = HashMap::new();
        let mut moves = Vec::new();

        for record in candidates(
            &paths.sources,
            &self.shared.filters,
            request.in_place,
            timestamps,
        ) {
            if moves.len() >= limit {
                break;
            }
            let occupancy = |path: &Path| {
                planned
                    .get(path)
                    .cloned()
                    .or_else(|| occupant_on_disk(path, timestamps))
            };
            match planner.plan(&record, &occupancy) {
                Some(Ok(planned_move)) => {
                    planner.placed(&planned_move);
                    planned.insert(planned_move.destination.clone(), record.clone());
                    moves.push(planned_move);
                }
                Some(Err(unplaceable)) => debug!(
                    "Preview skips {}: {}",
                    record.path.display(),
                    unplaceable.error
                ),
                None => {}
            }
        }
        Ok(moves)
    }

    /// Starts undoing `batch_id` on a worker thread.
    pub fn start_undo(&self, batch_id: BatchId) -> EngineResult<BatchHandle<UndoReport>> {
        let batch = self
            .shared
            .journal
            .lock()
            .map_err(JournalError::from)?
            .batch(batch_id)
            .ok_or(EngineError::UnknownBatch(batch_id))?;
        if batch.header.kind != BatchKind::Organize {
            return Err(EngineError::NotUndoable(batch_id));
        }

        let guard = ActiveGuard::acquire(&self.active)?;
        self.shared.cancel.reset();

        let shared = self.shared.clone();
        let mode = batch.header.mode;
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("refile-undo".to_string())
            .spawn(move || {
                let _guard = guard;
                run_undo(&shared, batch_id, &mode, &tx)
            })
            .map_err(|e| EngineError::Io {
                path: self.data_dir.clone(),
                source: e,
            })?;

        Ok(BatchHandle {
            progress: rx,
            worker,
        })
    }

    /// Undoes `batch_id` and waits for the result.
    pub fn undo(&self, batch_id: BatchId) -> EngineResult<UndoReport> {
        self.start_undo(batch_id)?.wait()
    }

    /// The newest organize batch, the default target of undo.
    pub fn latest_organize_batch(&self) -> EngineResult<Option<BatchId>> {
        let journal = self.shared.journal.lock().map_err(JournalError::from)?;
        Ok(journal
            .batches()
            .iter()
            .rev()
            .find(|batch| batch.header.kind == BatchKind::Organize)
            .map(|batch| batch.header.batch_id))
    }

    /// Every batch in the log, oldest first.
    pub fn history(&self) -> EngineResult<Vec<BatchSummary>> {
        let journal = self.shared.journal.lock().map_err(JournalError::from)?;
        Ok(journal
            .batches()
            .iter()
            .map(|batch| BatchSummary::from_log(&journal, batch))
            .collect())
    }

    /// Remembers that `filename` belongs in `folder` and saves the table.
    pub fn learn(&self, filename: &str, folder: &str) -> EngineResult<()> {
        let mut patterns = self
            .shared
            .patterns
            .write()
            .map_err(|_| EngineError::Poisoned("pattern"))?;
        patterns.learn(filename, folder);
        patterns.save(&self.data_dir.join(PATTERNS_FILE_NAME))?;
        Ok(())
    }

    /// Learns from an already organized tree: every file under each direct
    /// subfolder of `root` is recorded as belonging to that subfolder.
    ///
    /// Duplicate areas (`!`-prefixed) and skipped folders are ignored.
    /// Returns the number of files learned.
    pub fn learn_from_tree(&self, root: &Path) -> EngineResult<usize> {
        let io_err = |e| EngineError::Io {
            path: root.to_path_buf(),
            source: e,
        };

        let mut folders: Vec<(String, PathBuf)> = fs::read_dir(root)
            .map_err(io_err)?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| (entry.file_name().to_string_lossy().to_string(), entry.path()))
            .filter(|(name, _)| {
                !name.starts_with('!') && !self.shared.filters.should_skip_folder(name)
            })
            .collect();
        folders.sort();

        let mut patterns = self
            .shared
            .patterns
            .write()
            .map_err(|_| EngineError::Poisoned("pattern"))?;
        let mut learned = 0;
        for (folder, path) in folders {
            for record in candidates(
                std::slice::from_ref(&path),
                &self.shared.filters,
                false,
                &NoContentTimestamp,
            ) {
                if let Some(name) = record.path.file_name() {
                    patterns.learn(&name.to_string_lossy(), &folder);
                    learned += 1;
                }
            }
        }
        patterns.save(&self.data_dir.join(PATTERNS_FILE_NAME))?;
        info!("Learned {} files from {}", learned, root.display());
        Ok(learned)
    }

    /// Snapshot of the learned-pattern table.
    pub fn learned_patterns(&self) -> EngineResult<LearnedPatterns> {
        self.shared
            .patterns
            .read()
            .map(|patterns| patterns.clone())
            .map_err(|_| EngineError::Poisoned("pattern"))
    }

    /// Entries whose outcome was never recorded.
    pub fn unresolved(&self) -> EngineResult<Vec<OperationEntry>> {
        let journal = self.shared.journal.lock().map_err(JournalError::from)?;
        Ok(journal.unresolved())
    }

    /// Fails with `EngineError::Consistency` when unresolved entries exist.
    pub fn check_consistency(&self) -> EngineResult<()> {
        let entries = self.unresolved()?;
        if entries.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Consistency(ConsistencyError { entries }))
        }
    }

    /// Drops all but the newest `keep` batches from the log.
    pub fn compact(&self, keep: usize) -> EngineResult<CompactionReport> {
        let _guard = ActiveGuard::acquire(&self.active)?;
        let mut journal = self.shared.journal.lock().map_err(JournalError::from)?;
        Ok(journal.compact(keep)?)
    }

    pub fn recent_directories(&self) -> EngineResult<RecentDirectories> {
        self.recent
            .read()
            .map(|recent| recent.clone())
            .map_err(|_| EngineError::Poisoned("recent directories"))
    }
}

/// Lazily enumerates candidate files below `sources`.
///
/// Skipped folders are never entered. In place, only files directly inside
/// each source are considered.
fn candidates<'a>(
    sources: &'a [PathBuf],
    filters: &'a CompiledFilters,
    in_place: bool,
    timestamps: &'a dyn ContentTimestamp,
) -> impl Iterator<Item = FileRecord> + 'a {
    sources.iter().flat_map(move |root| {
        let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
        if in_place {
            walker = walker.max_depth(1);
        }
        walker
            .into_iter()
            .filter_entry(move |entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !filters.should_skip_folder(&entry.file_name().to_string_lossy())
            })
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(move |entry| entry.file_type().is_file() && filters.should_include(entry.path()))
            .filter_map(move |entry| match FileRecord::inspect(entry.path(), timestamps) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Cannot read {}: {}", entry.path().display(), e);
                    None
                }
            })
    })
}

/// A classified file for which no destination could be chosen.
struct Unplaceable {
    intended: PathBuf,
    error: MoveError,
}

/// Turns scanned files into destinations for one batch.
struct Planner<'a> {
    config: &'a OrganizerConfig,
    target: &'a Path,
    mode: OrganizeMode,
    patterns: &'a LearnedPatterns,
    resolver: CollisionResolver<'a>,
    folder_counts: HashMap<String, usize>,
}

impl<'a> Planner<'a> {
    fn new(
        config: &'a OrganizerConfig,
        target: &'a Path,
        mode: OrganizeMode,
        patterns: &'a LearnedPatterns,
    ) -> Self {
        Self {
            config,
            target,
            mode,
            patterns,
            resolver: CollisionResolver::new(target, config.duplicate_detection_method),
            folder_counts: HashMap::new(),
        }
    }

    /// `None` when the file stays where it is.
    fn plan(
        &mut self,
        record: &FileRecord,
        occupancy: &dyn Fn(&Path) -> Option<FileRecord>,
    ) -> Option<Result<PlannedMove, Unplaceable>> {
        let filename = record.path.file_name()?.to_string_lossy().to_string();
        let ctx = ClassifyContext {
            learned: Some(self.patterns),
            modified: record.modified,
        };
        let Some(result) = classify(&self.mode, &filename, &ctx) else {
            debug!("No folder for {}", filename);
            return None;
        };

        let folder = self.folder_with_room(&result.folder);
        let intended = self.folder_path(&folder).join(&filename);
        if intended == record.path {
            return None;
        }

        Some(
            self.resolver
                .resolve(record, &intended, occupancy)
                .map(|resolution| PlannedMove {
                    source: record.path.clone(),
                    destination: resolution.destination,
                    folder,
                    strategy: result.strategy,
                    collision: resolution.collision,
                })
                .map_err(|error| Unplaceable { intended, error }),
        )
    }

    /// Records a placed file against its folder's capacity.
    fn placed(&mut self, planned: &PlannedMove) {
        if planned.destination.parent() == Some(self.folder_path(&planned.folder).as_path()) {
            *self.folder_counts.entry(planned.folder.clone()).or_insert(0) += 1;
        }
    }

    fn folder_path(&self, folder: &str) -> PathBuf {
        folder
            .split('/')
            .fold(self.target.to_path_buf(), |path, segment| path.join(segment))
    }

    /// `folder`, or the first of `folder (2)`, `folder (3)`, ... with room.
    fn folder_with_room(&mut self, folder: &str) -> String {
        let limit = self.config.max_files_per_folder;
        if limit == 0 {
            return folder.to_string();
        }

        let mut candidate = folder.to_string();
        let mut n = 2;
        while self.files_in(&candidate) >= limit {
            candidate = format!("{} ({})", folder, n);
            n += 1;
        }
        candidate
    }

    fn files_in(&mut self, folder: &str) -> usize {
        if let Some(count) = self.folder_counts.get(folder) {
            return *count;
        }
        let count = fs::read_dir(self.folder_path(folder))
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0);
        self.folder_counts.insert(folder.to_string(), count);
        count
    }
}

fn report(tx: &Sender<Progress>, progress: Progress) {
    // The caller may have stopped listening.
    let _ = tx.send(progress);
}

fn run_organize(
    shared: &Shared,
    sources: &[PathBuf],
    target: &Path,
    mode: OrganizeMode,
    in_place: bool,
    tx: &Sender<Progress>,
) -> EngineResult<BatchSummary> {
    let patterns = shared
        .patterns
        .read()
        .map_err(|_| EngineError::Poisoned("pattern"))?
        .clone();
    let mode_name = mode.name();

    let (batch_id, created) = {
        let mut journal = shared.journal.lock().map_err(JournalError::from)?;
        let batch_id = journal.begin_batch(BatchKind::Organize, mode_name, None)?;
        let created = journal
            .batch(batch_id)
            .map(|batch| batch.header.created)
            .unwrap_or_else(Utc::now);
        (batch_id, created)
    };

    let timestamps = &*shared.timestamps;
    let executor = MoveExecutor::new(&shared.journal, batch_id, mode_name);
    let mut planner = Planner::new(&shared.config, target, mode, &patterns);
    let occupancy = |path: &Path| occupant_on_disk(path, timestamps);
    let batch_size = shared.config.batch_size.max(1);

    let mut progress = Progress::default();
    let mut failures = Vec::new();
    let mut outcome = BatchOutcome::Complete;

    for record in candidates(sources, &shared.filters, in_place, timestamps) {
        if shared.cancel.is_cancelled() {
            info!("Batch {} cancelled", batch_id);
            outcome = BatchOutcome::Partial;
            break;
        }
        progress.processed += 1;

        match planner.plan(&record, &occupancy) {
            None => progress.skipped += 1,
            Some(Err(unplaceable)) => {
                progress.failed += 1;
                failures.push((record.path.clone(), unplaceable.error.to_string()));
                let request = MoveRequest {
                    source: record.path.clone(),
                    destination: unplaceable.intended,
                    size: record.size,
                    source_timestamp: record.moment(),
                    reverts: None,
                };
                if let Err(e) = executor.record_failure(&request, &unplaceable.error) {
                    warn!("Batch {} aborted: {}", batch_id, e);
                    outcome = BatchOutcome::Aborted;
                    break;
                }
            }
            Some(Ok(planned)) => {
                let request = MoveRequest {
                    source: planned.source.clone(),
                    destination: planned.destination.clone(),
                    size: record.size,
                    source_timestamp: record.moment(),
                    reverts: None,
                };
                match executor.execute(&request) {
                    Ok(_) => {
                        planner.placed(&planned);
                        progress.moved += 1;
                    }
                    Err(e) if e.is_fatal() => {
                        warn!("Batch {} aborted: {}", batch_id, e);
                        progress.failed += 1;
                        failures.push((record.path.clone(), e.to_string()));
                        outcome = BatchOutcome::Aborted;
                        break;
                    }
                    Err(e) => {
                        progress.failed += 1;
                        failures.push((record.path.clone(), e.to_string()));
                    }
                }
            }
        }

        if progress.processed % batch_size == 0 {
            report(tx, progress);
        }
    }

    let outcome = close_batch(shared, batch_id, outcome);
    progress.finished = true;
    report(tx, progress);

    Ok(BatchSummary {
        batch_id,
        kind: BatchKind::Organize,
        mode: mode_name.to_string(),
        created,
        outcome: Some(outcome),
        reverts_batch: None,
        moved: progress.moved,
        failed: progress.failed,
        skipped: progress.skipped,
        unresolved: 0,
        failures,
    })
}

fn run_undo(
    shared: &Shared,
    batch_id: BatchId,
    mode: &str,
    tx: &Sender<Progress>,
) -> EngineResult<UndoReport> {
    let (entries, reverted, undo_batch) = {
        let mut journal = shared.journal.lock().map_err(JournalError::from)?;
        let entries = journal.entries_for_batch(batch_id);
        let reverted = journal.reverted_entries();
        let undo_batch = journal.begin_batch(BatchKind::Undo, mode, Some(batch_id))?;
        (entries, reverted, undo_batch)
    };

    let mut mover = JournaledMover::new(MoveExecutor::new(&shared.journal, undo_batch, mode));
    let mut undo = replay_undo(&entries, &reverted, &mut mover, &shared.cancel);
    undo.batch_id = batch_id;
    undo.undo_batch_id = Some(undo_batch);

    let outcome = if undo.aborted {
        BatchOutcome::Aborted
    } else if undo.cancelled {
        BatchOutcome::Partial
    } else {
        BatchOutcome::Complete
    };
    if close_batch(shared, undo_batch, outcome) == BatchOutcome::Aborted {
        undo.aborted = true;
    }

    report(
        tx,
        Progress {
            processed: undo.total_processed(),
            moved: undo.restored_files,
            skipped: undo.skipped_files.len(),
            failed: undo.failed_restores.len(),
            finished: true,
        },
    );
    Ok(undo)
}

/// Closes a batch; a batch that cannot be closed counts as aborted.
fn close_batch(shared: &Shared, batch_id: BatchId, outcome: BatchOutcome) -> BatchOutcome {
    let closed = shared
        .journal
        .lock()
        .map_err(JournalError::from)
        .and_then(|mut journal| journal.close_batch(batch_id, outcome));
    match closed {
        Ok(()) => outcome,
        Err(e) => {
            warn!("Cannot close batch {}: {}", batch_id, e);
            BatchOutcome::Aborted
        }
    }
}
