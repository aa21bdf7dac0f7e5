/// Undo of organize batches.
///
/// Undo reads a batch's committed entries from the transaction log and moves
/// each file from its logged destination back to its logged source, newest
/// first. The replay itself is independent of the filesystem: it drives a
/// [`FileMover`], which in production journals every restoration into a new
/// batch of kind `undo`.
use crate::engine::CancelToken;
use crate::executor::{MoveError, MoveExecutor, MoveRequest};
use crate::journal::{BatchId, EntryId, EntryOutcome, OperationEntry};
use log::{debug, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Moves a file back during undo.
pub trait FileMover {
    /// Moves `from` to `to`, undoing `entry`.
    fn relocate(&mut self, from: &Path, to: &Path, entry: &OperationEntry)
    -> Result<(), MoveError>;
}

/// Mover that journals each restoration as an entry reverting the original.
pub struct JournaledMover<'a> {
    executor: MoveExecutor<'a>,
}

impl<'a> JournaledMover<'a> {
    pub fn new(executor: MoveExecutor<'a>) -> Self {
        Self { executor }
    }
}

impl FileMover for JournaledMover<'_> {
    fn relocate(
        &mut self,
        from: &Path,
        to: &Path,
        entry: &OperationEntry,
    ) -> Result<(), MoveError> {
        self.executor
            .execute(&MoveRequest {
                source: from.to_path_buf(),
                destination: to.to_path_buf(),
                size: entry.size,
                source_timestamp: entry.source_timestamp,
                reverts: Some(entry.entry_id),
            })
            .map(|_| ())
    }
}

/// Represents the result of an undo operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UndoReport {
    /// The organize batch that was undone.
    pub batch_id: BatchId,
    /// The undo batch recording the restorations.
    pub undo_batch_id: Option<BatchId>,
    /// Number of files successfully restored.
    pub restored_files: usize,
    /// Files that could not be restored, with the reason.
    pub failed_restores: Vec<(PathBuf, String)>,
    /// Entries that were already restored or whose outcome is unknown.
    pub skipped_files: Vec<(PathBuf, String)>,
    /// Stopped early on request.
    pub cancelled: bool,
    /// Stopped because the log could not be written.
    pub aborted: bool,
}

impl UndoReport {
    /// Returns the total number of operations processed.
    pub fn total_processed(&self) -> usize {
        self.restored_files + self.failed_restores.len() + self.skipped_files.len()
    }

    /// Returns true if every committed entry is back in place.
    pub fn is_complete_success(&self) -> bool {
        self.failed_restores.is_empty() && !self.cancelled && !self.aborted
    }
}

/// Replays `entries` backwards through `mover`.
///
/// Only committed entries are restored. Entries in `reverted` were undone
/// before and are skipped, as are entries still pending. Each entry fails or
/// succeeds on its own; only a journal failure or cancellation stops the
/// replay, and completed restorations are kept either way.
pub fn replay_undo(
    entries: &[OperationEntry],
    reverted: &HashSet<EntryId>,
    mover: &mut dyn FileMover,
    cancel: &CancelToken,
) -> UndoReport {
    let mut ordered: Vec<&OperationEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| b.entry_id.cmp(&a.entry_id));

    let mut report = UndoReport::default();
    for entry in ordered {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        match entry.outcome {
            EntryOutcome::Failed => continue,
            EntryOutcome::Pending => {
                report.skipped_files.push((
                    entry.source.clone(),
                    "Outcome unknown; reconcile manually".to_string(),
                ));
                continue;
            }
            EntryOutcome::Committed => {}
        }

        if reverted.contains(&entry.entry_id) {
            report
                .skipped_files
                .push((entry.source.clone(), "Already restored".to_string()));
            continue;
        }

        match mover.relocate(&entry.destination, &entry.source, entry) {
            Ok(()) => {
                debug!(
                    "Restored {} -> {}",
                    entry.destination.display(),
                    entry.source.display()
                );
                report.restored_files += 1;
            }
            Err(e) if e.is_fatal() => {
                warn!("Undo stopped: {}", e);
                report
                    .failed_restores
                    .push((entry.destination.clone(), e.to_string()));
                report.aborted = true;
                break;
            }
            Err(e) => {
                report
                    .failed_restores
                    .push((entry.destination.clone(), e.to_string()));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalError;
    use chrono::Utc;
    use std::collections::BTreeSet;

    /// A filesystem that is just a set of paths.
    #[derive(Default)]
    struct FakeMover {
        files: BTreeSet<PathBuf>,
        moves: Vec<EntryId>,
        fail_journal: bool,
        cancel_after: Option<(usize, CancelToken)>,
    }

    impl FakeMover {
        fn with_files(paths: &[&str]) -> Self {
            Self {
                files: paths.iter().map(PathBuf::from).collect(),
                ..Self::default()
            }
        }
    }

    impl FileMover for FakeMover {
        fn relocate(
            &mut self,
            from: &Path,
            to: &Path,
            entry: &OperationEntry,
        ) -> Result<(), MoveError> {
            if self.fail_journal {
                return Err(MoveError::Journal(JournalError::Poisoned));
            }
            if !self.files.contains(from) {
                return Err(MoveError::SourceVanished(from.to_path_buf()));
            }
            if self.files.contains(to) {
                return Err(MoveError::DestinationOccupied(to.to_path_buf()));
            }
            self.files.remove(from);
            self.files.insert(to.to_path_buf());
            self.moves.push(entry.entry_id);
            if let Some((limit, token)) = &self.cancel_after
                && self.moves.len() >= *limit
            {
                token.cancel();
            }
            Ok(())
        }
    }

    fn entry(id: EntryId, source: &str, destination: &str, outcome: EntryOutcome) -> OperationEntry {
        OperationEntry {
            entry_id: id,
            batch_id: 1,
            timestamp: Utc::now(),
            mode: "extension".to_string(),
            source: PathBuf::from(source),
            destination: PathBuf::from(destination),
            outcome,
            error: None,
            size: 1,
            source_timestamp: None,
            reverts: None,
        }
    }

    #[test]
    fn test_restores_in_reverse_order() {
        let entries = vec![
            entry(1, "/s/a.txt", "/t/TXT/a.txt", EntryOutcome::Committed),
            entry(2, "/s/b.jpg", "/t/JPG/b.jpg", EntryOutcome::Committed),
        ];
        let mut mover = FakeMover::with_files(&["/t/TXT/a.txt", "/t/JPG/b.jpg"]);

        let report = replay_undo(&entries, &HashSet::new(), &mut mover, &CancelToken::new());

        assert_eq!(report.restored_files, 2);
        assert!(report.is_complete_success());
        assert_eq!(mover.moves, vec![2, 1]);
        assert!(mover.files.contains(Path::new("/s/a.txt")));
        assert!(mover.files.contains(Path::new("/s/b.jpg")));
    }

    #[test]
    fn test_failed_entries_are_ignored() {
        let entries = vec![entry(1, "/s/a", "/t/a", EntryOutcome::Failed)];
        let mut mover = FakeMover::default();

        let report = replay_undo(&entries, &HashSet::new(), &mut mover, &CancelToken::new());
        assert_eq!(report.total_processed(), 0);
        assert!(mover.moves.is_empty());
    }

    #[test]
    fn test_occupied_original_is_a_failure_not_a_halt() {
        let entries = vec![
            entry(1, "/s/a", "/t/a", EntryOutcome::Committed),
            entry(2, "/s/b", "/t/b", EntryOutcome::Committed),
        ];
        let mut mover = FakeMover::with_files(&["/t/a", "/t/b", "/s/b"]);

        let report = replay_undo(&entries, &HashSet::new(), &mut mover, &CancelToken::new());

        assert_eq!(report.restored_files, 1);
        assert_eq!(report.failed_restores.len(), 1);
        assert_eq!(report.failed_restores[0].0, PathBuf::from("/t/b"));
        assert!(mover.files.contains(Path::new("/s/a")));
    }

    #[test]
    fn test_missing_destination_is_a_failure() {
        let entries = vec![entry(1, "/s/a", "/t/a", EntryOutcome::Committed)];
        let mut mover = FakeMover::default();

        let report = replay_undo(&entries, &HashSet::new(), &mut mover, &CancelToken::new());
        assert_eq!(report.failed_restores.len(), 1);
        assert!(report.failed_restores[0].1.contains("no longer exists"));
    }

    #[test]
    fn test_reverted_and_pending_entries_are_skipped() {
        let entries = vec![
            entry(1, "/s/a", "/t/a", EntryOutcome::Committed),
            entry(2, "/s/b", "/t/b", EntryOutcome::Pending),
        ];
        let reverted: HashSet<EntryId> = [1].into_iter().collect();
        let mut mover = FakeMover::with_files(&["/t/b"]);

        let report = replay_undo(&entries, &reverted, &mut mover, &CancelToken::new());

        assert_eq!(report.restored_files, 0);
        assert_eq!(report.skipped_files.len(), 2);
        assert!(report.failed_restores.is_empty());
        assert!(mover.moves.is_empty());
    }

    #[test]
    fn test_cancellation_keeps_completed_restorations() {
        let entries: Vec<OperationEntry> = (1..=5)
            .map(|i| {
                entry(
                    i,
                    &format!("/s/{}", i),
                    &format!("/t/{}", i),
                    EntryOutcome::Committed,
                )
            })
            .collect();
        let token = CancelToken::new();
        let mut mover = FakeMover::with_files(&["/t/1", "/t/2", "/t/3", "/t/4", "/t/5"]);
        mover.cancel_after = Some((2, token.clone()));

        let report = replay_undo(&entries, &HashSet::new(), &mut mover, &token);

        assert!(report.cancelled);
        assert_eq!(report.restored_files, 2);
        assert_eq!(mover.moves, vec![5, 4]);
        assert!(mover.files.contains(Path::new("/t/1")));
    }

    #[test]
    fn test_journal_failure_aborts() {
        let entries = vec![
            entry(1, "/s/a", "/t/a", EntryOutcome::Committed),
            entry(2, "/s/b", "/t/b", EntryOutcome::Committed),
        ];
        let mut mover = FakeMover::with_files(&["/t/a", "/t/b"]);
        mover.fail_journal = true;

        let report = replay_undo(&entries, &HashSet::new(), &mut mover, &CancelToken::new());
        assert!(report.aborted);
        assert_eq!(report.failed_restores.len(), 1);
        assert!(!report.is_complete_success());
    }
}
