//! Output formatting and styling module.
//!
//! Provides a centralized interface for all CLI output, including colored
//! output, the batch progress spinner and summary tables. The library itself
//! never prints; only the binary goes through this module.

use crate::engine::{BatchSummary, PlannedMove, Progress};
use crate::journal::{BatchOutcome, OperationEntry};
use crate::undo::UndoReport;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;

/// Manages all CLI output with consistent styling and formatting.
pub struct OutputFormatter;

impl OutputFormatter {
    /// Prints a success message in green with a checkmark.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use refile::output::OutputFormatter;
    /// OutputFormatter::success("Batch 3 complete");
    /// ```
    pub fn success(message: &str) {
        println!("{} {}", "✓".green(), message);
    }

    /// Prints an error message in red with an X mark.
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red(), message);
    }

    /// Prints a warning message in yellow with a warning symbol.
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow(), message);
    }

    /// Prints an info message in cyan.
    pub fn info(message: &str) {
        println!("{}", message.cyan());
    }

    pub fn plain(message: &str) {
        println!("{}", message);
    }

    /// Prints a section header.
    pub fn header(header: &str) {
        println!("\n{}", header.bold());
    }

    /// Prints a dry-run notice message.
    pub fn dry_run_notice(message: &str) {
        println!("{}", format!("[DRY RUN] {}", message).yellow());
    }

    /// Creates a spinner for a running batch; feed it with [`Self::show_progress`].
    pub fn create_spinner(label: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {prefix:.bold} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_prefix(label.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    }

    pub fn show_progress(spinner: &ProgressBar, progress: &Progress) {
        spinner.set_message(format!(
            "{} processed, {} moved, {} skipped, {} failed",
            progress.processed, progress.moved, progress.skipped, progress.failed
        ));
    }

    /// Prints what an organize batch did.
    pub fn batch_summary(summary: &BatchSummary) {
        Self::header(&format!("BATCH {} ({})", summary.batch_id, summary.mode));
        println!("  Moved:   {}", summary.moved.to_string().green());
        println!("  Skipped: {}", summary.skipped);
        if summary.failed > 0 {
            println!("  Failed:  {}", summary.failed.to_string().red());
            for (path, reason) in &summary.failures {
                eprintln!("    - {}: {}", path.display(), reason);
            }
        }

        match summary.outcome {
            Some(BatchOutcome::Complete) => Self::success("Batch complete"),
            Some(BatchOutcome::Partial) => {
                Self::warning("Batch cancelled; files already moved stay moved")
            }
            Some(BatchOutcome::Aborted) => {
                Self::error("Batch aborted: the transaction log could not be written")
            }
            None => Self::warning("Batch was not closed"),
        }
        Self::plain(&format!(
            "Use 'refile undo {}' to revert this batch.",
            summary.batch_id
        ));
    }

    /// Prints what an undo did.
    pub fn undo_summary(report: &UndoReport) {
        Self::header(&format!("UNDO OF BATCH {}", report.batch_id));
        println!("  Restored: {}", report.restored_files.to_string().green());

        if !report.skipped_files.is_empty() {
            println!("  Skipped:  {}", report.skipped_files.len());
            for (path, reason) in &report.skipped_files {
                println!("    - {}: {}", path.display(), reason);
            }
        }

        if !report.failed_restores.is_empty() {
            println!("  Failed:   {}", report.failed_restores.len().to_string().red());
            for (path, reason) in &report.failed_restores {
                eprintln!("    - {}: {}", path.display(), reason);
            }
        }

        if report.aborted {
            Self::error("Undo aborted: the transaction log could not be written");
        } else if report.cancelled {
            Self::warning("Undo cancelled; restored files stay restored");
        } else if report.is_complete_success() {
            Self::success("Undo complete");
        } else {
            Self::warning("Some files could not be restored. Fix the issues and run undo again.");
        }
    }

    /// Prints the planned moves of a dry run with per-folder totals.
    pub fn preview(moves: &[PlannedMove]) {
        if moves.is_empty() {
            Self::dry_run_notice("No files would be moved.");
            return;
        }

        Self::dry_run_notice("Files would be organized as follows:");
        let mut folder_counts: HashMap<String, usize> = HashMap::new();
        for planned in moves {
            let note = planned
                .collision
                .map(|kind| format!(" ({})", kind.name()).yellow().to_string())
                .unwrap_or_default();
            println!(" - {}", planned.source.display());
            println!("   → {}{}", planned.destination.display(), note);
            *folder_counts.entry(planned.folder.clone()).or_insert(0) += 1;
        }
        Self::summary_table(&folder_counts, moves.len());
    }

    /// Prints a table with file counts by destination folder.
    pub fn summary_table(folder_counts: &HashMap<String, usize>, total_files: usize) {
        Self::header("SUMMARY");

        let mut folders: Vec<_> = folder_counts.iter().collect();
        folders.sort_by_key(|&(name, _)| name);

        let width = folders
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0)
            .max(6);

        println!("{:<width$} | {}", "Folder".bold(), "Files".bold(), width = width);
        println!("{}", "-".repeat(width + 10));
        for (folder, count) in &folders {
            let file_word = if **count == 1 { "file" } else { "files" };
            println!(
                "{:<width$} | {} {}",
                folder,
                count.to_string().green(),
                file_word,
                width = width
            );
        }
        println!("{}", "-".repeat(width + 10));
        println!(
            "{:<width$} | {} {}",
            "Total".bold(),
            total_files.to_string().green().bold(),
            if total_files == 1 { "file" } else { "files" },
            width = width
        );
    }

    /// Prints the batch history, oldest first.
    pub fn history(batches: &[BatchSummary]) {
        if batches.is_empty() {
            Self::info("No batches recorded.");
            return;
        }

        Self::header("HISTORY");
        println!(
            "{:>5}  {:<8}  {:<12}  {:<20}  {:<9}  {:>6}  {:>6}",
            "Batch".bold(),
            "Kind".bold(),
            "Mode".bold(),
            "Created".bold(),
            "Outcome".bold(),
            "Moved".bold(),
            "Failed".bold()
        );
        for batch in batches {
            let outcome = match batch.outcome {
                Some(BatchOutcome::Complete) => "complete".green(),
                Some(BatchOutcome::Partial) => "partial".yellow(),
                Some(BatchOutcome::Aborted) => "aborted".red(),
                None => "open".red(),
            };
            let kind = match batch.reverts_batch {
                Some(reverted) => format!("{}←{}", batch.kind, reverted),
                None => batch.kind.to_string(),
            };
            println!(
                "{:>5}  {:<8}  {:<12}  {:<20}  {:<9}  {:>6}  {:>6}",
                batch.batch_id,
                kind,
                batch.mode,
                batch.created.format("%Y-%m-%d %H:%M:%S").to_string(),
                outcome,
                batch.moved,
                batch.failed
            );
        }
    }

    /// Lists entries with unknown outcome.
    pub fn unresolved(entries: &[OperationEntry]) {
        if entries.is_empty() {
            Self::success("Every logged operation has a recorded outcome.");
            return;
        }

        Self::warning(&format!(
            "{} operation(s) have no recorded outcome. Check each pair by hand:",
            entries.len()
        ));
        for entry in entries {
            println!(
                "  [batch {} entry {}] {} → {}",
                entry.batch_id,
                entry.entry_id,
                entry.source.display(),
                entry.destination.display()
            );
        }
    }
}
