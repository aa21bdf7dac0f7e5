//! Command-line interface module for refile.
//!
//! This module handles all CLI-related functionality including:
//! - Command parsing
//! - Organization and undo with a live progress spinner
//! - History, reconciliation and maintenance commands

use crate::classifier::OrganizeMode;
use crate::config::OrganizerConfig;
use crate::engine::{Coordinator, OrganizeRequest};
use crate::journal::BatchId;
use crate::output::OutputFormatter;
use clap::{Parser, Subcommand};
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Number of planned moves listed by a dry run.
const DEFAULT_PREVIEW_LIMIT: usize = 200;

const MODE_NAMES: &str = "extension, alphabet, camera-tag, sequential, delimiter, learned, \
                          date-year, date-month, date-day, composite";

#[derive(Debug, Parser)]
#[command(name = "refile")]
#[command(version, about = "Sort files into folders, with a journal and exact undo", long_about = None)]
pub struct Cli {
    /// Configuration file (default: .refile.toml, then ~/.config/refile/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the transaction log and learned patterns
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Move files from the source directories into classified folders
    Organize {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        /// Target root; defaults to the first source with --in-place
        #[arg(short, long)]
        target: Option<PathBuf>,
        #[arg(short, long, default_value = "extension")]
        mode: String,
        /// Sort only the files directly inside each source, next to them
        #[arg(long)]
        in_place: bool,
        /// Show what would happen without moving anything
        #[arg(long)]
        dry_run: bool,
        /// Maximum number of planned moves listed by --dry-run
        #[arg(long, default_value_t = DEFAULT_PREVIEW_LIMIT)]
        limit: usize,
    },
    /// Move the files of a batch back (default: the newest organize batch)
    Undo { batch: Option<BatchId> },
    /// List recorded batches
    History,
    /// Show the folder a file name would be sorted into
    Classify {
        file: String,
        #[arg(short, long, default_value = "composite")]
        mode: String,
    },
    /// Remember that files shaped like FILE belong in FOLDER
    Learn { file: String, folder: String },
    /// Learn folder choices from an already organized tree
    Scan { root: PathBuf },
    /// List operations whose outcome was never recorded
    Reconcile,
    /// Drop old batches from the transaction log
    Compact {
        #[arg(long, default_value_t = 20)]
        keep: usize,
    },
}

/// `$HOME/.local/share/refile`, or `.refile` when `HOME` is unset.
pub fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| {
            PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("refile")
        })
        .unwrap_or_else(|_| PathBuf::from(".refile"))
}

fn parse_mode(name: &str, config: &OrganizerConfig) -> Result<OrganizeMode, String> {
    OrganizeMode::parse(name, config.learned_confidence_threshold)
        .ok_or_else(|| format!("Unknown mode '{}'. Valid modes: {}", name, MODE_NAMES))
}

/// Runs one parsed command line.
///
/// # Examples
///
/// ```no_run
/// use clap::Parser;
/// use refile::cli::{Cli, run_cli};
///
/// let cli = Cli::parse_from(["refile", "organize", "/home/me/Downloads", "--target", "/home/me/Sorted"]);
/// if let Err(e) = run_cli(cli) {
///     eprintln!("Error: {}", e);
/// }
/// ```
pub fn run_cli(cli: Cli) -> Result<(), String> {
    let config_path = OrganizerConfig::locate(cli.config.as_deref());
    let config = match &config_path {
        Some(path) => OrganizerConfig::load_from_file(path),
        None => Ok(OrganizerConfig::default()),
    }
    .map_err(|e| format!("Error loading configuration: {}", e))?;
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let coordinator =
        Coordinator::open(&data_dir, config.clone()).map_err(|e| format!("Error: {}", e))?;

    if !matches!(cli.command, Commands::Reconcile)
        && let Err(e) = coordinator.check_consistency()
    {
        OutputFormatter::warning(&format!("{}. Run 'refile reconcile' for details.", e));
    }

    match cli.command {
        Commands::Organize {
            sources,
            target,
            mode,
            in_place,
            dry_run,
            limit,
        } => {
            let target = match (target, in_place) {
                (Some(target), _) => target,
                (None, true) => sources[0].clone(),
                (None, false) => return Err("--target is required unless --in-place".to_string()),
            };
            let request = OrganizeRequest {
                sources,
                target,
                mode: parse_mode(&mode, &config)?,
                in_place,
            };
            if dry_run {
                preview(&coordinator, &request, limit)
            } else {
                organize(&coordinator, request)?;
                remember_recent(&coordinator, config_path.as_deref());
                Ok(())
            }
        }
        Commands::Undo { batch } => undo(&coordinator, batch),
        Commands::History => {
            let history = coordinator.history().map_err(|e| e.to_string())?;
            OutputFormatter::history(&history);
            Ok(())
        }
        Commands::Classify { file, mode } => {
            let mode = parse_mode(&mode, &config)?;
            match coordinator.classify(&file, &mode).map_err(|e| e.to_string())? {
                Some(result) => {
                    let confidence = result
                        .confidence
                        .map(|c| format!(", confidence {:.2}", c))
                        .unwrap_or_default();
                    OutputFormatter::plain(&format!(
                        "{} → {}/ ({:?}{})",
                        file, result.folder, result.strategy, confidence
                    ));
                }
                None => OutputFormatter::plain(&format!(
                    "{} stays where it is: mode '{}' does not apply",
                    file,
                    mode.name()
                )),
            }
            Ok(())
        }
        Commands::Learn { file, folder } => {
            coordinator
                .learn(&file, &folder)
                .map_err(|e| e.to_string())?;
            OutputFormatter::success(&format!("Files shaped like '{}' go to {}/", file, folder));
            Ok(())
        }
        Commands::Scan { root } => {
            let learned = coordinator
                .learn_from_tree(&root)
                .map_err(|e| e.to_string())?;
            OutputFormatter::success(&format!(
                "Learned from {} files under {}",
                learned,
                root.display()
            ));
            Ok(())
        }
        Commands::Reconcile => {
            let entries = coordinator.unresolved().map_err(|e| e.to_string())?;
            OutputFormatter::unresolved(&entries);
            Ok(())
        }
        Commands::Compact { keep } => {
            let report = coordinator.compact(keep).map_err(|e| e.to_string())?;
            OutputFormatter::success(&format!(
                "Kept {} batches, dropped {}",
                report.kept.len(),
                report.dropped.len()
            ));
            Ok(())
        }
    }
}

fn organize(coordinator: &Coordinator, request: OrganizeRequest) -> Result<(), String> {
    OutputFormatter::info(&format!(
        "Organizing into {} ({})",
        request.target.display(),
        request.mode.name()
    ));

    let handle = coordinator
        .start_organize(request)
        .map_err(|e| e.to_string())?;
    let spinner = OutputFormatter::create_spinner("organize");
    for progress in handle.progress().iter() {
        OutputFormatter::show_progress(&spinner, &progress);
    }
    spinner.finish_and_clear();

    let summary = handle.wait().map_err(|e| e.to_string())?;
    OutputFormatter::batch_summary(&summary);
    Ok(())
}

fn preview(
    coordinator: &Coordinator,
    request: &OrganizeRequest,
    limit: usize,
) -> Result<(), String> {
    let moves = coordinator
        .preview(request, limit)
        .map_err(|e| e.to_string())?;
    OutputFormatter::preview(&moves);
    if moves.len() == limit {
        OutputFormatter::dry_run_notice(&format!("Listing stopped after {} files.", limit));
    }
    OutputFormatter::plain("\n✓ Dry run complete. No files were modified.");
    Ok(())
}

fn undo(coordinator: &Coordinator, batch: Option<BatchId>) -> Result<(), String> {
    let batch_id = match batch {
        Some(id) => id,
        None => coordinator
            .latest_organize_batch()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "No organize batch to undo".to_string())?,
    };

    let handle = coordinator
        .start_undo(batch_id)
        .map_err(|e| e.to_string())?;
    let spinner = OutputFormatter::create_spinner("undo");
    for progress in handle.progress().iter() {
        OutputFormatter::show_progress(&spinner, &progress);
    }
    spinner.finish_and_clear();

    let report = handle.wait().map_err(|e| e.to_string())?;
    OutputFormatter::undo_summary(&report);
    Ok(())
}

/// Writes the updated recent-directory lists into the configuration file
/// that was loaded. Without one, nothing is written.
fn remember_recent(coordinator: &Coordinator, config_path: Option<&Path>) {
    let Some(path) = config_path else {
        debug!("No configuration file loaded; recent directories are not saved");
        return;
    };

    let recent = match coordinator.recent_directories() {
        Ok(recent) => recent,
        Err(e) => {
            warn!("Cannot read recent directories: {}", e);
            return;
        }
    };
    if let Err(e) = OrganizerConfig::save_recent_directories(path, &recent) {
        warn!("Cannot save recent directories to {}: {}", path.display(), e);
    }
}
