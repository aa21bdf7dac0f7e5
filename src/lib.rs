//! refile - sort files into folders, safely and reversibly
//!
//! Files are classified by name (extension, first letter, camera tag,
//! sequence, delimiter, learned patterns, date) into folders under a target
//! directory. Every move goes through a durable transaction log, so any
//! organize batch can be undone exactly, and name collisions are settled by
//! comparing size and timestamp instead of overwriting.
//!
//! ```no_run
//! use refile::{Coordinator, OrganizeMode, OrganizeRequest, OrganizerConfig};
//! use std::path::{Path, PathBuf};
//!
//! let coordinator = Coordinator::open(Path::new("/home/me/.local/share/refile"), OrganizerConfig::default())?;
//! let summary = coordinator.organize(OrganizeRequest {
//!     sources: vec![PathBuf::from("/home/me/Downloads")],
//!     target: PathBuf::from("/home/me/Sorted"),
//!     mode: OrganizeMode::Extension,
//!     in_place: false,
//! })?;
//! coordinator.undo(summary.batch_id)?;
//! # Ok::<(), refile::EngineError>(())
//! ```

pub mod classifier;
pub mod cli;
pub mod collision;
pub mod config;
pub mod engine;
pub mod executor;
pub mod journal;
pub mod output;
pub mod patterns;
pub mod undo;
pub mod validate;

pub use classifier::{ClassificationResult, ClassifyContext, DateGranularity, OrganizeMode, classify};
pub use collision::{CollisionKind, CollisionResolver, ContentTimestamp, FileRecord, NoContentTimestamp};
pub use config::{CompiledFilters, ConfigError, DuplicateDetection, OrganizerConfig, RecentDirectories};
pub use engine::{
    BatchHandle, BatchSummary, CancelToken, Coordinator, EngineError, OrganizeRequest, PlannedMove,
    Progress,
};
pub use executor::{MoveError, MoveExecutor, MoveRequest};
pub use journal::{BatchKind, BatchOutcome, EntryOutcome, JournalError, OperationEntry, TransactionLog};
pub use patterns::{LearnedPattern, LearnedPatterns};
pub use undo::{FileMover, UndoReport, replay_undo};
pub use validate::{ValidationError, validate_request};
