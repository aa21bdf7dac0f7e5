//! Collision handling for occupied destination paths.
//!
//! When the classified destination already exists, the incoming file and the
//! occupant are compared by size and by *moment* (content timestamp when one
//! is known, modification time otherwise):
//!
//! | size | moment | placed in          | suffix |
//! |------|--------|--------------------|--------|
//! | same | same   | `!Dupes/`          | `[d]`  |
//! | diff | same   | `!Dupes Size/`     | `{d}`  |
//! | same | diff   | intended folder    | `[d]`  |
//! | diff | diff   | intended folder    | `{d}`  |
//!
//! Both duplicate areas sit directly under the target root.

use crate::config::DuplicateDetection;
use crate::executor::MoveError;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use twox_hash::XxHash64;

/// Folder for files identical in size and moment.
pub const DUPES_FOLDER: &str = "!Dupes";

/// Folder for files taken at the same moment with a different size.
pub const SIZE_DUPES_FOLDER: &str = "!Dupes Size";

/// Moments closer than this many milliseconds are equal.
pub const MOMENT_TOLERANCE_MS: i64 = 1000;

/// Highest numeric disambiguator tried before giving up on a file.
pub const MAX_DISAMBIGUATOR: u32 = 10_000;

/// Source of timestamps embedded in file content (EXIF and the like).
pub trait ContentTimestamp: Send + Sync {
    fn content_timestamp(&self, path: &Path) -> Option<DateTime<Utc>>;
}

/// Reads no embedded metadata; every file falls back to its modification time.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContentTimestamp;

impl ContentTimestamp for NoContentTimestamp {
    fn content_timestamp(&self, _path: &Path) -> Option<DateTime<Utc>> {
        None
    }
}

/// Size and timestamps of one file, gathered at scan time.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub content: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Reads metadata for `path` without following a final symlink.
    pub fn inspect(path: &Path, timestamps: &dyn ContentTimestamp) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            content: timestamps.content_timestamp(path),
        })
    }

    /// The timestamp used for comparisons: content first, then modification.
    pub fn moment(&self) -> Option<DateTime<Utc>> {
        self.content.or(self.modified)
    }
}

/// Whether two moments are equal within the tolerance.
///
/// An unknown moment on either side never matches.
pub fn moments_match(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).num_milliseconds().abs() < MOMENT_TOLERANCE_MS,
        _ => false,
    }
}

/// The four collision cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionKind {
    TrueDuplicate,
    SameMomentVariant,
    SameSizeDifferentMoment,
    DifferentSizeDifferentMoment,
}

impl CollisionKind {
    pub fn decide(size_match: bool, moment_match: bool) -> Self {
        match (size_match, moment_match) {
            (true, true) => Self::TrueDuplicate,
            (false, true) => Self::SameMomentVariant,
            (true, false) => Self::SameSizeDifferentMoment,
            (false, false) => Self::DifferentSizeDifferentMoment,
        }
    }

    /// Duplicate area under the target root, or `None` for the intended folder.
    pub fn bucket(&self) -> Option<&'static str> {
        match self {
            Self::TrueDuplicate => Some(DUPES_FOLDER),
            Self::SameMomentVariant => Some(SIZE_DUPES_FOLDER),
            _ => None,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::TrueDuplicate | Self::SameSizeDifferentMoment => "[d]",
            Self::SameMomentVariant | Self::DifferentSizeDifferentMoment => "{d}",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TrueDuplicate => "true-duplicate",
            Self::SameMomentVariant => "same-moment-variant",
            Self::SameSizeDifferentMoment => "same-size-different-moment",
            Self::DifferentSizeDifferentMoment => "different-size-different-moment",
        }
    }
}

/// Where a file will finally be placed.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub destination: PathBuf,
    pub collision: Option<CollisionKind>,
}

/// Answers what currently occupies a path, if anything.
///
/// The executor asks the disk; a dry run also counts files it has already
/// planned to place.
pub type Occupancy<'a> = dyn Fn(&Path) -> Option<FileRecord> + 'a;

/// Occupant of `path` on disk.
pub fn occupant_on_disk(path: &Path, timestamps: &dyn ContentTimestamp) -> Option<FileRecord> {
    match FileRecord::inspect(path, timestamps) {
        Ok(record) => Some(record),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            // Something is there but unreadable; treat it as occupied.
            warn!("Cannot inspect {}: {}", path.display(), e);
            Some(FileRecord {
                path: path.to_path_buf(),
                size: u64::MAX,
                modified: None,
                content: None,
            })
        }
    }
}

/// Decides final destinations for files whose intended path may be taken.
pub struct CollisionResolver<'a> {
    target_root: &'a Path,
    detection: DuplicateDetection,
}

impl<'a> CollisionResolver<'a> {
    pub fn new(target_root: &'a Path, detection: DuplicateDetection) -> Self {
        Self {
            target_root,
            detection,
        }
    }

    /// Resolves the destination of `incoming` whose classified path is
    /// `intended`.
    ///
    /// Returns `intended` unchanged when it is free.
    ///
    /// # Errors
    ///
    /// Returns `MoveError::CollisionExhausted` when no free name is found
    /// within [`MAX_DISAMBIGUATOR`] attempts.
    pub fn resolve(
        &self,
        incoming: &FileRecord,
        intended: &Path,
        occupancy: &Occupancy<'_>,
    ) -> Result<Resolution, MoveError> {
        let Some(occupant) = occupancy(intended) else {
            return Ok(Resolution {
                destination: intended.to_path_buf(),
                collision: None,
            });
        };

        let kind = CollisionKind::decide(
            self.sizes_match(incoming, &occupant),
            moments_match(incoming.moment(), occupant.moment()),
        );

        let folder = match kind.bucket() {
            Some(bucket) => self.target_root.join(bucket),
            None => intended
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.target_root.to_path_buf()),
        };

        let file_name = intended
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let destination = free_suffixed_path(&folder, &file_name, kind.suffix(), occupancy)?;

        debug!(
            "Collision at {} ({}) -> {}",
            intended.display(),
            kind.name(),
            destination.display()
        );

        Ok(Resolution {
            destination,
            collision: Some(kind),
        })
    }

    fn sizes_match(&self, incoming: &FileRecord, occupant: &FileRecord) -> bool {
        if incoming.size != occupant.size {
            return false;
        }
        match self.detection {
            DuplicateDetection::SizeOnly => true,
            DuplicateDetection::Hash => match (digest(&incoming.path), digest(&occupant.path)) {
                (Ok(a), Ok(b)) => a == b,
                (Err(e), _) | (_, Err(e)) => {
                    warn!(
                        "Cannot hash {} or {}: {}",
                        incoming.path.display(),
                        occupant.path.display(),
                        e
                    );
                    false
                }
            },
        }
    }
}

/// Splits `name` into stem and extension (with its dot).
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// First free path of the form `stem{suffix}.ext`, `stem{suffix}2.ext`, ...
fn free_suffixed_path(
    folder: &Path,
    file_name: &str,
    suffix: &str,
    occupancy: &Occupancy<'_>,
) -> Result<PathBuf, MoveError> {
    let (stem, ext) = split_name(file_name);

    let first = folder.join(format!("{}{}{}", stem, suffix, ext));
    if occupancy(&first).is_none() {
        return Ok(first);
    }

    for counter in 2..=MAX_DISAMBIGUATOR {
        let candidate = folder.join(format!("{}{}{}{}", stem, suffix, counter, ext));
        if occupancy(&candidate).is_none() {
            return Ok(candidate);
        }
    }

    Err(MoveError::CollisionExhausted(first))
}

/// xxHash64 of a file's content.
pub fn digest(path: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = XxHash64::with_seed(0);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write(&buf[..n]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn at(seconds: i64) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap() + Duration::seconds(seconds))
    }

    fn record(path: &Path, size: u64, modified: Option<DateTime<Utc>>) -> FileRecord {
        FileRecord {
            path: path.to_path_buf(),
            size,
            modified,
            content: None,
        }
    }

    /// In-memory occupancy map.
    struct Slots(HashMap<PathBuf, FileRecord>);

    impl Slots {
        fn with(entries: &[FileRecord]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|r| (r.path.clone(), r.clone()))
                    .collect(),
            )
        }

        fn lookup(&self, path: &Path) -> Option<FileRecord> {
            self.0.get(path).cloned()
        }
    }

    #[test]
    fn test_decision_matrix() {
        assert_eq!(CollisionKind::decide(true, true), CollisionKind::TrueDuplicate);
        assert_eq!(CollisionKind::decide(false, true), CollisionKind::SameMomentVariant);
        assert_eq!(
            CollisionKind::decide(true, false),
            CollisionKind::SameSizeDifferentMoment
        );
        assert_eq!(
            CollisionKind::decide(false, false),
            CollisionKind::DifferentSizeDifferentMoment
        );

        assert_eq!(CollisionKind::TrueDuplicate.bucket(), Some("!Dupes"));
        assert_eq!(CollisionKind::SameMomentVariant.bucket(), Some("!Dupes Size"));
        assert_eq!(CollisionKind::SameSizeDifferentMoment.bucket(), None);
        assert_eq!(CollisionKind::TrueDuplicate.suffix(), "[d]");
        assert_eq!(CollisionKind::DifferentSizeDifferentMoment.suffix(), "{d}");
    }

    #[test]
    fn test_moment_tolerance() {
        assert!(moments_match(at(0), at(0)));
        assert!(moments_match(
            at(0),
            at(0).map(|t| t + Duration::milliseconds(999))
        ));
        assert!(!moments_match(at(0), at(1)));
        assert!(!moments_match(None, at(0)));
        assert!(!moments_match(None, None));
    }

    #[test]
    fn test_content_timestamp_wins() {
        let mut rec = record(Path::new("/a.jpg"), 1, at(100));
        assert_eq!(rec.moment(), at(100));
        rec.content = at(5);
        assert_eq!(rec.moment(), at(5));
    }

    #[test]
    fn test_free_destination_is_unchanged() {
        let root = Path::new("/target");
        let resolver = CollisionResolver::new(root, DuplicateDetection::SizeOnly);
        let slots = Slots::with(&[]);
        let incoming = record(Path::new("/src/a.txt"), 10, at(0));

        let resolution = resolver
            .resolve(&incoming, &root.join("TXT/a.txt"), &|p| slots.lookup(p))
            .unwrap();
        assert_eq!(resolution.destination, root.join("TXT/a.txt"));
        assert_eq!(resolution.collision, None);
    }

    #[test]
    fn test_true_duplicate_goes_to_dupes() {
        let root = Path::new("/target");
        let intended = root.join("Vacation/vacation.jpg");
        let slots = Slots::with(&[record(&intended, 100_000, at(0))]);
        let resolver = CollisionResolver::new(root, DuplicateDetection::SizeOnly);
        let incoming = record(Path::new("/src/vacation.jpg"), 100_000, at(0));

        let resolution = resolver
            .resolve(&incoming, &intended, &|p| slots.lookup(p))
            .unwrap();
        assert_eq!(resolution.destination, root.join("!Dupes/vacation[d].jpg"));
        assert_eq!(resolution.collision, Some(CollisionKind::TrueDuplicate));
    }

    #[test]
    fn test_same_moment_variant_goes_to_size_dupes() {
        let root = Path::new("/target");
        let intended = root.join("Vacation/vacation.jpg");
        let slots = Slots::with(&[record(&intended, 100_000, at(0))]);
        let resolver = CollisionResolver::new(root, DuplicateDetection::SizeOnly);
        let incoming = record(Path::new("/src/vacation.jpg"), 150_000, at(0));

        let resolution = resolver
            .resolve(&incoming, &intended, &|p| slots.lookup(p))
            .unwrap();
        assert_eq!(
            resolution.destination,
            root.join("!Dupes Size/vacation{d}.jpg")
        );
    }

    #[test]
    fn test_different_moment_stays_in_folder() {
        let root = Path::new("/target");
        let intended = root.join("Vacation/vacation.jpg");
        let slots = Slots::with(&[record(&intended, 100, at(0))]);
        let resolver = CollisionResolver::new(root, DuplicateDetection::SizeOnly);

        let same_size = record(Path::new("/src/vacation.jpg"), 100, at(60));
        let resolution = resolver
            .resolve(&same_size, &intended, &|p| slots.lookup(p))
            .unwrap();
        assert_eq!(resolution.destination, root.join("Vacation/vacation[d].jpg"));

        let other_size = record(Path::new("/src/vacation.jpg"), 7, None);
        let resolution = resolver
            .resolve(&other_size, &intended, &|p| slots.lookup(p))
            .unwrap();
        assert_eq!(resolution.destination, root.join("Vacation/vacation{d}.jpg"));
    }

    #[test]
    fn test_disambiguator_starts_at_two() {
        let root = Path::new("/target");
        let intended = root.join("JPG/photo.jpg");
        let slots = Slots::with(&[
            record(&intended, 1, at(0)),
            record(&root.join("!Dupes/photo[d].jpg"), 1, at(0)),
            record(&root.join("!Dupes/photo[d]2.jpg"), 1, at(0)),
        ]);
        let resolver = CollisionResolver::new(root, DuplicateDetection::SizeOnly);
        let incoming = record(Path::new("/src/photo.jpg"), 1, at(0));

        let resolution = resolver
            .resolve(&incoming, &intended, &|p| slots.lookup(p))
            .unwrap();
        assert_eq!(resolution.destination, root.join("!Dupes/photo[d]3.jpg"));
    }

    #[test]
    fn test_exhausted_disambiguator_fails() {
        let root = Path::new("/target");
        let resolver = CollisionResolver::new(root, DuplicateDetection::SizeOnly);
        let incoming = record(Path::new("/src/x.txt"), 1, None);
        let everything_taken = |p: &Path| Some(record(p, 2, None));

        let result = resolver.resolve(&incoming, &root.join("TXT/x.txt"), &everything_taken);
        assert!(matches!(result, Err(MoveError::CollisionExhausted(_))));
    }

    #[test]
    fn test_name_without_extension() {
        assert_eq!(split_name("README"), ("README", ""));
        assert_eq!(split_name(".bashrc"), (".bashrc", ""));
        assert_eq!(split_name("a.tar.gz"), ("a.tar", ".gz"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let root = Path::new("/target");
        let intended = root.join("A/a.bin");
        let slots = Slots::with(&[record(&intended, 5, at(0))]);
        let resolver = CollisionResolver::new(root, DuplicateDetection::SizeOnly);
        let incoming = record(Path::new("/src/a.bin"), 5, at(0));

        let first = resolver.resolve(&incoming, &intended, &|p| slots.lookup(p));
        let second = resolver.resolve(&incoming, &intended, &|p| slots.lookup(p));
        assert_eq!(first.unwrap(), second.unwrap());
    }

    #[test]
    fn test_hash_detection_compares_content() {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let existing = temp.path().join("existing.txt");
        let same = temp.path().join("same.txt");
        let different = temp.path().join("different.txt");
        fs::write(&existing, b"abcd").unwrap();
        fs::write(&same, b"abcd").unwrap();
        fs::write(&different, b"wxyz").unwrap();

        let root = temp.path();
        let slots = Slots::with(&[record(&existing, 4, at(0))]);
        let resolver = CollisionResolver::new(root, DuplicateDetection::Hash);

        let resolution = resolver
            .resolve(&record(&same, 4, at(0)), &existing, &|p| slots.lookup(p))
            .unwrap();
        assert_eq!(resolution.collision, Some(CollisionKind::TrueDuplicate));

        let resolution = resolver
            .resolve(&record(&different, 4, at(0)), &existing, &|p| {
                slots.lookup(p)
            })
            .unwrap();
        assert_eq!(resolution.collision, Some(CollisionKind::SameMomentVariant));
    }

    #[test]
    fn test_occupant_on_disk() {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let path = temp.path().join("file.txt");
        assert!(occupant_on_disk(&path, &NoContentTimestamp).is_none());

        fs::write(&path, b"hello").unwrap();
        let occupant = occupant_on_disk(&path, &NoContentTimestamp).expect("occupied");
        assert_eq!(occupant.size, 5);
        assert!(occupant.modified.is_some());
    }
}
