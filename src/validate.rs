//! Pre-flight checks on source and target directories, and folder-name
//! sanitizing.
//!
//! Everything here runs before enumeration starts. A rejected request leaves
//! no trace on disk.

use std::fs;
use std::path::{Path, PathBuf};

/// Device names that Windows refuses as file or folder names.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Characters that are invalid in a folder name on at least one platform.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Errors raised while validating an organize request.
#[derive(Debug)]
pub enum ValidationError {
    /// No source directory was given.
    NoSources,
    /// A path could not be resolved.
    Unresolvable {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A path exists but is not a directory.
    NotADirectory(PathBuf),
    /// A path is, or lives under, a protected system location.
    SystemPath { path: PathBuf, protected: PathBuf },
    /// Source and target resolve to the same directory.
    SameSourceAndTarget(PathBuf),
    /// The target lives inside a source directory.
    TargetInsideSource { source: PathBuf, target: PathBuf },
    /// A source directory lives inside the target.
    SourceInsideTarget { source: PathBuf, target: PathBuf },
    /// The target directory cannot be written to.
    NotWritable(PathBuf),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSources => write!(f, "No source directories given"),
            Self::Unresolvable { path, source } => {
                write!(f, "Cannot resolve {}: {}", path.display(), source)
            }
            Self::NotADirectory(path) => write!(f, "Not a directory: {}", path.display()),
            Self::SystemPath { path, protected } => write!(
                f,
                "Refusing to organize system location {} (protected: {})",
                path.display(),
                protected.display()
            ),
            Self::SameSourceAndTarget(path) => write!(
                f,
                "Source and target are the same directory: {} (use in-place mode)",
                path.display()
            ),
            Self::TargetInsideSource { source, target } => write!(
                f,
                "Target {} is inside source {}",
                target.display(),
                source.display()
            ),
            Self::SourceInsideTarget { source, target } => write!(
                f,
                "Source {} is inside target {}",
                source.display(),
                target.display()
            ),
            Self::NotWritable(path) => {
                write!(f, "Target directory is not writable: {}", path.display())
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Source and target directories that passed validation, in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPaths {
    pub sources: Vec<PathBuf>,
    pub target: PathBuf,
}

/// Canonicalizes and checks an organize request.
///
/// With `in_place` set, a source may equal the target (or nest with it);
/// every other check still applies.
pub fn validate_request(
    sources: &[PathBuf],
    target: &Path,
    in_place: bool,
) -> Result<ValidatedPaths, ValidationError> {
    if sources.is_empty() {
        return Err(ValidationError::NoSources);
    }

    let target = canonical_dir(target)?;
    ensure_not_protected(&target)?;
    ensure_writable(&target)?;

    let mut resolved = Vec::with_capacity(sources.len());
    for source in sources {
        let source = canonical_dir(source)?;
        ensure_not_protected(&source)?;

        if !in_place {
            if source == target {
                return Err(ValidationError::SameSourceAndTarget(source));
            }
            if target.starts_with(&source) {
                return Err(ValidationError::TargetInsideSource {
                    source,
                    target: target.clone(),
                });
            }
            if source.starts_with(&target) {
                return Err(ValidationError::SourceInsideTarget {
                    source,
                    target: target.clone(),
                });
            }
        }

        if !resolved.contains(&source) {
            resolved.push(source);
        }
    }

    Ok(ValidatedPaths {
        sources: resolved,
        target,
    })
}

/// Resolves symlinks and `..` and makes sure the result is a directory.
fn canonical_dir(path: &Path) -> Result<PathBuf, ValidationError> {
    let canonical = fs::canonicalize(path).map_err(|e| ValidationError::Unresolvable {
        path: path.to_path_buf(),
        source: e,
    })?;
    if !canonical.is_dir() {
        return Err(ValidationError::NotADirectory(canonical));
    }
    Ok(canonical)
}

fn ensure_writable(dir: &Path) -> Result<(), ValidationError> {
    let metadata = fs::metadata(dir).map_err(|e| ValidationError::Unresolvable {
        path: dir.to_path_buf(),
        source: e,
    })?;
    if metadata.permissions().readonly() {
        return Err(ValidationError::NotWritable(dir.to_path_buf()));
    }
    Ok(())
}

/// Rejects the filesystem root and anything under a protected location.
fn ensure_not_protected(path: &Path) -> Result<(), ValidationError> {
    if path.parent().is_none() {
        return Err(ValidationError::SystemPath {
            path: path.to_path_buf(),
            protected: path.to_path_buf(),
        });
    }

    for protected in protected_roots() {
        if is_under(path, &protected) {
            return Err(ValidationError::SystemPath {
                path: path.to_path_buf(),
                protected,
            });
        }
    }
    Ok(())
}

#[cfg(windows)]
fn is_under(path: &Path, root: &Path) -> bool {
    let path = path.to_string_lossy().trim_start_matches(r"\\?\").to_lowercase();
    let root = root.to_string_lossy().to_lowercase();
    path == root || path.starts_with(&format!("{}\\", root.trim_end_matches('\\')))
}

#[cfg(not(windows))]
fn is_under(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Returns the protected system roots for the running platform.
pub fn protected_roots() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        let mut roots: Vec<PathBuf> = [
            r"C:\Windows",
            r"C:\Program Files",
            r"C:\Program Files (x86)",
            r"C:\ProgramData",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();
        if let Ok(system_root) = std::env::var("SystemRoot")
            && !system_root.is_empty()
        {
            roots.push(PathBuf::from(system_root));
        }
        roots
    }

    #[cfg(target_os = "macos")]
    {
        [
            "/System",
            "/Library",
            "/Applications",
            "/usr",
            "/bin",
            "/sbin",
            "/etc",
            "/private/etc",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }

    #[cfg(all(not(windows), not(target_os = "macos")))]
    {
        [
            "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/sbin", "/sys",
            "/usr", "/var",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }
}

/// Makes a generated folder name safe to create on any platform.
///
/// Invalid characters become `_`, trailing dots and spaces are dropped and a
/// reserved device name gets a `_1` suffix.
///
/// # Examples
///
/// ```
/// use refile::validate::sanitize_folder_name;
///
/// assert_eq!(sanitize_folder_name("IMG"), "IMG");
/// assert_eq!(sanitize_folder_name("CON"), "CON_1");
/// assert_eq!(sanitize_folder_name("a:b?"), "a_b_");
/// ```
pub fn sanitize_folder_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if INVALID_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim_end_matches([' ', '.']).trim_start();

    if cleaned.is_empty() {
        return "_".to_string();
    }

    let stem = cleaned.split('.').next().unwrap_or(cleaned).to_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return format!("{}_1", cleaned);
    }

    cleaned.to_string()
}

/// Sanitizes every `/`-separated segment of a folder path.
pub fn sanitize_folder_path(folder: &str) -> String {
    folder
        .split(['/', '\\'])
        .filter(|segment| !segment.trim().is_empty())
        .map(sanitize_folder_name)
        .collect::<Vec<_>>()
        .join("/")
}
