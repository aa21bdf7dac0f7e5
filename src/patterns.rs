//! Learned filename patterns.
//!
//! A pattern maps a filename *signature* to the folder the user chose for
//! files of that shape. The table is a plain frequency count: confidence is
//! derived from the usage count alone, so it is fully reproducible from the
//! stored file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Smoothing constant of the confidence formula `count / (count + k)`.
pub const CONFIDENCE_SMOOTHING: f64 = 1.0;

/// Number of example filenames kept per pattern.
pub const MAX_EXAMPLES: usize = 5;

/// Usage count above which a conflicting choice is stored as an alternate
/// instead of replacing the mapping.
const STRONG_PATTERN_COUNT: u32 = 3;

/// Errors raised while loading or saving the pattern table.
#[derive(Debug)]
pub enum PatternError {
    /// The pattern file could not be read or written.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The pattern file is not valid JSON.
    Invalid { path: PathBuf, reason: String },
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "Pattern store {} unavailable: {}", path.display(), source)
            }
            Self::Invalid { path, reason } => {
                write!(f, "Pattern store {} is corrupt: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for PatternError {}

/// One remembered folder choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub folder: String,
    pub count: u32,
    #[serde(default)]
    pub examples: Vec<String>,
}

impl LearnedPattern {
    fn new(folder: &str, filename: &str) -> Self {
        Self {
            folder: folder.to_string(),
            count: 1,
            examples: vec![filename.to_string()],
        }
    }

    /// Confidence in `[0, 1)`, derived from the usage count.
    pub fn confidence(&self) -> f64 {
        let count = f64::from(self.count);
        count / (count + CONFIDENCE_SMOOTHING)
    }

    fn remember_example(&mut self, filename: &str) {
        self.examples.push(filename.to_string());
        if self.examples.len() > MAX_EXAMPLES {
            let excess = self.examples.len() - MAX_EXAMPLES;
            self.examples.drain(..excess);
        }
    }
}

/// Builds the signature of a filename.
///
/// Digit runs become one `N` per digit and letter runs become `TEXT`, except
/// short all-caps runs which are kept (camera tags such as `IMG`). The
/// extension is ignored.
///
/// # Examples
///
/// ```
/// use refile::patterns::signature;
///
/// assert_eq!(signature("IMG_1234.jpg"), "IMG_NNNN");
/// assert_eq!(signature("vacation-001.jpg"), "TEXT-NNN");
/// assert_eq!(signature("031204-0022.jpg"), "NNNNNN-NNNN");
/// ```
pub fn signature(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let chars: Vec<char> = stem.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            while i < chars.len() && chars[i].is_ascii_digit() {
                out.push('N');
                i += 1;
            }
        } else if c.is_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i].is_alphabetic() {
                i += 1;
            }
            let run: String = chars[start..i].iter().collect();
            let is_tag = run.len() <= 5 && run.chars().all(|ch| ch.is_uppercase());
            if is_tag {
                out.push_str(&run);
            } else {
                out.push_str("TEXT");
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// The signature → pattern table.
///
/// `BTreeMap` keeps the saved file and every listing in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LearnedPatterns {
    patterns: BTreeMap<String, LearnedPattern>,
}

impl LearnedPatterns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the table from `path`; a missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self, PatternError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| PatternError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| PatternError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Writes the table to a sibling temp file and renames it into place.
    pub fn save(&self, path: &Path) -> Result<(), PatternError> {
        let io_err = |e| PatternError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let json = serde_json::to_string_pretty(self).map_err(|e| PatternError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json).map_err(io_err)?;
        fs::rename(&staging, path).map_err(io_err)
    }

    /// Records that `filename` was filed under `folder`.
    pub fn learn(&mut self, filename: &str, folder: &str) {
        let sig = signature(filename);

        let Some(pattern) = self.patterns.get_mut(&sig) else {
            self.patterns
                .insert(sig, LearnedPattern::new(folder, filename));
            return;
        };

        if pattern.folder == folder {
            pattern.count += 1;
        } else if pattern.count > STRONG_PATTERN_COUNT {
            // Strong mapping: keep it, remember the deviation on the side.
            pattern.remember_example(filename);
            let alternate = format!("{}_ALT", sig);
            self.patterns
                .entry(alternate)
                .and_modify(|alt| {
                    if alt.folder == folder {
                        alt.count += 1;
                    } else {
                        alt.folder = folder.to_string();
                        alt.count = 1;
                    }
                    alt.remember_example(filename);
                })
                .or_insert_with(|| LearnedPattern::new(folder, filename));
            return;
        } else {
            pattern.folder = folder.to_string();
            pattern.count = 1;
        }
        pattern.remember_example(filename);
    }

    /// Looks up the folder remembered for the shape of `filename`.
    pub fn predict(&self, filename: &str) -> Option<(&LearnedPattern, f64)> {
        self.patterns
            .get(&signature(filename))
            .map(|pattern| (pattern, pattern.confidence()))
    }

    pub fn get(&self, signature: &str) -> Option<&LearnedPattern> {
        self.patterns.get(signature)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LearnedPattern)> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
