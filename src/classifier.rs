//! Filename classification.
//!
//! Every organization mode is a variant of [`OrganizeMode`] and is dispatched
//! through the single [`classify`] function. Each mode is a pure function of
//! the filename plus the read-only [`ClassifyContext`], so the same filename
//! and the same learned-pattern snapshot always give the same folder.
//!
//! # Examples
//!
//! ```
//! use refile::classifier::{classify, ClassifyContext, OrganizeMode};
//!
//! let ctx = ClassifyContext::default();
//! let result = classify(&OrganizeMode::CameraTag, "IMG_0042.jpg", &ctx).unwrap();
//! assert_eq!(result.folder, "IMG");
//!
//! let result = classify(&OrganizeMode::Extension, "notes.txt", &ctx).unwrap();
//! assert_eq!(result.folder, "TXT");
//! ```

use crate::patterns::LearnedPatterns;
use crate::validate::sanitize_folder_path;
use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

/// Default learned-pattern confidence required before a mapping is used.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;

/// Folder used by the extension mode for files without an extension.
pub const NO_EXTENSION_FOLDER: &str = "_NOEXT";

/// Folder used by the alphabet mode for names starting with a digit.
pub const DIGIT_FOLDER: &str = "0-9";

/// Folder used by the alphabet mode for names starting with a symbol.
pub const SYMBOL_FOLDER: &str = "!@#$";

static CAMERA_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z])(DSCN|DCSN|IMG|DSC|DCS)[_-]?\d+").expect("valid camera tag regex")
});

static DUPLICATE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*[-_]?\(\d+\)$").expect("valid duplicate marker regex"));

static TRAILING_DIGITS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)([-_ ]?)(\d{2,})$").expect("valid trailing digits regex")
});

/// Granularity of the date modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateGranularity {
    Year,
    Month,
    Day,
}

/// How files are sorted into folders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrganizeMode {
    /// Upper-cased extension (`JPG`), `_NOEXT` without one.
    Extension,
    /// First character: `A`-`Z`, `0-9` or `!@#$`.
    Alphabet,
    /// Camera prefixes such as `IMG_1234` or `DSCN0042`.
    CameraTag,
    /// Name with a trailing counter stripped (`vacation-001` → `Vacation`).
    Sequential,
    /// Prefix before the first separator run (`invoice_acme_march` → `Invoice`).
    Delimiter,
    /// Remembered folder for the filename's signature.
    Learned { min_confidence: f64 },
    /// Modification date of the file.
    Date(DateGranularity),
    /// Learned → camera tag → sequential → delimiter → extension.
    Composite { min_confidence: f64 },
}

impl OrganizeMode {
    /// Name recorded in the transaction log.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Extension => "extension",
            Self::Alphabet => "alphabet",
            Self::CameraTag => "camera-tag",
            Self::Sequential => "sequential",
            Self::Delimiter => "delimiter",
            Self::Learned { .. } => "learned",
            Self::Date(DateGranularity::Year) => "date-year",
            Self::Date(DateGranularity::Month) => "date-month",
            Self::Date(DateGranularity::Day) => "date-day",
            Self::Composite { .. } => "composite",
        }
    }

    /// Parses a mode name, using `min_confidence` for the learned modes.
    pub fn parse(name: &str, min_confidence: f64) -> Option<Self> {
        let mode = match name.to_lowercase().as_str() {
            "extension" | "ext" => Self::Extension,
            "alphabet" | "alpha" => Self::Alphabet,
            "camera-tag" | "camera" => Self::CameraTag,
            "sequential" => Self::Sequential,
            "delimiter" => Self::Delimiter,
            "learned" => Self::Learned { min_confidence },
            "date-year" | "year" => Self::Date(DateGranularity::Year),
            "date-month" | "month" => Self::Date(DateGranularity::Month),
            "date-day" | "day" => Self::Date(DateGranularity::Day),
            "composite" | "smart" => Self::Composite { min_confidence },
            _ => return None,
        };
        Some(mode)
    }

    /// Whether this mode needs the file's modification time.
    pub fn uses_file_time(&self) -> bool {
        matches!(self, Self::Date(_))
    }
}

/// The strategy that actually produced a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    Extension,
    Alphabet,
    CameraTag,
    Sequential,
    Delimiter,
    Learned,
    Date,
}

/// A classification outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Destination folder relative to the target; `/` separates segments.
    pub folder: String,
    pub strategy: Strategy,
    pub confidence: Option<f64>,
}

impl ClassificationResult {
    fn new(folder: &str, strategy: Strategy, confidence: Option<f64>) -> Self {
        Self {
            folder: sanitize_folder_path(folder),
            strategy,
            confidence,
        }
    }
}

/// Read-only inputs that some modes need besides the filename.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext<'a> {
    pub learned: Option<&'a LearnedPatterns>,
    pub modified: Option<DateTime<Utc>>,
}

/// Classifies `filename` under `mode`.
///
/// Returns `None` when the mode does not apply to the name; such files are
/// left where they are.
pub fn classify(
    mode: &OrganizeMode,
    filename: &str,
    ctx: &ClassifyContext<'_>,
) -> Option<ClassificationResult> {
    match mode {
        OrganizeMode::Extension => Some(by_extension(filename)),
        OrganizeMode::Alphabet => Some(by_alphabet(filename)),
        OrganizeMode::CameraTag => by_camera_tag(filename),
        OrganizeMode::Sequential => by_sequential(filename),
        OrganizeMode::Delimiter => by_delimiter(filename),
        OrganizeMode::Learned { min_confidence } => by_learned(filename, ctx, *min_confidence),
        OrganizeMode::Date(granularity) => by_date(ctx, *granularity),
        OrganizeMode::Composite { min_confidence } => by_learned(filename, ctx, *min_confidence)
            .or_else(|| by_camera_tag(filename))
            .or_else(|| by_sequential(filename))
            .or_else(|| by_delimiter(filename))
            .or_else(|| Some(by_extension(filename))),
    }
}

fn stem_of(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn by_extension(filename: &str) -> ClassificationResult {
    let folder = Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_uppercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| NO_EXTENSION_FOLDER.to_string());
    ClassificationResult::new(&folder, Strategy::Extension, None)
}

fn by_alphabet(filename: &str) -> ClassificationResult {
    let folder = match filename.chars().next() {
        Some(c) if c.is_alphabetic() => c.to_uppercase().collect(),
        Some(c) if c.is_ascii_digit() => DIGIT_FOLDER.to_string(),
        _ => SYMBOL_FOLDER.to_string(),
    };
    ClassificationResult::new(&folder, Strategy::Alphabet, None)
}

fn by_camera_tag(filename: &str) -> Option<ClassificationResult> {
    let captures = CAMERA_TAG.captures(filename)?;
    let tag = captures.get(1)?.as_str().to_uppercase();
    Some(ClassificationResult::new(
        &tag,
        Strategy::CameraTag,
        Some(0.95),
    ))
}

fn by_sequential(filename: &str) -> Option<ClassificationResult> {
    let stem = stem_of(filename);
    let stem = DUPLICATE_MARKER.replace(&stem, "");
    let stem = stem.trim_end_matches([' ', '.']);

    let captures = TRAILING_DIGITS.captures(stem)?;
    let base = captures.get(1)?.as_str();
    let separator = captures.get(2).map_or("", |m| m.as_str());

    // "20240101" is a bare number, not a counter on a base name.
    if separator.is_empty() && base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let base = base.trim_end_matches([' ', '-', '_', '.']);
    if base.is_empty() {
        return None;
    }

    Some(ClassificationResult::new(
        &title_case(base),
        Strategy::Sequential,
        Some(0.90),
    ))
}

fn by_delimiter(filename: &str) -> Option<ClassificationResult> {
    let stem = stem_of(filename);
    let split_at = stem.find(|c: char| !c.is_alphanumeric())?;
    let prefix = &stem[..split_at];
    let remainder = stem[split_at..].trim_start_matches(|c: char| !c.is_alphanumeric());
    if prefix.is_empty() || remainder.is_empty() {
        return None;
    }
    Some(ClassificationResult::new(
        &title_case(prefix),
        Strategy::Delimiter,
        Some(0.80),
    ))
}

fn by_learned(
    filename: &str,
    ctx: &ClassifyContext<'_>,
    min_confidence: f64,
) -> Option<ClassificationResult> {
    let (pattern, confidence) = ctx.learned?.predict(filename)?;
    if confidence < min_confidence {
        return None;
    }
    Some(ClassificationResult::new(
        &pattern.folder,
        Strategy::Learned,
        Some(confidence),
    ))
}

fn by_date(ctx: &ClassifyContext<'_>, granularity: DateGranularity) -> Option<ClassificationResult> {
    let modified = ctx.modified?.with_timezone(&Local);
    let folder = match granularity {
        DateGranularity::Year => modified.format("%Y"),
        DateGranularity::Month => modified.format("%Y-%m"),
        DateGranularity::Day => modified.format("%Y-%m-%d"),
    };
    Some(ClassificationResult::new(
        &folder.to_string(),
        Strategy::Date,
        None,
    ))
}

/// Capitalizes each word; words that are already all upper case stay as is.
fn title_case(text: &str) -> String {
    fn push_word(out: &mut String, word: &str) {
        let has_lower = word.chars().any(|c| c.is_lowercase());
        if !has_lower {
            out.push_str(word);
            return;
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(&chars.as_str().to_lowercase());
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut word_start = 0;
    for (idx, c) in text.char_indices() {
        if matches!(c, ' ' | '_' | '-') {
            push_word(&mut out, &text[word_start..idx]);
            out.push(c);
            word_start = idx + c.len_utf8();
        }
    }
    push_word(&mut out, &text[word_start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> ClassifyContext<'static> {
        ClassifyContext::default()
    }

    fn folder(mode: OrganizeMode, filename: &str) -> Option<String> {
        classify(&mode, filename, &ctx()).map(|r| r.folder)
    }

    #[test]
    fn test_extension_mode() {
        assert_eq!(folder(OrganizeMode::Extension, "photo.jpg").as_deref(), Some("JPG"));
        assert_eq!(folder(OrganizeMode::Extension, "a.tar.GZ").as_deref(), Some("GZ"));
        assert_eq!(folder(OrganizeMode::Extension, "README").as_deref(), Some("_NOEXT"));
        assert_eq!(folder(OrganizeMode::Extension, ".bashrc").as_deref(), Some("_NOEXT"));
    }

    #[test]
    fn test_extension_mode_sanitizes_reserved_names() {
        assert_eq!(folder(OrganizeMode::Extension, "x.con").as_deref(), Some("CON_1"));
    }

    #[test]
    fn test_alphabet_mode() {
        assert_eq!(folder(OrganizeMode::Alphabet, "apple.txt").as_deref(), Some("A"));
        assert_eq!(folder(OrganizeMode::Alphabet, "Zebra.txt").as_deref(), Some("Z"));
        assert_eq!(folder(OrganizeMode::Alphabet, "42.txt").as_deref(), Some("0-9"));
        assert_eq!(folder(OrganizeMode::Alphabet, "_draft.txt").as_deref(), Some("!@#$"));
    }

    #[test]
    fn test_camera_tag_mode() {
        assert_eq!(folder(OrganizeMode::CameraTag, "IMG_1234.jpg").as_deref(), Some("IMG"));
        assert_eq!(folder(OrganizeMode::CameraTag, "dscn0042.JPG").as_deref(), Some("DSCN"));
        assert_eq!(folder(OrganizeMode::CameraTag, "DSC-9.jpg").as_deref(), Some("DSC"));
        assert_eq!(folder(OrganizeMode::CameraTag, "trip_IMG7.jpg").as_deref(), Some("IMG"));
        assert_eq!(folder(OrganizeMode::CameraTag, "MYIMG123.jpg"), None);
        assert_eq!(folder(OrganizeMode::CameraTag, "IMGfoo.jpg"), None);
    }

    #[test]
    fn test_sequential_mode() {
        assert_eq!(folder(OrganizeMode::Sequential, "vacation-001.jpg").as_deref(), Some("Vacation"));
        assert_eq!(folder(OrganizeMode::Sequential, "file001.txt").as_deref(), Some("File"));
        assert_eq!(folder(OrganizeMode::Sequential, "IMG_1234.jpg").as_deref(), Some("IMG"));
        assert_eq!(folder(OrganizeMode::Sequential, "031204-0022.jpg").as_deref(), Some("031204"));
        assert_eq!(
            folder(OrganizeMode::Sequential, "summer trip 12 (2).jpg").as_deref(),
            Some("Summer Trip")
        );
    }

    #[test]
    fn test_sequential_mode_requires_counter() {
        assert_eq!(folder(OrganizeMode::Sequential, "vacation.jpg"), None);
        assert_eq!(folder(OrganizeMode::Sequential, "take1.jpg"), None);
        assert_eq!(folder(OrganizeMode::Sequential, "20240101.jpg"), None);
    }

    #[test]
    fn test_delimiter_mode() {
        assert_eq!(
            folder(OrganizeMode::Delimiter, "invoice_acme_march.pdf").as_deref(),
            Some("Invoice")
        );
        assert_eq!(folder(OrganizeMode::Delimiter, "band - live.mp3").as_deref(), Some("Band"));
        assert_eq!(folder(OrganizeMode::Delimiter, "plain.txt"), None);
        assert_eq!(folder(OrganizeMode::Delimiter, "trailing_.txt"), None);
        assert_eq!(folder(OrganizeMode::Delimiter, "_leading.txt"), None);
    }

    #[test]
    fn test_date_mode() {
        let modified = Local
            .with_ymd_and_hms(2024, 3, 15, 10, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        let ctx = ClassifyContext {
            learned: None,
            modified: Some(modified),
        };
        let year = classify(&OrganizeMode::Date(DateGranularity::Year), "a.jpg", &ctx);
        let day = classify(&OrganizeMode::Date(DateGranularity::Day), "a.jpg", &ctx);
        assert_eq!(year.map(|r| r.folder).as_deref(), Some("2024"));
        assert_eq!(day.map(|r| r.folder).as_deref(), Some("2024-03-15"));
        assert_eq!(folder(OrganizeMode::Date(DateGranularity::Month), "a.jpg"), None);
    }

    #[test]
    fn test_date_mode_uses_local_calendar() {
        let late_evening = Local
            .with_ymd_and_hms(2024, 3, 31, 23, 45, 0)
            .unwrap()
            .with_timezone(&Utc);
        let ctx = ClassifyContext {
            learned: None,
            modified: Some(late_evening),
        };
        let month = classify(&OrganizeMode::Date(DateGranularity::Month), "a.jpg", &ctx);
        let day = classify(&OrganizeMode::Date(DateGranularity::Day), "a.jpg", &ctx);
        assert_eq!(month.map(|r| r.folder).as_deref(), Some("2024-03"));
        assert_eq!(day.map(|r| r.folder).as_deref(), Some("2024-03-31"));
    }

    #[test]
    fn test_learned_mode_respects_threshold() {
        let mut patterns = LearnedPatterns::new();
        patterns.learn("report_2023.pdf", "Finance/Reports");
        let ctx = ClassifyContext {
            learned: Some(&patterns),
            modified: None,
        };

        let hit = classify(&OrganizeMode::Learned { min_confidence: 0.5 }, "report_2024.pdf", &ctx)
            .expect("pattern should match");
        assert_eq!(hit.folder, "Finance/Reports");
        assert_eq!(hit.strategy, Strategy::Learned);

        let miss = classify(&OrganizeMode::Learned { min_confidence: 0.9 }, "report_2024.pdf", &ctx);
        assert_eq!(miss, None);
    }

    #[test]
    fn test_composite_prefers_learned_over_camera_tag() {
        let mut patterns = LearnedPatterns::new();
        for _ in 0..5 {
            patterns.learn("IMG_0001.jpg", "Phone");
        }
        let ctx = ClassifyContext {
            learned: Some(&patterns),
            modified: None,
        };
        let mode = OrganizeMode::Composite { min_confidence: 0.8 };

        let result = classify(&mode, "IMG_4321.jpg", &ctx).expect("classified");
        assert_eq!(result.folder, "Phone");
        assert_eq!(result.strategy, Strategy::Learned);
    }

    #[test]
    fn test_composite_falls_through_in_order() {
        let mode = OrganizeMode::Composite {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        };
        let strategy = |name: &str| classify(&mode, name, &ctx()).map(|r| r.strategy);

        assert_eq!(strategy("DSC_0001.jpg"), Some(Strategy::CameraTag));
        assert_eq!(strategy("holiday-07.jpg"), Some(Strategy::Sequential));
        assert_eq!(strategy("invoice_acme.pdf"), Some(Strategy::Delimiter));
        assert_eq!(strategy("notes.txt"), Some(Strategy::Extension));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let mode = OrganizeMode::Composite { min_confidence: 0.5 };
        let first = classify(&mode, "Trip_Paris-0042.jpg", &ctx());
        for _ in 0..10 {
            assert_eq!(classify(&mode, "Trip_Paris-0042.jpg", &ctx()), first);
        }
    }

    #[test]
    fn test_mode_names_round_trip() {
        for name in [
            "extension",
            "alphabet",
            "camera-tag",
            "sequential",
            "delimiter",
            "learned",
            "date-year",
            "date-month",
            "date-day",
            "composite",
        ] {
            let mode = OrganizeMode::parse(name, 0.5).expect("known mode");
            assert_eq!(mode.name(), name);
        }
        assert_eq!(OrganizeMode::parse("bogus", 0.5), None);
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("summer trip"), "Summer Trip");
        assert_eq!(title_case("NYC_trip"), "NYC_Trip");
        assert_eq!(title_case("mIxEd"), "Mixed");
    }
}
