//! Organizer configuration.
//!
//! Configuration is stored in TOML. Every key is optional:
//!
//! ```toml
//! max_files_per_folder = 0            # 0 = unlimited
//! duplicate_detection_method = "size_only"   # or "hash"
//! skip_folders = ["Sort", ".git", "node_modules", "__pycache__", "tmp*"]
//! batch_size = 1000                   # progress report granularity
//! learned_confidence_threshold = 0.5
//!
//! [recent_directories]
//! source = ["/home/me/Downloads"]
//! target = ["/home/me/Sorted"]
//!
//! [filters]
//! enable_hidden_files = false
//!
//! [filters.exclude]
//! filenames = [".DS_Store", "Thumbs.db"]
//! patterns = ["*.tmp"]
//! extensions = ["part", "crdownload"]
//! regex = []
//!
//! [filters.include]
//! patterns = []
//! ```
//!
//! Folder names starting with `#` are never entered, whatever the
//! configuration says.

use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Capacity of each recent-directory list.
pub const RECENT_CAPACITY: usize = 10;

/// Errors that can occur during configuration loading and filtering.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    ConfigNotFound(PathBuf),
    /// Invalid TOML syntax or structure.
    ConfigInvalid(String),
    /// A value is out of its allowed range.
    InvalidValue { key: &'static str, reason: String },
    /// Invalid glob pattern provided.
    InvalidGlobPattern(String),
    /// Invalid regex pattern provided with the actual error reason.
    InvalidRegexPattern {
        /// The regex pattern that failed to compile.
        pattern: String,
        /// The reason why the pattern is invalid.
        reason: String,
    },
    /// IO error while reading or writing configuration.
    IoError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ConfigNotFound(path) => {
                write!(f, "Configuration file not found: {}", path.display())
            }
            ConfigError::ConfigInvalid(msg) => write!(f, "Invalid configuration: {}", msg),
            ConfigError::InvalidValue { key, reason } => {
                write!(f, "Invalid value for '{}': {}", key, reason)
            }
            ConfigError::InvalidGlobPattern(pattern) => {
                write!(f, "Invalid glob pattern '{}'", pattern)
            }
            ConfigError::InvalidRegexPattern { pattern, reason } => {
                write!(f, "Invalid regex pattern '{}': {}", pattern, reason)
            }
            ConfigError::IoError(msg) => write!(f, "IO error accessing configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// How the collision resolver decides that two same-named files have the
/// same content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateDetection {
    /// Equal byte size is enough.
    #[default]
    SizeOnly,
    /// Equal byte size and equal content digest.
    Hash,
}

/// Top-level organizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizerConfig {
    /// Maximum files per destination folder before overflowing; 0 = unlimited.
    #[serde(default)]
    pub max_files_per_folder: usize,

    #[serde(default)]
    pub duplicate_detection_method: DuplicateDetection,

    /// Folder names (or glob patterns such as `tmp*`) never entered.
    #[serde(default = "default_skip_folders")]
    pub skip_folders: Vec<String>,

    /// Number of processed files between progress reports.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Minimum confidence for a learned pattern to be used.
    #[serde(default = "default_confidence_threshold")]
    pub learned_confidence_threshold: f64,

    #[serde(default)]
    pub recent_directories: RecentDirectories,

    #[serde(default)]
    pub filters: FilterRules,
}

fn default_skip_folders() -> Vec<String> {
    ["Sort", ".git", "node_modules", "__pycache__"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_batch_size() -> usize {
    1000
}

fn default_confidence_threshold() -> f64 {
    crate::classifier::DEFAULT_MIN_CONFIDENCE
}

impl Default for OrganizerConfig {
    fn default() -> Self {
        Self {
            max_files_per_folder: 0,
            duplicate_detection_method: DuplicateDetection::default(),
            skip_folders: default_skip_folders(),
            batch_size: default_batch_size(),
            learned_confidence_threshold: default_confidence_threshold(),
            recent_directories: RecentDirectories::default(),
            filters: FilterRules::default(),
        }
    }
}

impl OrganizerConfig {
    /// Load configuration from a file, with fallback to defaults.
    ///
    /// Attempts to load configuration in the following order:
    /// 1. If `config_path` is provided, load from that file
    /// 2. Look for `.refile.toml` in the current directory
    /// 3. Look for `~/.config/refile/config.toml` in home directory
    /// 4. Fall back to default configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is explicitly provided but
    /// cannot be read, or if any file found is invalid.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::locate(config_path) {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// The file [`OrganizerConfig::load`] would read, or `None` when the
    /// defaults apply.
    pub fn locate(config_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = config_path {
            return Some(path.to_path_buf());
        }

        let local_config = PathBuf::from(".refile.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        Self::user_config_path().filter(|home_config| home_config.exists())
    }

    /// `~/.config/refile/config.toml`, if `HOME` is set.
    pub fn user_config_path() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("refile")
                .join("config.toml")
        })
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ConfigNotFound` if file does not exist.
    /// Returns `ConfigError::ConfigInvalid` if TOML parsing fails.
    /// Returns `ConfigError::InvalidValue` if a value is out of range.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration back as TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ConfigInvalid(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }
        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Replaces only the `[recent_directories]` table of an existing file.
    ///
    /// Every other key in the file is left as written.
    pub fn save_recent_directories(
        path: &Path,
        recent: &RecentDirectories,
    ) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let mut table: toml::Table =
            toml::from_str(&content).map_err(|e| ConfigError::ConfigInvalid(e.to_string()))?;
        let value =
            toml::Value::try_from(recent).map_err(|e| ConfigError::ConfigInvalid(e.to_string()))?;
        table.insert("recent_directories".to_string(), value);

        let content =
            toml::to_string_pretty(&table).map_err(|e| ConfigError::ConfigInvalid(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Checks value ranges that TOML typing cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.learned_confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "learned_confidence_threshold",
                reason: format!("{} is outside [0, 1]", self.learned_confidence_threshold),
            });
        }
        Ok(())
    }

    /// Compile skip folders and file filters into matchers.
    ///
    /// # Errors
    ///
    /// Returns an error if any regex or glob patterns are invalid.
    pub fn compile(&self) -> Result<CompiledFilters, ConfigError> {
        CompiledFilters::new(&self.skip_folders, self.filters.clone())
    }
}

/// Most-recent-first, de-duplicated lists of used directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentDirectories {
    #[serde(default)]
    pub source: Vec<String>,
    #[serde(default)]
    pub target: Vec<String>,
}

impl RecentDirectories {
    pub fn remember_source(&mut self, path: &Path) {
        Self::remember(&mut self.source, path);
    }

    pub fn remember_target(&mut self, path: &Path) {
        Self::remember(&mut self.target, path);
    }

    fn remember(list: &mut Vec<String>, path: &Path) {
        let entry = path.to_string_lossy().to_string();
        list.retain(|existing| existing != &entry);
        list.insert(0, entry);
        list.truncate(RECENT_CAPACITY);
    }
}

/// File filter rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRules {
    /// Whether to include hidden files (starting with "."). Defaults to false.
    #[serde(default)]
    pub enable_hidden_files: bool,

    /// Rules for excluding files.
    #[serde(default)]
    pub exclude: ExcludeRules,

    /// Rules for including files (whitelist, overrides exclude rules).
    #[serde(default)]
    pub include: IncludeRules,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            enable_hidden_files: false,
            exclude: ExcludeRules::default(),
            include: IncludeRules::default(),
        }
    }
}

/// Rules for excluding files from organization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExcludeRules {
    /// Exact filenames to exclude (e.g., ".DS_Store", "Thumbs.db").
    #[serde(default)]
    pub filenames: Vec<String>,

    /// Glob patterns to exclude (e.g., "*.tmp").
    #[serde(default)]
    pub patterns: Vec<String>,

    /// File extensions to exclude (e.g., "part", "tmp").
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Regex patterns matched against the file name.
    #[serde(default)]
    pub regex: Vec<String>,
}

/// Rules for including files, overriding exclude rules (whitelist).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncludeRules {
    /// Glob patterns that override exclude rules.
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Compiled matchers for skip folders and file filters.
#[derive(Debug, Clone)]
pub struct CompiledFilters {
    skip_folders: Vec<Pattern>,
    enable_hidden_files: bool,
    exclude_filenames: HashSet<String>,
    exclude_extensions: HashSet<String>,
    exclude_patterns: Vec<Pattern>,
    exclude_regexes: Vec<Regex>,
    include_patterns: Vec<Pattern>,
}

fn compile_globs(patterns: &[String]) -> Result<Vec<Pattern>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|_| ConfigError::InvalidGlobPattern(pattern.clone()))
        })
        .collect()
}

impl CompiledFilters {
    fn new(skip_folders: &[String], rules: FilterRules) -> Result<Self, ConfigError> {
        let exclude_regexes = rules
            .exclude
            .regex
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::InvalidRegexPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            skip_folders: compile_globs(skip_folders)?,
            enable_hidden_files: rules.enable_hidden_files,
            exclude_filenames: rules.exclude.filenames.into_iter().collect(),
            exclude_extensions: rules
                .exclude
                .extensions
                .iter()
                .map(|ext| ext.to_lowercase())
                .collect(),
            exclude_patterns: compile_globs(&rules.exclude.patterns)?,
            exclude_regexes,
            include_patterns: compile_globs(&rules.include.patterns)?,
        })
    }

    /// Whether enumeration must not descend into a folder with this name.
    pub fn should_skip_folder(&self, folder_name: &str) -> bool {
        if folder_name.starts_with('#') {
            return true;
        }
        self.skip_folders
            .iter()
            .any(|pattern| pattern.matches(folder_name))
    }

    /// Check if a file should be organized (not excluded).
    ///
    /// Checks are performed in this order, with early termination:
    /// 1. Include patterns (whitelist) - if matched, always include
    /// 2. Hidden file filter - if hidden and disabled, exclude
    /// 3. Exact filename match - if matched, exclude
    /// 4. File extension match - if matched, exclude
    /// 5. Glob pattern match - if matched, exclude
    /// 6. Regex pattern match - if matched, exclude
    /// 7. Default: include
    pub fn should_include(&self, file_path: &Path) -> bool {
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();

        if self
            .include_patterns
            .iter()
            .any(|pattern| pattern.matches_path(file_path) || pattern.matches(&file_name))
        {
            return true;
        }

        if !self.enable_hidden_files && file_name.starts_with('.') {
            return false;
        }

        if self.exclude_filenames.contains(file_name.as_ref()) {
            return false;
        }

        if let Some(ext) = file_path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            if self.exclude_extensions.contains(&ext_lower) {
                return false;
            }
        }

        if self
            .exclude_patterns
            .iter()
            .any(|pattern| pattern.matches_path(file_path) || pattern.matches(&file_name))
        {
            return false;
        }

        !self
            .exclude_regexes
            .iter()
            .any(|regex| regex.is_match(&file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn compiled(rules: FilterRules) -> CompiledFilters {
        OrganizerConfig {
            filters: rules,
            ..OrganizerConfig::default()
        }
        .compile()
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = OrganizerConfig::default();
        assert_eq!(config.max_files_per_folder, 0);
        assert_eq!(config.duplicate_detection_method, DuplicateDetection::SizeOnly);
        assert_eq!(config.batch_size, 1000);
        assert!(config.skip_folders.contains(&"Sort".to_string()));
        assert!(!config.filters.enable_hidden_files);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: OrganizerConfig = toml::from_str(
            r#"
            duplicate_detection_method = "hash"
            max_files_per_folder = 200

            [recent_directories]
            source = ["/a"]
            "#,
        )
        .unwrap();

        assert_eq!(config.duplicate_detection_method, DuplicateDetection::Hash);
        assert_eq!(config.max_files_per_folder, 200);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.recent_directories.source, vec!["/a".to_string()]);
        assert!(config.recent_directories.target.is_empty());
    }

    #[test]
    fn test_rejects_unknown_detection_method() {
        let result: Result<OrganizerConfig, _> =
            toml::from_str(r#"duplicate_detection_method = "md5""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let path = temp.path().join("config.toml");
        fs::write(&path, "batch_size = 0\n").expect("Failed to write config");

        let result = OrganizerConfig::load(Some(&path));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                key: "batch_size",
                ..
            })
        ));
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let result = OrganizerConfig::load(Some(&temp.path().join("nope.toml")));
        assert!(matches!(result, Err(ConfigError::ConfigNotFound(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let path = temp.path().join("nested").join("config.toml");

        let mut config = OrganizerConfig::default();
        config.recent_directories.remember_target(Path::new("/sorted"));
        config.save(&path).expect("Failed to save config");

        let loaded = OrganizerConfig::load(Some(&path)).expect("Failed to load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_save_recent_directories_keeps_other_settings() {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let path = temp.path().join(".refile.toml");
        fs::write(&path, "max_files_per_folder = 7\n\n[filters]\nenable_hidden_files = true\n")
            .expect("Failed to write config");

        let mut recent = RecentDirectories::default();
        recent.remember_source(Path::new("/inbox"));
        recent.remember_target(Path::new("/sorted"));
        OrganizerConfig::save_recent_directories(&path, &recent).expect("Failed to save");

        let content = fs::read_to_string(&path).expect("Failed to read config");
        assert!(!content.contains("batch_size"));
        assert!(!content.contains("skip_folders"));

        let loaded = OrganizerConfig::load(Some(&path)).expect("Failed to load config");
        assert_eq!(loaded.max_files_per_folder, 7);
        assert!(loaded.filters.enable_hidden_files);
        assert_eq!(loaded.recent_directories, recent);
    }

    #[test]
    fn test_save_recent_directories_requires_existing_file() {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let path = temp.path().join("missing.toml");

        let result = OrganizerConfig::save_recent_directories(&path, &RecentDirectories::default());
        assert!(matches!(result, Err(ConfigError::IoError(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_locate_prefers_explicit_path() {
        let explicit = Path::new("/etc/refile/custom.toml");
        assert_eq!(
            OrganizerConfig::locate(Some(explicit)),
            Some(explicit.to_path_buf())
        );
    }

    #[test]
    fn test_recent_directories_are_bounded_and_deduplicated() {
        let mut recent = RecentDirectories::default();
        for i in 0..15 {
            recent.remember_source(Path::new(&format!("/dir{}", i)));
        }
        recent.remember_source(Path::new("/dir10"));

        assert_eq!(recent.source.len(), RECENT_CAPACITY);
        assert_eq!(recent.source[0], "/dir10");
        assert_eq!(recent.source[1], "/dir14");
        assert_eq!(
            recent.source.iter().filter(|d| d.as_str() == "/dir10").count(),
            1
        );
    }

    #[test]
    fn test_skip_folders() {
        let filters = OrganizerConfig {
            skip_folders: vec!["Sort".to_string(), "tmp*".to_string()],
            ..OrganizerConfig::default()
        }
        .compile()
        .unwrap();

        assert!(filters.should_skip_folder("Sort"));
        assert!(filters.should_skip_folder("tmp_build"));
        assert!(filters.should_skip_folder("#Archive"));
        assert!(filters.should_skip_folder("# Sorting"));
        assert!(!filters.should_skip_folder("Sorted"));
        assert!(!filters.should_skip_folder("Photos"));
    }

    #[test]
    fn test_hidden_file_excluded_by_default() {
        let compiled = compiled(FilterRules::default());
        assert!(!compiled.should_include(Path::new(".DS_Store")));
        assert!(compiled.should_include(Path::new("photo.jpg")));
    }

    #[test]
    fn test_exclude_rules() {
        let compiled = compiled(FilterRules {
            enable_hidden_files: true,
            exclude: ExcludeRules {
                filenames: vec!["Thumbs.db".to_string()],
                patterns: vec!["*.cache".to_string()],
                extensions: vec!["part".to_string()],
                regex: vec![r"^~\$".to_string()],
            },
            include: IncludeRules::default(),
        });

        assert!(!compiled.should_include(Path::new("/x/Thumbs.db")));
        assert!(!compiled.should_include(Path::new("/x/data.cache")));
        assert!(!compiled.should_include(Path::new("/x/movie.PART")));
        assert!(!compiled.should_include(Path::new("/x/~$report.docx")));
        assert!(compiled.should_include(Path::new("/x/report.docx")));
    }

    #[test]
    fn test_include_overrides_exclude() {
        let compiled = compiled(FilterRules {
            enable_hidden_files: false,
            exclude: ExcludeRules::default(),
            include: IncludeRules {
                patterns: vec![".important".to_string()],
            },
        });

        assert!(compiled.should_include(Path::new(".important")));
        assert!(!compiled.should_include(Path::new(".other")));
    }

    #[test]
    fn test_invalid_patterns_return_error() {
        let config = OrganizerConfig {
            skip_folders: vec!["[invalid".to_string()],
            ..OrganizerConfig::default()
        };
        assert!(matches!(
            config.compile(),
            Err(ConfigError::InvalidGlobPattern(_))
        ));

        let mut config = OrganizerConfig::default();
        config.filters.exclude.regex = vec!["[invalid(".to_string()];
        assert!(matches!(
            config.compile(),
            Err(ConfigError::InvalidRegexPattern { .. })
        ));
    }
}
