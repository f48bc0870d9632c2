//! Configuration management for live_index
//!
//! Supports loading configuration from TOML files with CLI overrides.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fs::filter::FileNameFilter;
use crate::fs::mirror::MirrorOptions;
use crate::fs::model::WatchTarget;
use crate::index::facade::{IndexOptions, Scheduling};
use crate::index::processor::ProcessorOptions;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub mirror: MirrorConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,
}

/// What to watch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Directories (or files) to watch; a path that is an existing file is watched as a file
    #[serde(default)]
    pub paths: Vec<String>,

    /// Explicit file watch targets
    #[serde(default)]
    pub files: Vec<String>,

    /// Glob patterns a file must match to be observed (empty means all files)
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// Glob patterns excluding files from observation
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

/// Mirror timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Back-off between iterations without work, in milliseconds
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,

    /// How long a just-moved path is not trusted, in milliseconds
    #[serde(default = "default_lag_ms")]
    pub allowable_path_synchronization_lag_ms: u64,

    /// Coalescing window for native change notifications, in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Indexer-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,

    /// Quiet period before a changed file is indexed, in milliseconds
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,

    /// Files at or above this size in bytes are removed from the index (default 64MB)
    #[serde(default = "default_max_file_length")]
    pub max_file_length: u64,

    /// Attempts at reading a file before giving up
    #[serde(default = "default_max_read_attempts")]
    pub max_read_attempts: u32,

    /// Directory for temporary hard links (empty means a directory at the volume root)
    #[serde(default)]
    pub hardlink_directory: String,

    /// Name of the hard link directory created at the volume root
    #[serde(default = "default_hardlink_directory_name")]
    pub hardlink_directory_name: String,

    /// Enable encoding detection for non-UTF-8 text files (default: true).
    /// When enabled, files in encodings like Latin-1, Shift-JIS, UTF-16 etc.
    /// are automatically transcoded to UTF-8 for indexing.
    #[serde(default = "default_true")]
    pub transcode_non_utf8: bool,

    /// "smallest_first" or "arrival_order"
    #[serde(default)]
    pub scheduling: Scheduling,
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ]
}

fn default_idle_delay_ms() -> u64 {
    100
}

fn default_lag_ms() -> u64 {
    400
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_throttle_delay_ms() -> u64 {
    400
}

fn default_max_file_length() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_max_read_attempts() -> u32 {
    3
}

fn default_hardlink_directory_name() -> String {
    ".live_index_links".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            files: Vec::new(),
            include_patterns: Vec::new(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            idle_delay_ms: default_idle_delay_ms(),
            allowable_path_synchronization_lag_ms: default_lag_ms(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            idle_delay_ms: default_idle_delay_ms(),
            throttle_delay_ms: default_throttle_delay_ms(),
            max_file_length: default_max_file_length(),
            max_read_attempts: default_max_read_attempts(),
            hardlink_directory: String::new(),
            hardlink_directory_name: default_hardlink_directory_name(),
            transcode_non_utf8: true,
            scheduling: Scheduling::default(),
        }
    }
}

impl MirrorConfig {
    pub fn options(&self) -> MirrorOptions {
        MirrorOptions {
            idle_delay: Duration::from_millis(self.idle_delay_ms),
            allowable_path_synchronization_lag: Duration::from_millis(
                self.allowable_path_synchronization_lag_ms,
            ),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

impl IndexerConfig {
    pub fn options(&self) -> IndexOptions {
        let hardlink_directory = (!self.hardlink_directory.trim().is_empty())
            .then(|| PathBuf::from(self.hardlink_directory.trim()));

        IndexOptions {
            idle_delay: Duration::from_millis(self.idle_delay_ms),
            throttle_delay: Duration::from_millis(self.throttle_delay_ms),
            scheduling: self.scheduling,
            processor: ProcessorOptions {
                max_file_length: self.max_file_length,
                max_read_attempts: self.max_read_attempts,
                hardlink_directory,
                hardlink_directory_name: self.hardlink_directory_name.clone(),
                transcode_non_utf8: self.transcode_non_utf8,
            },
        }
    }
}

impl WatchConfig {
    pub fn filter(&self) -> Result<FileNameFilter> {
        FileNameFilter::new(&self.include_patterns, &self.exclude_patterns)
    }

    /// Resolve configured paths into watch targets.
    ///
    /// Relative paths are resolved against the current directory. A path in `paths` that is
    /// an existing file becomes a file target; anything else a directory target.
    pub fn targets(&self) -> Result<Vec<WatchTarget>> {
        let current = std::env::current_dir().context("Failed to read current directory")?;
        let absolute = |path: &str| {
            let path = PathBuf::from(path);
            let path = if path.is_absolute() {
                path
            } else {
                current.join(path)
            };
            path.canonicalize().unwrap_or(path)
        };

        let mut targets = Vec::new();
        for path in &self.paths {
            let path = absolute(path);
            let target = if path.is_file() {
                WatchTarget::file(&path)
            } else {
                WatchTarget::directory(&path)
            };
            targets.push(target.with_context(|| format!("Invalid watch path: {}", path.display()))?);
        }
        for path in &self.files {
            let path = absolute(path);
            targets.push(
                WatchTarget::file(&path)
                    .with_context(|| format!("Invalid watch file: {}", path.display()))?,
            );
        }
        Ok(targets)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from default locations
    ///
    /// Search order:
    /// 1. LIVE_INDEX_CONFIG environment variable
    /// 2. ./live_index.toml (current directory)
    /// 3. ~/.config/live_index/config.toml (user config)
    pub fn from_default_locations() -> Result<Option<(Self, PathBuf)>> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("LIVE_INDEX_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                let config = Self::from_file(&path)?;
                return Ok(Some((config, path)));
            }
        }

        // Check current directory
        let local_path = PathBuf::from("live_index.toml");
        if local_path.exists() {
            let config = Self::from_file(&local_path)?;
            return Ok(Some((config, local_path)));
        }

        // Check user config directory
        if let Some(config_dir) = dirs::config_dir() {
            let user_path = config_dir.join("live_index").join("config.toml");
            if user_path.exists() {
                let config = Self::from_file(&user_path)?;
                return Ok(Some((config, user_path)));
            }
        }

        Ok(None)
    }

    /// Reject settings the workers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.mirror.idle_delay_ms == 0 {
            bail!("mirror.idle_delay_ms must be positive");
        }
        if self.indexer.idle_delay_ms == 0 {
            bail!("indexer.idle_delay_ms must be positive");
        }
        if self.mirror.debounce_ms == 0 {
            bail!("mirror.debounce_ms must be positive");
        }
        if self.indexer.max_read_attempts == 0 {
            bail!("indexer.max_read_attempts must be at least 1");
        }
        if self.indexer.max_file_length == 0 {
            bail!("indexer.max_file_length must be positive");
        }
        if self.indexer.hardlink_directory_name.trim().is_empty() {
            bail!("indexer.hardlink_directory_name must not be empty");
        }
        // a rename could otherwise be indexed before its path is trustworthy
        if self.indexer.throttle_delay_ms < self.mirror.allowable_path_synchronization_lag_ms {
            bail!(
                "indexer.throttle_delay_ms ({}) must not be shorter than mirror.allowable_path_synchronization_lag_ms ({})",
                self.indexer.throttle_delay_ms,
                self.mirror.allowable_path_synchronization_lag_ms
            );
        }
        self.watch
            .filter()
            .context("Invalid watch include/exclude patterns")?;
        Ok(())
    }

    /// Generate a template configuration file
    pub fn generate_template() -> String {
        r#"# live_index configuration
# Generated template - customize as needed

[watch]
# Directories to watch and index
# A path that is an existing file is watched as a single file
paths = [
    # "/home/user/notes",
    # "C:/projects/docs",
]

# Individual files to watch
# files = ["/home/user/todo.txt"]

# Glob patterns a file must match to be indexed (empty = all files)
# include_patterns = ["**/*.txt", "**/*.md"]

# Glob patterns excluding files
exclude_patterns = [
    "**/.git/**",
    "**/target/**",
    "**/node_modules/**",
]

[mirror]
# Back-off between idle iterations in milliseconds (must be > 0)
idle_delay_ms = 100

# Grace window in milliseconds during which a just-moved path is not trusted
allowable_path_synchronization_lag_ms = 400

# Coalescing window for native change notifications in milliseconds
debounce_ms = 50

[indexer]
idle_delay_ms = 100

# Quiet period before a changed file is indexed, in milliseconds
# Must not be shorter than mirror.allowable_path_synchronization_lag_ms
throttle_delay_ms = 400

# Files at or above this size are removed from the index (default: 64MB)
max_file_length = 67108864

# Attempts at reading a locked or unreadable file
max_read_attempts = 3

# Directory for temporary hard links used to read files that may be deleted meanwhile
# Empty = "<volume root>/<hardlink_directory_name>"
hardlink_directory = ""
hardlink_directory_name = ".live_index_links"

# Detect and transcode non-UTF-8 text (Latin-1, Shift-JIS, UTF-16, ...)
transcode_non_utf8 = true

# "smallest_first" indexes small files first, "arrival_order" in the order they settled
scheduling = "smallest_first"
"#
        .to_string()
    }

    /// Write template config to the specified path
    pub fn write_template(path: &Path) -> Result<()> {
        let template = Self::generate_template();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }

        std::fs::write(path, template)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Merge CLI overrides into the configuration
    pub fn with_overrides(mut self, extra_paths: Vec<String>) -> Self {
        // Append extra paths from CLI
        self.watch.paths.extend(extra_paths);
        self
    }
}
