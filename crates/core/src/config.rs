//! Partition configuration via `partstate.toml`
//!
//! A partition reads its settings from a TOML file in the data directory.
//! Every field except `data_dir` has a default; the runtime, snapshots and
//! log directories default to subdirectories of `data_dir`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Config file name placed in the partition data directory.
pub const CONFIG_FILE_NAME: &str = "partstate.toml";

/// Partition configuration.
///
/// # Example
///
/// ```toml
/// data_dir = "/var/lib/partstate/partition-0"
/// max_snapshots = 3
/// snapshot_period_ms = 900000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Root directory for all partition state.
    pub data_dir: PathBuf,
    /// Live database directory (default: `<data_dir>/runtime`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,
    /// Snapshot root (default: `<data_dir>/snapshots`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots_dir: Option<PathBuf>,
    /// Log segment directory (default: `<data_dir>/log`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Maximum number of valid snapshots kept by retention (>= 1).
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Period of the snapshot director, in milliseconds.
    #[serde(default = "default_snapshot_period_ms")]
    pub snapshot_period_ms: u64,
    /// Worker threads of the actor scheduler.
    #[serde(default = "default_scheduler_threads")]
    pub scheduler_threads: usize,
    /// Log segment rotation size in bytes.
    #[serde(default = "default_log_segment_size")]
    pub log_segment_size: u64,
    /// Maximum size of one state database table file in bytes.
    #[serde(default = "default_table_size_limit")]
    pub table_size_limit: u64,
}

fn default_max_snapshots() -> usize {
    3
}

fn default_snapshot_period_ms() -> u64 {
    15 * 60 * 1000
}

fn default_scheduler_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

fn default_log_segment_size() -> u64 {
    64 * 1024 * 1024
}

fn default_table_size_limit() -> u64 {
    4 * 1024 * 1024
}

/// Smallest accepted log segment size.
const MIN_LOG_SEGMENT_SIZE: u64 = 1024;

/// Smallest accepted table size limit.
const MIN_TABLE_SIZE_LIMIT: u64 = 256;

impl PartitionConfig {
    /// Create a config rooted at `data_dir` with defaults for everything else.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        PartitionConfig {
            data_dir: data_dir.into(),
            runtime_dir: None,
            snapshots_dir: None,
            log_dir: None,
            max_snapshots: default_max_snapshots(),
            snapshot_period_ms: default_snapshot_period_ms(),
            scheduler_threads: default_scheduler_threads(),
            log_segment_size: default_log_segment_size(),
            table_size_limit: default_table_size_limit(),
        }
    }

    /// Create a config for tests: two threads, small segments and tables.
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        PartitionConfig {
            scheduler_threads: 2,
            log_segment_size: 64 * 1024,
            table_size_limit: 4 * 1024,
            ..Self::new(data_dir)
        }
    }

    /// Resolved runtime directory.
    pub fn runtime_directory(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("runtime"))
    }

    /// Resolved snapshots directory.
    pub fn snapshots_directory(&self) -> PathBuf {
        self.snapshots_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("snapshots"))
    }

    /// Resolved log directory.
    pub fn log_directory(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("log"))
    }

    /// Snapshot director period.
    pub fn snapshot_period(&self) -> Duration {
        Duration::from_millis(self.snapshot_period_ms)
    }

    /// Set the retention limit
    pub fn with_max_snapshots(mut self, max_snapshots: usize) -> Self {
        self.max_snapshots = max_snapshots;
        self
    }

    /// Set the snapshot director period
    pub fn with_snapshot_period(mut self, period: Duration) -> Self {
        self.snapshot_period_ms = period.as_millis() as u64;
        self
    }

    /// Set the scheduler thread count
    pub fn with_scheduler_threads(mut self, threads: usize) -> Self {
        self.scheduler_threads = threads;
        self
    }

    /// Override the runtime directory
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    /// Override the snapshots directory
    pub fn with_snapshots_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshots_dir = Some(dir.into());
        self
    }

    /// Override the log directory
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Set the log segment size
    pub fn with_log_segment_size(mut self, size: u64) -> Self {
        self.log_segment_size = size;
        self
    }

    /// Set the table size limit
    pub fn with_table_size_limit(mut self, size: u64) -> Self {
        self.table_size_limit = size;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_snapshots == 0 {
            return Err(ConfigError::InvalidMaxSnapshots(self.max_snapshots));
        }
        if self.scheduler_threads == 0 {
            return Err(ConfigError::InvalidSchedulerThreads(self.scheduler_threads));
        }
        if self.snapshot_period_ms == 0 {
            return Err(ConfigError::InvalidSnapshotPeriod);
        }
        if self.log_segment_size < MIN_LOG_SEGMENT_SIZE {
            return Err(ConfigError::InvalidLogSegmentSize {
                size: self.log_segment_size,
                min: MIN_LOG_SEGMENT_SIZE,
            });
        }
        if self.table_size_limit < MIN_TABLE_SIZE_LIMIT {
            return Err(ConfigError::InvalidTableSizeLimit {
                size: self.table_size_limit,
                min: MIN_TABLE_SIZE_LIMIT,
            });
        }
        if self.runtime_directory() == self.snapshots_directory() {
            return Err(ConfigError::OverlappingDirectories(self.runtime_directory()));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Partition state configuration
#
# Root directory of the partition. runtime/, snapshots/ and log/ are
# created below it unless overridden.
data_dir = "data"

# runtime_dir = "data/runtime"
# snapshots_dir = "data/snapshots"
# log_dir = "data/log"

# Number of valid snapshots kept after pruning (>= 1)
max_snapshots = 3

# Snapshot director period in milliseconds (default: 15 minutes)
snapshot_period_ms = 900000

# Log segment rotation size in bytes (default: 64 MiB)
log_segment_size = 67108864

# Maximum size of one state table file in bytes (default: 4 MiB)
table_size_limit = 4194304
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PartitionConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded partition config");
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading or writing the config file failed
    #[error("Config file I/O failed for '{}': {source}", .path.display())]
    Io {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema
    #[error("Failed to parse config file '{}': {message}", .path.display())]
    Parse {
        /// Config file path
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// Serializing the config failed
    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    /// Retention must keep at least one snapshot
    #[error("max_snapshots must be at least 1, got {0}")]
    InvalidMaxSnapshots(usize),

    /// Scheduler needs at least one worker
    #[error("scheduler_threads must be at least 1, got {0}")]
    InvalidSchedulerThreads(usize),

    /// Snapshot period of zero
    #[error("snapshot_period_ms must be greater than 0")]
    InvalidSnapshotPeriod,

    /// Log segments too small
    #[error("log_segment_size {size} is below the minimum of {min}")]
    InvalidLogSegmentSize {
        /// Configured size
        size: u64,
        /// Minimum size
        min: u64,
    },

    /// Table size limit too small
    #[error("table_size_limit {size} is below the minimum of {min}")]
    InvalidTableSizeLimit {
        /// Configured size
        size: u64,
        /// Minimum size
        min: u64,
    },

    /// Runtime and snapshots directories resolve to the same path
    #[error("runtime and snapshots directories must differ, both are '{}'", .0.display())]
    OverlappingDirectories(PathBuf),
}
