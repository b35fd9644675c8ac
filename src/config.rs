//! Configuration loading and generation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enable debug logging to file
    pub debug: bool,

    /// Path to log directory
    pub log_path: PathBuf,

    /// Days a rotated log file is kept
    pub log_keep_days: u32,

    /// Directory holding the commit cache shards
    pub cache_dir: PathBuf,

    /// Directory receiving the CSV datasets
    pub output_dir: PathBuf,

    /// Scratch directory for exported snapshots, backups and side files
    pub work_dir: PathBuf,

    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    pub snapshot: SnapshotConfig,
    pub cache: CacheConfig,
    pub tracker: TrackerConfig,
    pub analysis: AnalysisConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            log_path: default_log_path(),
            log_keep_days: 3,
            cache_dir: default_cache_dir(),
            output_dir: PathBuf::from("datasets"),
            work_dir: std::env::temp_dir().join("defect-miner"),
            pipeline: PipelineConfig::default(),
            scheduler: SchedulerConfig::default(),
            snapshot: SnapshotConfig::default(),
            cache: CacheConfig::default(),
            tracker: TrackerConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

/// Release splitting and label estimation knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fraction of releases (oldest first) that receive datasets
    pub split_ratio: f64,
    /// Most recent commits kept per dataset window
    pub max_commits_per_release: usize,
    /// Proportion used while too few tickets report an injection version
    pub cold_start_proportion: f64,
    /// Reported-IV tickets needed before the empirical proportion is trusted
    pub min_proportion_tickets: usize,
    /// Tickets with commits needed for the run to proceed
    pub min_tickets: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            split_ratio: 0.33,
            max_commits_per_release: 10_000,
            cold_start_proportion: 2.15,
            min_proportion_tickets: 5,
            min_tickets: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub thread_cap: usize,
    pub error_threshold: usize,
    pub max_attempts: usize,
    pub memory_per_worker_mb: u64,
    /// Overrides the detected available memory when set
    pub memory_budget_mb: Option<u64>,
    pub log_every: usize,
    pub persist_every: usize,
    pub emit_every: usize,
    pub restore_pause_ms: u64,
    pub batch_pause_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            thread_cap: 3,
            error_threshold: 5,
            max_attempts: 3,
            memory_per_worker_mb: 512,
            memory_budget_mb: None,
            log_every: 10,
            persist_every: 20,
            emit_every: 100,
            restore_pause_ms: 2000,
            batch_pause_ms: 1000,
        }
    }
}

/// How commit snapshots are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Read blobs from the object store into a per-commit directory
    Isolated,
    /// Check out into the shared working tree under a lock
    Worktree,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub mode: SnapshotMode,
    /// Files exported per commit before the rest is carried over
    pub export_cap: usize,
    /// Tracked files deleted by the last checkout tier
    pub problematic_paths: Vec<String>,
    pub delete_retries: u32,
    pub delete_retry_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            mode: SnapshotMode::Isolated,
            export_cap: 200,
            problematic_paths: Vec::new(),
            delete_retries: 5,
            delete_retry_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_shard_mb: u64,
    pub chunk_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_shard_mb: 90,
            chunk_size: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub page_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 10_000,
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Package segments that keep their module prefix during class matching
    pub module_markers: Vec<String>,
    /// Extra YAML lint rules
    pub rules_dir: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            module_markers: vec!["benchmark".to_string()],
            rules_dir: None,
        }
    }
}

fn config_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("defect-miner")
}

/// Default log path: ~/.config/defect-miner/logs
fn default_log_path() -> PathBuf {
    config_root().join("logs")
}

/// Default cache path: <os cache dir>/defect-miner
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("defect-miner")
}

/// Configuration service.
pub struct ConfigService;

impl ConfigService {
    /// Get the default configuration file path.
    pub fn default_path() -> PathBuf {
        config_root().join("config.toml")
    }

    /// Load configuration from file.
    ///
    /// If `path` is `None`, uses the default path.
    /// If the file doesn't exist, returns default configuration.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);
        let config_dir = path.parent();

        if !path.exists() {
            let mut config = Config::default();
            if let Some(dir) = config_dir {
                config.log_path = dir.join("logs");
            }
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        // log_path 未指定なら設定ファイルと同じディレクトリの logs を使う
        if config.log_path == default_log_path()
            && let Some(dir) = config_dir
        {
            config.log_path = dir.join("logs");
        }

        Ok(config)
    }

    /// Generate default configuration file at the default path.
    pub fn generate_default() -> Result<()> {
        Self::generate_at(&Self::default_path())
    }

    /// Generate default configuration file at the specified path.
    pub fn generate_at(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = Self::default_config_content();
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Generate default configuration content with comments.
    fn default_config_content() -> String {
        r#"# defect-miner configuration file

# Enable debug logging to file (default: false)
debug = false

# Path to log directory (default: ~/.config/defect-miner/logs)
# log_path = "~/.config/defect-miner/logs"

# Days rotated log files are kept
log_keep_days = 3

# Commit cache shards (default: <os cache dir>/defect-miner)
# cache_dir = "~/.cache/defect-miner"

# CSV datasets
output_dir = "datasets"

# Scratch space for snapshots and backups (default: <tmp>/defect-miner)
# work_dir = "/tmp/defect-miner"

[pipeline]
split_ratio = 0.33
max_commits_per_release = 10000
cold_start_proportion = 2.15
min_proportion_tickets = 5
min_tickets = 5

[scheduler]
batch_size = 100
thread_cap = 3
error_threshold = 5
max_attempts = 3
memory_per_worker_mb = 512
# memory_budget_mb = 8192
log_every = 10
persist_every = 20
emit_every = 100
restore_pause_ms = 2000
batch_pause_ms = 1000

[snapshot]
# "isolated" reads blobs per commit, "worktree" checks out the shared repository
mode = "isolated"
export_cap = 200
problematic_paths = []
delete_retries = 5
delete_retry_ms = 1000

[cache]
max_shard_mb = 90
chunk_size = 50

[tracker]
max_retries = 5
retry_delay_ms = 10000
page_size = 1000

[analysis]
module_markers = ["benchmark"]
# rules_dir = "~/.config/defect-miner/rules"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = ConfigService::default_path();
        assert!(path.ends_with("defect-miner/config.toml"));
    }

    #[test]
    fn test_generate_at_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("nested").join("dir").join("config.toml");

        ConfigService::generate_at(&config_path).unwrap();

        assert!(config_path.exists());
        let content = fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("debug = false"));
        assert!(content.contains("[scheduler]"));
    }

    #[test]
    fn test_load_returns_defaults_when_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("nonexistent.toml");

        let config = ConfigService::load(Some(&config_path)).unwrap();

        assert!(!config_path.exists());
        assert!(!config.debug);
        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.scheduler.error_threshold, 5);
        assert_eq!(config.cache.max_shard_mb, 90);
        assert_eq!(config.snapshot.mode, SnapshotMode::Isolated);
        assert_eq!(config.log_path, dir.path().join("logs"));
    }

    #[test]
    fn test_generated_content_round_trips_to_defaults() {
        let content = ConfigService::default_config_content();
        let config: Config = toml::from_str(&content).unwrap();
        let defaults = Config::default();
        assert_eq!(config.scheduler.batch_size, defaults.scheduler.batch_size);
        assert_eq!(config.pipeline.split_ratio, defaults.pipeline.split_ratio);
        assert_eq!(config.tracker.max_retries, defaults.tracker.max_retries);
        assert_eq!(config.analysis.module_markers, defaults.analysis.module_markers);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(
            &config_path,
            "[scheduler]\nthread_cap = 8\n\n[snapshot]\nmode = \"worktree\"\n",
        )
        .unwrap();

        let config = ConfigService::load(Some(&config_path)).unwrap();
        assert_eq!(config.scheduler.thread_cap, 8);
        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.snapshot.mode, SnapshotMode::Worktree);
        assert_eq!(config.snapshot.export_cap, 200);
    }

    #[test]
    fn test_load_invalid_toml_returns_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("bad.toml");

        fs::write(&config_path, "not valid [[[").unwrap();

        assert!(ConfigService::load(Some(&config_path)).is_err());
    }

    #[test]
    fn test_load_custom_log_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(
            &config_path,
            "debug = true\nlog_path = \"/tmp/defect-logs\"\n",
        )
        .unwrap();

        let config = ConfigService::load(Some(&config_path)).unwrap();
        assert!(config.debug);
        assert_eq!(config.log_path, PathBuf::from("/tmp/defect-logs"));
    }
}
