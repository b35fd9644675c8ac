use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "defect-miner",
    version,
    about = "Mine git history and issue trackers into per-method bug-prediction datasets"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Pretty-print JSON output (default: compact)
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Path to configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build training and test datasets for every release
    Mine {
        /// Project key, used for cache shard and dataset names
        #[arg(short, long)]
        project: String,

        /// Local git repository
        #[arg(short, long)]
        repo: PathBuf,

        /// Directory holding the tracker export (versions.json, issues.json)
        #[arg(short, long)]
        tracker: PathBuf,

        /// Override the configured output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the commit to release assignment
    Releases {
        /// Local git repository
        #[arg(short, long)]
        repo: PathBuf,

        /// Directory holding the tracker export
        #[arg(short, long)]
        tracker: PathBuf,
    },

    /// Inspect or maintain the commit cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Check the toolchain, grammar, rules and directories
    Doctor,

    /// Generate default configuration file
    Init {
        /// Output path for config file (default: ~/.config/defect-miner/config.toml)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Shard names, sizes and commit counts
    Stats {
        #[arg(short, long)]
        project: String,
    },

    /// Deduplicate and rebalance every shard of a project
    Resize {
        #[arg(short, long)]
        project: String,

        /// Maximum shard size in MB (default: from config)
        #[arg(long)]
        max_mb: Option<u64>,
    },
}
