use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use defect_miner::cache::store::CommitCache;
use defect_miner::cli::{CacheAction, Cli, Commands};
use defect_miner::config::{Config, ConfigService};
use defect_miner::doctor;
use defect_miner::engine::analyzer::JavaAnalyzer;
use defect_miner::engine::git::GitCli;
use defect_miner::engine::lint::RuleLinter;
use defect_miner::engine::pipeline::{self, Pipeline};
use defect_miner::error::MinerError;
use defect_miner::models::release::{Release, ReleaseSummary};
use defect_miner::output::CsvDatasetWriter;
use defect_miner::tracker::{IssueTracker, JiraExportSource};

#[cfg(not(feature = "dhat-heap"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        let (code, message) = classify_error(&e);
        let error = serde_json::json!({
            "error": { "code": code, "message": message }
        });
        println!("{error}");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn classify_error(e: &anyhow::Error) -> (String, String) {
    if let Some(me) = e.downcast_ref::<MinerError>() {
        (me.code.to_string(), me.message.clone())
    } else {
        ("IO_ERROR".to_string(), format!("{e:#}"))
    }
}

fn print_json(value: &impl serde::Serialize, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{output}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

fn run(cli: Cli) -> Result<()> {
    let pretty = cli.pretty;

    let mut config = ConfigService::load(cli.config.as_deref())?;
    if cli.debug {
        config.debug = true;
    }
    if !matches!(cli.command, Commands::Init { .. }) {
        defect_miner::logger::init(&config)?;
    }

    match cli.command {
        Commands::Init { path } => {
            let config_path = match path {
                Some(p) => {
                    ConfigService::generate_at(&p)?;
                    p
                }
                None => {
                    ConfigService::generate_default()?;
                    ConfigService::default_path()
                }
            };
            print_json(
                &serde_json::json!({ "config": config_path.display().to_string() }),
                pretty,
            )
        }
        Commands::Doctor => print_json(&doctor::run_doctor(&config), pretty),
        Commands::Releases { repo, tracker } => cmd_releases(&config, &repo, &tracker, pretty),
        Commands::Mine {
            project,
            repo,
            tracker,
            output,
        } => {
            if let Some(dir) = output {
                config.output_dir = dir;
            }
            cmd_mine(config, &project, &repo, &tracker, pretty)
        }
        Commands::Cache { action } => cmd_cache(&config, action, pretty),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_mine(
    config: Config,
    project: &str,
    repo: &std::path::Path,
    tracker_dir: &std::path::Path,
    pretty: bool,
) -> Result<()> {
    let vcs = Arc::new(GitCli::open(repo)?);
    let tracker = IssueTracker::new(JiraExportSource::open(tracker_dir)?, &config.tracker);
    let linter = RuleLinter::new(config.analysis.rules_dir.as_deref())?;
    let sink = CsvDatasetWriter::new(&config.output_dir, project);

    let pipeline = Pipeline::new(
        project,
        config,
        vcs,
        Arc::new(JavaAnalyzer),
        Arc::new(linter),
        Box::new(sink),
    )?;
    let report = pipeline.run(&tracker)?;
    print_json(&report, pretty)
}

fn cmd_releases(
    config: &Config,
    repo: &std::path::Path,
    tracker_dir: &std::path::Path,
    pretty: bool,
) -> Result<()> {
    let vcs = GitCli::open(repo)?;
    let tracker = IssueTracker::new(JiraExportSource::open(tracker_dir)?, &config.tracker);
    let releases = pipeline::plan_releases(&tracker, &vcs)?;
    let summaries: Vec<ReleaseSummary> = releases.iter().map(Release::summary).collect();
    print_json(&summaries, pretty)
}

fn cmd_cache(config: &Config, action: CacheAction, pretty: bool) -> Result<()> {
    match action {
        CacheAction::Stats { project } => {
            let cache = CommitCache::open(&config.cache_dir, &project, (&config.cache).into())?;
            print_json(&cache.stats()?, pretty)
        }
        CacheAction::Resize { project, max_mb } => {
            let mut cache_config = config.cache.clone();
            if let Some(mb) = max_mb {
                cache_config.max_shard_mb = mb;
            }
            let cache = CommitCache::open(&config.cache_dir, &project, (&cache_config).into())?;
            print_json(&cache.resize()?, pretty)
        }
    }
}
