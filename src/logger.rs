//! File logging for mining runs.
//!
//! One file per local day under `log_path`, named `defect-miner.YYYY-MM-DD`.
//! stdout is reserved for JSON, so nothing is logged to the terminal.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use logroller::{LogRollerBuilder, Rotation, RotationAge, TimeZone};
use time::macros::format_description;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::prelude::*;

use crate::config::Config;

const LOG_PREFIX: &str = "defect-miner";

/// Dependency targets that are noisy at debug level.
const QUIET_TARGETS: &[&str] = &["ignore=warn", "globset=warn"];

/// Install the global subscriber. `RUST_LOG` wins over `debug`.
pub fn init(config: &Config) -> Result<()> {
    fs::create_dir_all(&config.log_path)
        .with_context(|| format!("Failed to create log dir: {}", config.log_path.display()))?;
    let removed = cleanup_old_logs(&config.log_path, config.log_keep_days)?;

    let appender = LogRollerBuilder::new(config.log_path.as_path(), Path::new(LOG_PREFIX))
        .rotation(Rotation::AgeBased(RotationAge::Daily))
        .time_zone(TimeZone::Local)
        .max_keep_files(31)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create log roller: {}", e))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let time_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(config.debug))
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_timer(OffsetTime::new(offset, time_format)),
        );
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set global subscriber: {}", e))?;

    // 非同期ライターはプロセス終了まで生かしておく
    std::mem::forget(guard);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        removed_logs = removed,
        "Logging started"
    );
    Ok(())
}

fn env_filter(debug: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if debug { "debug" } else { "info" };
    let directives = std::iter::once(level)
        .chain(QUIET_TARGETS.iter().copied())
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::new(directives)
}

/// Delete our log files last modified more than `keep_days` ago.
///
/// Returns how many were removed. Other files and directories are left alone.
pub fn cleanup_old_logs(log_path: &Path, keep_days: u32) -> Result<usize> {
    let Ok(entries) = fs::read_dir(log_path) else {
        return Ok(0);
    };
    let keep = Duration::from_secs(u64::from(keep_days) * 24 * 60 * 60);
    let cutoff = SystemTime::now()
        .checked_sub(keep)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(LOG_PREFIX));
        if !ours || !path.is_file() {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified())
            && modified < cutoff
            && fs::remove_file(&path).is_ok()
        {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn write_aged(path: &Path, age: Duration) {
        fs::write(path, "log").unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_cleanup_removes_only_expired_logs() {
        let dir = tempfile::TempDir::new().unwrap();
        let old = dir.path().join("defect-miner.2020-01-01");
        let recent = dir.path().join("defect-miner.2026-02-28");
        write_aged(&old, DAY * 4);
        write_aged(&recent, DAY);

        assert_eq!(cleanup_old_logs(dir.path(), 3).unwrap(), 1);
        assert!(!old.exists());
        assert!(recent.exists());
    }

    #[test]
    fn test_cleanup_respects_keep_days() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("defect-miner.2026-01-01");
        write_aged(&log, DAY * 4);

        assert_eq!(cleanup_old_logs(dir.path(), 7).unwrap(), 0);
        assert!(log.exists());
        assert_eq!(cleanup_old_logs(dir.path(), 0).unwrap(), 1);
    }

    #[test]
    fn test_cleanup_leaves_foreign_files_and_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let other = dir.path().join("other-app.log");
        write_aged(&other, DAY * 10);
        let subdir = dir.path().join("defect-miner.subdir");
        fs::create_dir(&subdir).unwrap();

        assert_eq!(cleanup_old_logs(dir.path(), 3).unwrap(), 0);
        assert!(other.exists());
        assert!(subdir.is_dir());
    }

    #[test]
    fn test_cleanup_missing_dir_is_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(cleanup_old_logs(&missing, 3).unwrap(), 0);
    }
}
