//! Bounded, batched analysis of uncached commits with a reset circuit breaker.

use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::store::{CommitCache, CommitMethods};
use crate::config::SchedulerConfig;
use crate::engine::snapshot::SnapshotManager;
use crate::error::{ErrorCode, MinerError, code_of};
use crate::models::commit::CommitInfo;

/// Fallback when neither a budget nor `/proc/meminfo` is available.
const DEFAULT_MEMORY_MB: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Running,
    /// Failures are accumulating but the threshold is not crossed yet
    Degraded,
    Resetting,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Resetting => write!(f, "RESETTING"),
        }
    }
}

/// Restore-to-known-good hooks used by a reset.
pub trait Recovery: Send + Sync {
    fn prepare(&self) -> Result<()>;
    /// Must be idempotent.
    fn restore(&self) -> Result<()>;
}

impl Recovery for SnapshotManager {
    fn prepare(&self) -> Result<()> {
        SnapshotManager::prepare(self)
    }

    fn restore(&self) -> Result<()> {
        SnapshotManager::restore(self)
    }
}

/// Receives the periodic partial-result callback.
pub trait PartialSink: Sync {
    fn emit_partial(&self, processed: usize) -> Result<()>;
}

impl PartialSink for () {
    fn emit_partial(&self, _processed: usize) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleSummary {
    pub requested: usize,
    pub already_cached: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub resets: usize,
}

/// Failure counters of one attempt.
#[derive(Default)]
struct Counters {
    batch: AtomicUsize,
    significant: AtomicUsize,
    failed: AtomicUsize,
    tripped: AtomicBool,
}

impl Counters {
    fn reset_batch(&self) {
        self.batch.store(0, Ordering::SeqCst);
    }
}

pub struct BatchScheduler<'a> {
    config: &'a SchedulerConfig,
    cache: &'a CommitCache,
    recovery: &'a dyn Recovery,
    state: SchedulerState,
    restore_pause: Duration,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(
        config: &'a SchedulerConfig,
        cache: &'a CommitCache,
        recovery: &'a dyn Recovery,
    ) -> Self {
        Self {
            config,
            cache,
            recovery,
            state: SchedulerState::Running,
            restore_pause: Duration::from_millis(config.restore_pause_ms),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    fn transition(&mut self, next: SchedulerState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Scheduler state changed");
            self.state = next;
        }
    }

    /// Analyze every commit of `commits` missing from the cache.
    ///
    /// `work` runs once per uncached commit on a per-batch thread pool. Its
    /// failures are counted; crossing the threshold resets the repository
    /// and retries the remainder, up to `max_attempts` attempts. On
    /// exhaustion whatever was analyzed is persisted before the error returns.
    pub fn run<F>(
        &mut self,
        commits: &[CommitInfo],
        work: F,
        partials: &dyn PartialSink,
    ) -> Result<ScheduleSummary>
    where
        F: Fn(&CommitInfo) -> Result<CommitMethods> + Sync,
    {
        let mut summary = ScheduleSummary {
            requested: commits.len(),
            already_cached: commits.iter().filter(|c| self.cache.contains(&c.id)).count(),
            ..Default::default()
        };
        let total_pending = commits.len() - summary.already_cached;
        if total_pending == 0 {
            debug!(commits = commits.len(), "Nothing to analyze");
            return Ok(summary);
        }

        let processed = AtomicUsize::new(0);
        let max_attempts = self.config.max_attempts.max(1);

        self.recovery.prepare()?;
        for attempt in 1..=max_attempts {
            self.transition(SchedulerState::Running);
            let pending: Vec<&CommitInfo> = commits
                .iter()
                .filter(|c| !self.cache.contains(&c.id))
                .collect();
            info!(attempt, pending = pending.len(), "Scheduling commits");

            let counters = Counters::default();
            let completed = self.run_batches(
                &pending,
                &work,
                &counters,
                &processed,
                total_pending,
                partials,
            );
            summary.failed += counters.failed.load(Ordering::SeqCst);

            if completed {
                self.cache.persist()?;
                self.recovery.restore()?;
                summary.analyzed = processed.load(Ordering::SeqCst);
                info!(
                    analyzed = summary.analyzed,
                    failed = summary.failed,
                    resets = summary.resets,
                    "Scheduling finished"
                );
                return Ok(summary);
            }

            self.reset(attempt < max_attempts)?;
            summary.resets += 1;
        }

        summary.analyzed = processed.load(Ordering::SeqCst);
        error!(
            attempts = max_attempts,
            analyzed = summary.analyzed,
            "Giving up after repeated resets"
        );
        bail!(MinerError::new(
            ErrorCode::RetryExhausted,
            format!(
                "Analysis failed after {max_attempts} attempts; {} of {total_pending} commits analyzed",
                summary.analyzed
            ),
        ))
    }

    /// Returns `false` when the failure threshold was crossed.
    fn run_batches<F>(
        &mut self,
        pending: &[&CommitInfo],
        work: &F,
        counters: &Counters,
        processed: &AtomicUsize,
        total: usize,
        partials: &dyn PartialSink,
    ) -> bool
    where
        F: Fn(&CommitInfo) -> Result<CommitMethods> + Sync,
    {
        let batch_size = self.config.batch_size.max(1);
        let batch_count = pending.len().div_ceil(batch_size);

        for (index, batch) in pending.chunks(batch_size).enumerate() {
            let workers = worker_count(self.config);
            info!(
                batch = index + 1,
                of = batch_count,
                commits = batch.len(),
                workers,
                "Starting batch"
            );
            counters.reset_batch();

            let pool = match rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("miner-worker-{i}"))
                .build()
            {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(error = %e, "Could not build worker pool, counting batch as failed");
                    counters.tripped.store(true, Ordering::SeqCst);
                    return false;
                }
            };

            pool.install(|| {
                batch.par_iter().for_each(|commit| {
                    if counters.tripped.load(Ordering::SeqCst) || self.cache.contains(&commit.id) {
                        return;
                    }
                    match run_guarded(work, commit) {
                        Ok(methods) => {
                            self.cache.insert(&commit.id, methods);
                            let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                            self.on_processed(done, total, partials);
                        }
                        Err(e) => self.on_failure(commit, &e, counters),
                    }
                });
            });
            drop(pool);

            if counters.tripped.load(Ordering::SeqCst) {
                return false;
            }
            if counters.failed.load(Ordering::SeqCst) > 0 {
                self.transition(SchedulerState::Degraded);
            }
            if index + 1 < batch_count && self.config.batch_pause_ms > 0 {
                thread::sleep(Duration::from_millis(self.config.batch_pause_ms));
            }
        }
        true
    }

    fn on_processed(&self, done: usize, total: usize, partials: &dyn PartialSink) {
        let cfg = self.config;
        if cfg.log_every > 0 && done % cfg.log_every == 0 {
            info!(processed = done, total, "Progress");
        }
        if cfg.persist_every > 0
            && done % cfg.persist_every == 0
            && let Err(e) = self.cache.persist()
        {
            warn!(error = %e, "Periodic cache save failed");
        }
        if cfg.emit_every > 0
            && done % cfg.emit_every == 0
            && let Err(e) = partials.emit_partial(done)
        {
            warn!(error = %e, "Partial dataset emission failed");
        }
    }

    fn on_failure(&self, commit: &CommitInfo, e: &anyhow::Error, counters: &Counters) {
        counters.failed.fetch_add(1, Ordering::SeqCst);
        let in_batch = counters.batch.fetch_add(1, Ordering::SeqCst) + 1;
        let significant = if is_significant(e) {
            counters.significant.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            counters.significant.load(Ordering::SeqCst)
        };
        warn!(
            commit = commit.short_id(),
            error = %e,
            in_batch,
            significant,
            "Commit analysis failed"
        );

        let threshold = self.config.error_threshold.max(1);
        if (in_batch >= threshold || significant >= threshold)
            && !counters.tripped.swap(true, Ordering::SeqCst)
        {
            warn!(in_batch, significant, threshold, "Failure threshold crossed");
        }
    }

    /// Restore the repository, take a fresh backup unless this was the last
    /// attempt, and persist everything analyzed so far.
    fn reset(&mut self, fresh_backup: bool) -> Result<()> {
        self.transition(SchedulerState::Resetting);
        if let Err(e) = self.cache.persist() {
            warn!(error = %e, "Cache save during reset failed");
        }
        self.recovery.restore()?;
        if fresh_backup {
            thread::sleep(self.restore_pause);
            self.recovery.prepare()?;
        }
        info!(fresh_backup, "Reset complete");
        Ok(())
    }
}

/// Run `work`, turning a panic into a resource error.
fn run_guarded<F>(work: &F, commit: &CommitInfo) -> Result<CommitMethods>
where
    F: Fn(&CommitInfo) -> Result<CommitMethods> + Sync,
{
    match panic::catch_unwind(AssertUnwindSafe(|| work(commit))) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            bail!(MinerError::new(
                ErrorCode::ResourceExhausted,
                format!("Worker panicked on {}: {detail}", commit.short_id()),
            ))
        }
    }
}

/// Infrastructure failures count toward the release-wide counter; data
/// errors only toward the batch.
fn is_significant(e: &anyhow::Error) -> bool {
    match code_of(e) {
        Some(
            ErrorCode::CheckoutFailed
            | ErrorCode::VcsError
            | ErrorCode::IoError
            | ErrorCode::ResourceExhausted,
        ) => true,
        Some(_) => false,
        None => e.downcast_ref::<std::io::Error>().is_some(),
    }
}

/// `min(cores, max(1, min(memory / per_worker, thread_cap)))`
pub fn worker_count(config: &SchedulerConfig) -> usize {
    let memory = config
        .memory_budget_mb
        .or_else(available_memory_mb)
        .unwrap_or(DEFAULT_MEMORY_MB);
    let by_memory = (memory / config.memory_per_worker_mb.max(1)) as usize;
    num_cpus::get().min(by_memory.min(config.thread_cap).max(1))
}

/// `MemAvailable` from `/proc/meminfo`, in MB.
fn available_memory_mb() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available(&meminfo)
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|l| l.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::CacheLimits;
    use crate::engine::assigner::tests::commit;
    use crate::models::method::MethodRecord;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingRecovery {
        prepared: AtomicUsize,
        restored: AtomicUsize,
    }

    impl Recovery for CountingRecovery {
        fn prepare(&self) -> Result<()> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn restore(&self) -> Result<()> {
            self.restored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSink(AtomicUsize);

    impl PartialSink for CountingSink {
        fn emit_partial(&self, _processed: usize) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            batch_size: 4,
            thread_cap: 2,
            error_threshold: 2,
            max_attempts: 3,
            memory_budget_mb: Some(4096),
            persist_every: 3,
            emit_every: 5,
            restore_pause_ms: 0,
            batch_pause_ms: 0,
            ..Default::default()
        }
    }

    fn commits(n: usize) -> Vec<CommitInfo> {
        (0..n)
            .map(|i| commit(&format!("c{i:02}"), 1 + i as u32 % 27, "a", ""))
            .collect()
    }

    fn methods_for(id: &str) -> CommitMethods {
        let r = MethodRecord {
            class_name: "src/A.java".into(),
            method_name: format!("{id}/0"),
            ..Default::default()
        };
        [(r.key(), r)].into()
    }

    fn cache(dir: &std::path::Path) -> CommitCache {
        CommitCache::open(
            dir,
            "proj",
            CacheLimits {
                max_shard_bytes: 1 << 20,
                chunk_size: 50,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_cached_commits_are_not_analyzed() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = cache(dir.path());
        let all = commits(6);
        for c in &all[..4] {
            cache.insert(&c.id, methods_for(&c.id));
        }
        let calls = Mutex::new(Vec::new());
        let cfg = config();
        let recovery = CountingRecovery::default();

        let summary = BatchScheduler::new(&cfg, &cache, &recovery)
            .run(
                &all,
                |c| {
                    calls.lock().unwrap().push(c.id.clone());
                    Ok(methods_for(&c.id))
                },
                &(),
            )
            .unwrap();

        let mut calls = calls.into_inner().unwrap();
        calls.sort();
        assert_eq!(calls, vec!["c04", "c05"]);
        assert_eq!(summary.already_cached, 4);
        assert_eq!(summary.analyzed, 2);
        assert_eq!(recovery.restored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fully_cached_run_touches_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = cache(dir.path());
        let all = commits(3);
        for c in &all {
            cache.insert(&c.id, methods_for(&c.id));
        }
        let cfg = config();
        let recovery = CountingRecovery::default();
        let summary = BatchScheduler::new(&cfg, &cache, &recovery)
            .run(&all, |_| panic!("must not run"), &())
            .unwrap();
        assert_eq!(summary.analyzed, 0);
        assert_eq!(recovery.prepared.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_isolated_failures_are_absorbed() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = cache(dir.path());
        let all = commits(8);
        let cfg = config();
        let recovery = CountingRecovery::default();
        let sink = CountingSink::default();

        // one data error per batch stays under the threshold of 2
        let summary = BatchScheduler::new(&cfg, &cache, &recovery)
            .run(
                &all,
                |c| {
                    if c.id == "c01" || c.id == "c05" {
                        bail!(MinerError::parse_error(&c.id));
                    }
                    Ok(methods_for(&c.id))
                },
                &sink,
            )
            .unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.analyzed, 6);
        assert_eq!(summary.resets, 0);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.load(None).unwrap().len(), 6);
    }

    #[test]
    fn test_threshold_triggers_reset_then_recovers() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = cache(dir.path());
        let all = commits(8);
        let cfg = config();
        let recovery = CountingRecovery::default();
        let seen: Mutex<HashMap<String, usize>> = Mutex::new(HashMap::new());

        // c00 and c01 fail on their first run only
        let mut scheduler = BatchScheduler::new(&cfg, &cache, &recovery);
        let summary = scheduler
            .run(
                &all,
                |c| {
                    let mut seen = seen.lock().unwrap();
                    let n = seen.entry(c.id.clone()).or_insert(0);
                    *n += 1;
                    if *n == 1 && (c.id == "c00" || c.id == "c01") {
                        bail!(MinerError::new(ErrorCode::CheckoutFailed, "wedged"));
                    }
                    Ok(methods_for(&c.id))
                },
                &(),
            )
            .unwrap();

        assert_eq!(summary.resets, 1);
        assert_eq!(cache.len(), 8);
        assert_eq!(scheduler.state(), SchedulerState::Running);
        // initial backup, fresh backup after the reset
        assert_eq!(recovery.prepared.load(Ordering::SeqCst), 2);
        // reset restore plus the final restore
        assert_eq!(recovery.restored.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_exhaustion_keeps_partial_results() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = cache(dir.path());
        let all = commits(8);
        // one worker keeps the batch order deterministic
        let cfg = SchedulerConfig {
            thread_cap: 1,
            ..config()
        };
        let recovery = CountingRecovery::default();
        let broken: HashSet<&str> = ["c06", "c07"].into();

        let mut scheduler = BatchScheduler::new(&cfg, &cache, &recovery);
        let err = scheduler
            .run(
                &all,
                |c| {
                    if broken.contains(c.id.as_str()) {
                        panic!("out of memory");
                    }
                    Ok(methods_for(&c.id))
                },
                &(),
            )
            .unwrap_err();

        assert_eq!(code_of(&err), Some(ErrorCode::RetryExhausted));
        assert_eq!(scheduler.state(), SchedulerState::Resetting);
        let on_disk = cache.load(None).unwrap();
        assert_eq!(on_disk.len(), 6);
        assert!(!on_disk.contains_key("c06"));
    }

    #[test]
    fn test_worker_count_bounds() {
        let mut cfg = SchedulerConfig {
            thread_cap: 8,
            memory_budget_mb: Some(1024),
            ..Default::default()
        };
        assert_eq!(worker_count(&cfg), num_cpus::get().min(2));
        cfg.memory_budget_mb = Some(100);
        assert_eq!(worker_count(&cfg), 1);
    }

    #[test]
    fn test_parse_mem_available() {
        let meminfo = "MemTotal:       16318480 kB\nMemAvailable:    8159240 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(7968));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }
}
