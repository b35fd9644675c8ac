//! Release mining pipeline: releases → tickets → analysis → labels → datasets.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::store::CommitCache;
use crate::config::Config;
use crate::engine::analyzer::StaticAnalyzer;
use crate::engine::assigner::{
    assign_commits, assign_tickets_to_releases, associate_tickets, compute_class_history,
    load_class_inventory,
};
use crate::engine::bodies::BodyExtractor;
use crate::engine::extraction::MetricsExtractor;
use crate::engine::git::VersionControl;
use crate::engine::labeler::{assign_labels, assign_proportions, usable_tickets};
use crate::engine::lint::Linter;
use crate::engine::scheduler::{BatchScheduler, PartialSink};
use crate::engine::snapshot::SnapshotManager;
use crate::error::{ErrorCode, MinerError, code_of};
use crate::models::commit::CommitInfo;
use crate::models::dataset::{DatasetKind, DatasetReport};
use crate::models::inventory::Inventory;
use crate::models::method::MethodRecord;
use crate::models::release::{Release, ReleaseSummary};
use crate::models::ticket::Ticket;
use crate::output::DatasetSink;
use crate::tracker::{IssueTracker, TicketSource};

#[derive(Debug, Clone, Serialize)]
pub struct DatasetFailure {
    pub release: String,
    pub kind: DatasetKind,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MineReport {
    pub project: String,
    pub releases: Vec<ReleaseSummary>,
    pub tickets: usize,
    pub datasets: Vec<DatasetReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<DatasetFailure>,
}

/// One dataset to produce: the commits to analyze and the tickets to label with.
pub struct DatasetPlan<'r> {
    pub kind: DatasetKind,
    pub target: &'r Release,
    /// Chronological, each commit paired with the release it belongs to
    pub window: Vec<(&'r CommitInfo, &'r Release)>,
    pub tickets: &'r [Ticket],
    pub proportion: f64,
    /// Releases the usable-ticket filter is evaluated against
    pub eval_ids: Vec<u32>,
}

pub struct Pipeline {
    project: String,
    config: Config,
    vcs: Arc<dyn VersionControl>,
    snapshots: SnapshotManager,
    cache: CommitCache,
    extractor: MetricsExtractor,
    bodies: BodyExtractor,
    sink: Box<dyn DatasetSink>,
}

impl Pipeline {
    pub fn new(
        project: &str,
        config: Config,
        vcs: Arc<dyn VersionControl>,
        analyzer: Arc<dyn StaticAnalyzer>,
        linter: Arc<dyn Linter>,
        sink: Box<dyn DatasetSink>,
    ) -> Result<Self> {
        let work_dir: PathBuf = config.work_dir.join(project);
        let snapshots = SnapshotManager::new(
            Arc::clone(&vcs),
            config.snapshot.clone(),
            &work_dir,
            Duration::from_millis(config.scheduler.restore_pause_ms),
        )?;
        let cache = CommitCache::open(&config.cache_dir, project, (&config.cache).into())?;
        let extractor =
            MetricsExtractor::new(analyzer, linter, config.analysis.module_markers.clone());
        let bodies = BodyExtractor::new(work_dir.join("parsing_errors"));
        Ok(Self {
            project: project.to_string(),
            config,
            vcs,
            snapshots,
            cache,
            extractor,
            bodies,
            sink,
        })
    }

    pub fn cache(&self) -> &CommitCache {
        &self.cache
    }

    /// Mine every dataset of the project.
    ///
    /// A dataset whose scheduling gives up is recorded as a failure; the
    /// remaining datasets still run.
    pub fn run<S: TicketSource>(&self, tracker: &IssueTracker<S>) -> Result<MineReport> {
        if self.snapshots.recover_stale_backups()? {
            info!("Recovered repository from a stale backup");
        }
        let (releases, tickets) = self.prepare(tracker)?;

        let mut report = MineReport {
            project: self.project.clone(),
            releases: releases.iter().map(Release::summary).collect(),
            tickets: tickets.len(),
            datasets: Vec::new(),
            failures: Vec::new(),
        };

        for plan in dataset_plans(&releases, &self.config) {
            match self.build_dataset(&plan) {
                Ok(dataset) => report.datasets.push(dataset),
                Err(e) => {
                    error!(
                        release = %plan.target.name,
                        kind = ?plan.kind,
                        error = %e,
                        "Dataset failed"
                    );
                    report.failures.push(DatasetFailure {
                        release: plan.target.name.clone(),
                        kind: plan.kind,
                        code: code_of(&e)
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "INTERNAL_ERROR".to_string()),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.cache.persist()?;
        info!(
            project = %self.project,
            datasets = report.datasets.len(),
            failures = report.failures.len(),
            "Mining finished"
        );
        Ok(report)
    }

    /// Releases with commits, class history, tickets and proportions.
    pub fn prepare<S: TicketSource>(
        &self,
        tracker: &IssueTracker<S>,
    ) -> Result<(Vec<Release>, Vec<Ticket>)> {
        let mut releases = tracker.fetch_releases()?;
        if releases.is_empty() {
            bail!(MinerError::new(
                ErrorCode::InsufficientData,
                "Tracker reports no released, dated versions",
            ));
        }
        // ids refer to the full version list, so tickets resolve before releases get dropped
        let mut tickets = tracker.fetch_tickets(&releases)?;

        let commits = self.vcs.commits()?;
        associate_tickets(&mut tickets, &commits)?;
        if tickets.len() < self.config.pipeline.min_tickets {
            bail!(MinerError::new(
                ErrorCode::InsufficientData,
                format!(
                    "Only {} tickets have commits, at least {} needed",
                    tickets.len(),
                    self.config.pipeline.min_tickets
                ),
            ));
        }

        assign_commits(&mut releases, commits);
        for release in releases.iter_mut() {
            load_class_inventory(release, self.vcs.as_ref())?;
        }
        compute_class_history(&mut releases, self.vcs.as_ref())?;
        assign_tickets_to_releases(&mut releases, &tickets);
        assign_proportions(&mut releases, &tickets, &self.config.pipeline);

        info!(
            releases = releases.len(),
            tickets = tickets.len(),
            "Prepared releases"
        );
        Ok((releases, tickets))
    }

    fn build_dataset(&self, plan: &DatasetPlan<'_>) -> Result<DatasetReport> {
        let target = plan.target;
        if self.sink.is_complete(plan.kind, target.id) {
            info!(release = %target.name, kind = ?plan.kind, "Dataset exists, skipping");
            return Ok(DatasetReport {
                release: target.name.clone(),
                kind: plan.kind,
                path: self.sink.path_for(plan.kind, target.id).display().to_string(),
                rows: 0,
                buggy: 0,
                skipped: true,
            });
        }

        let usable = usable_tickets(plan.tickets, plan.proportion, &plan.eval_ids);
        let wanted: HashSet<String> = plan.window.iter().map(|(c, _)| c.id.clone()).collect();
        self.cache.warm(Some(&wanted))?;
        let pending: Vec<CommitInfo> = plan
            .window
            .iter()
            .filter(|(c, _)| !self.cache.contains(&c.id))
            .map(|(c, _)| (*c).clone())
            .collect();
        let cached = plan.window.len() - pending.len();
        info!(
            release = %target.name,
            kind = ?plan.kind,
            window = plan.window.len(),
            cached,
            pending = pending.len(),
            usable_tickets = usable.len(),
            "Building dataset"
        );

        if pending.is_empty() {
            return self.emit(plan, &usable, plan.kind);
        }
        if cached > 0
            && let Err(e) = self.emit(plan, &usable, DatasetKind::Partial)
        {
            warn!(error = %e, "Partial dataset emission failed");
        }

        let release_of: HashMap<&str, &Release> = plan
            .window
            .iter()
            .map(|(c, r)| (c.id.as_str(), *r))
            .collect();
        let work = |commit: &CommitInfo| {
            let snapshot = self.snapshots.snapshot(commit)?;
            let owner = release_of.get(commit.id.as_str()).copied().unwrap_or(target);
            self.extractor.extract(&snapshot, &owner.inventory)
        };
        let partials = PartialEmitter {
            pipeline: self,
            plan,
            usable: &usable,
        };

        let mut scheduler = BatchScheduler::new(&self.config.scheduler, &self.cache, &self.snapshots);
        match scheduler.run(&pending, work, &partials) {
            Ok(summary) => {
                debug!(?summary, "Scheduling summary");
                self.emit(plan, &usable, plan.kind)
            }
            Err(e) => {
                if let Err(pe) = self.emit(plan, &usable, DatasetKind::Partial) {
                    warn!(error = %pe, "Partial dataset emission failed");
                }
                Err(e)
            }
        }
    }

    /// Assemble the window from the cache, label it and write it as `kind`.
    fn emit(
        &self,
        plan: &DatasetPlan<'_>,
        usable: &[&Ticket],
        kind: DatasetKind,
    ) -> Result<DatasetReport> {
        let mut inventory = assemble_inventory(plan, &self.cache);
        assign_labels(&mut inventory, usable, self.vcs.as_ref(), &self.bodies)?;
        let rows: Vec<&MethodRecord> = inventory.methods().collect();
        self.sink.write(kind, plan.target.id, &plan.target.name, &rows)
    }
}

struct PartialEmitter<'a> {
    pipeline: &'a Pipeline,
    plan: &'a DatasetPlan<'a>,
    usable: &'a [&'a Ticket],
}

impl PartialSink for PartialEmitter<'_> {
    fn emit_partial(&self, processed: usize) -> Result<()> {
        let report = self
            .pipeline
            .emit(self.plan, self.usable, DatasetKind::Partial)?;
        debug!(processed, rows = report.rows, "Emitted partial dataset");
        Ok(())
    }
}

/// Commit→release assignment with class tables, without tickets.
pub fn plan_releases<S: TicketSource>(
    tracker: &IssueTracker<S>,
    vcs: &dyn VersionControl,
) -> Result<Vec<Release>> {
    let mut releases = tracker.fetch_releases()?;
    assign_commits(&mut releases, vcs.commits()?);
    for release in releases.iter_mut() {
        load_class_inventory(release, vcs)?;
    }
    Ok(releases)
}

/// Training and test plans, newest release first.
///
/// Only releases inside the training split get datasets, and never the
/// first one since it has no history before it.
pub fn dataset_plans<'r>(releases: &'r [Release], config: &Config) -> Vec<DatasetPlan<'r>> {
    let Some(last) = releases.last() else {
        return Vec::new();
    };
    let n = releases.len();
    let split = ((n as f64 * config.pipeline.split_ratio).floor() as usize).clamp(1, n);
    let cap = config.pipeline.max_commits_per_release.max(1);

    let mut plans = Vec::new();
    for idx in (1..split).rev() {
        let target = &releases[idx];
        let history = &releases[..idx];

        plans.push(DatasetPlan {
            kind: DatasetKind::Training,
            target,
            window: capped(
                history
                    .iter()
                    .flat_map(|r| r.commits.iter().map(move |c| (c, r)))
                    .collect(),
                cap,
            ),
            tickets: &target.tickets,
            proportion: target.proportion,
            eval_ids: history.iter().map(|r| r.id).collect(),
        });
        plans.push(DatasetPlan {
            kind: DatasetKind::Test,
            target,
            window: capped(target.commits.iter().map(|c| (c, target)).collect(), cap),
            tickets: &last.tickets,
            proportion: last.proportion,
            eval_ids: vec![target.id],
        });
    }
    plans
}

/// Keep the most recent `cap` commits.
fn capped<'r>(
    mut window: Vec<(&'r CommitInfo, &'r Release)>,
    cap: usize,
) -> Vec<(&'r CommitInfo, &'r Release)> {
    if window.len() > cap {
        window.drain(..window.len() - cap);
    }
    window
}

/// Replay cached commit entries of the window into the target's class table.
///
/// Later commits overwrite earlier records with the same key.
pub fn assemble_inventory(plan: &DatasetPlan<'_>, cache: &CommitCache) -> Inventory {
    let mut inventory = plan.target.inventory.classes_only();
    for (commit, release) in &plan.window {
        let Some(methods) = cache.get(&commit.id) else {
            continue;
        };
        for record in methods.values() {
            let mut record = record.clone();
            record.release = release.name.clone();
            inventory.insert_method(record);
        }
    }
    inventory
}
