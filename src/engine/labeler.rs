//! Injection-version estimation and buggy-label propagation.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::engine::bodies::BodyExtractor;
use crate::engine::git::{VersionControl, source_diff};
use crate::models::commit::CommitInfo;
use crate::models::inventory::Inventory;
use crate::models::release::Release;
use crate::models::ticket::Ticket;

/// Mean of `(fv - iv) / (fv - ov)` over tickets with a reported IV.
///
/// Tickets opened and fixed in the same release have no defined ratio and
/// are left out. `None` when nothing remains.
pub fn calculate_proportion<'a>(tickets: impl IntoIterator<Item = &'a Ticket>) -> Option<f64> {
    let ratios: Vec<f64> = tickets
        .into_iter()
        .filter_map(|t| {
            let iv = t.iv?;
            (t.fv != t.ov).then(|| {
                (f64::from(t.fv) - f64::from(iv)) / (f64::from(t.fv) - f64::from(t.ov))
            })
        })
        .collect();
    if ratios.is_empty() {
        None
    } else {
        Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
    }
}

/// Set each release's proportion, falling back to the cold-start value
/// wherever fewer than `min_proportion_tickets` report an IV.
pub fn assign_proportions(releases: &mut [Release], all_tickets: &[Ticket], cfg: &PipelineConfig) {
    let cold = cfg.cold_start_proportion;
    let reported = all_tickets.iter().filter(|t| t.has_reported_iv()).count();
    let project_trusted = reported >= cfg.min_proportion_tickets;

    for release in releases.iter_mut() {
        let local = release.tickets.iter().filter(|t| t.has_reported_iv()).count();
        release.proportion = if project_trusted && local >= cfg.min_proportion_tickets {
            calculate_proportion(&release.tickets).unwrap_or(cold)
        } else {
            cold
        };
        debug!(
            release = %release.name,
            proportion = release.proportion,
            reported = local,
            "Assigned proportion"
        );
    }
}

/// Tickets whose bug was live in at least one of `release_ids`:
/// `iv <= r < fv` with `iv < fv`.
pub fn usable_tickets<'a>(
    tickets: &'a [Ticket],
    proportion: f64,
    release_ids: &[u32],
) -> Vec<&'a Ticket> {
    tickets
        .iter()
        .filter(|t| {
            let iv = t.injection_version(proportion);
            iv < t.fv && release_ids.iter().any(|&r| iv <= r && r < t.fv)
        })
        .collect()
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LabelSummary {
    pub commits_replayed: usize,
    pub files_compared: usize,
    pub buggy: usize,
}

/// Replay ticket commits and mark methods whose body changed.
///
/// Every label is reset to `false` first, so a release without tickets or
/// ticket commits ends up fully labelled clean.
pub fn assign_labels(
    inventory: &mut Inventory,
    tickets: &[&Ticket],
    vcs: &dyn VersionControl,
    bodies: &BodyExtractor,
) -> Result<LabelSummary> {
    inventory.set_all_buggy(false);
    let mut summary = LabelSummary::default();

    let commits = ticket_commits(tickets);
    if commits.is_empty() {
        return Ok(summary);
    }

    // 先頭コミットは比較対象にしない
    for commit in commits.iter().skip(1) {
        let Some(parent) = commit.parent() else {
            continue;
        };
        let modified = match source_diff(vcs, commit, false) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(commit = commit.short_id(), error = %e, "Skipping commit during labelling");
                continue;
            }
        };
        summary.commits_replayed += 1;

        for path in modified {
            let ids = inventory.methods_of(&path).to_vec();
            if ids.is_empty() {
                continue;
            }
            let (before, after) = match (
                text_at(vcs, parent, &path),
                text_at(vcs, &commit.id, &path),
            ) {
                (Ok(before), Ok(after)) => (before, after),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(commit = commit.short_id(), path = %path, error = %e, "Skipping file during labelling");
                    continue;
                }
            };
            let (Some(before), Some(after)) = (
                bodies.extract(&format!("{parent}:{path}"), &before),
                bodies.extract(&format!("{}:{path}", commit.id), &after),
            ) else {
                continue;
            };
            summary.files_compared += 1;

            for id in ids {
                let method = inventory.method_mut(id);
                let name = method.simple_name();
                let changed = match (before.get(name), after.get(name)) {
                    (Some(b), Some(a)) => a != b,
                    _ => true,
                };
                if changed {
                    method.buggy = true;
                }
            }
        }
    }

    summary.buggy = inventory.buggy_count();
    info!(
        commits = summary.commits_replayed,
        files = summary.files_compared,
        buggy = summary.buggy,
        methods = inventory.method_count(),
        "Assigned buggy labels"
    );
    Ok(summary)
}

/// Distinct commits of the given tickets, oldest first.
fn ticket_commits(tickets: &[&Ticket]) -> Vec<CommitInfo> {
    let mut seen = HashSet::new();
    let mut commits: Vec<CommitInfo> = tickets
        .iter()
        .flat_map(|t| t.commits.iter())
        .filter(|c| seen.insert(c.id.clone()))
        .cloned()
        .collect();
    commits.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
    commits
}

fn text_at(vcs: &dyn VersionControl, commit: &str, path: &str) -> Result<String> {
    Ok(vcs
        .file_at(commit, path)?
        .map(|b: Arc<Vec<u8>>| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default())
}
