//! Partition history into releases and derive per-release class attributes.

use std::collections::HashMap;

use aho_corasick::AhoCorasick;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::engine::git::VersionControl;
use crate::error::{ErrorCode, MinerError};
use crate::models::commit::{ChangeKind, CommitInfo, FileChange, is_production_source};
use crate::models::release::{Release, VersionInfo};
use crate::models::ticket::Ticket;

/// Sort versions by date and number them from 1.
pub fn build_releases(versions: &[VersionInfo]) -> Vec<Release> {
    let mut sorted: Vec<&VersionInfo> = versions.iter().collect();
    sorted.sort_by_key(|v| v.date);
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, v)| Release::new(i as u32 + 1, v.name.clone(), v.date))
        .collect()
}

/// Assign each commit to the earliest release dated after it.
///
/// Commits newer than every release land in the last one. Releases left
/// without commits are removed, so ids may have gaps afterwards.
pub fn assign_commits(releases: &mut Vec<Release>, mut commits: Vec<CommitInfo>) {
    if releases.is_empty() {
        return;
    }
    commits.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));

    let last = releases.len() - 1;
    for commit in commits {
        let idx = releases.partition_point(|r| r.date <= commit.date).min(last);
        releases[idx].commits.push(commit);
    }

    let before = releases.len();
    releases.retain(|r| !r.commits.is_empty());
    if releases.len() != before {
        debug!(dropped = before - releases.len(), "Dropped releases without commits");
    }

    for release in releases.iter_mut() {
        release.last_commit = release.commits.iter().max_by_key(|c| c.date).cloned();
    }
}

/// Load every production source in the release's last commit as a class record.
pub fn load_class_inventory(release: &mut Release, vcs: &dyn VersionControl) -> Result<()> {
    let Some(anchor) = release.last_commit.as_ref() else {
        return Ok(());
    };
    let files = vcs.list_files(&anchor.id)?;
    for path in files.iter().filter(|p| is_production_source(p)) {
        release.inventory.class_entry(path);
    }
    debug!(
        release = %release.name,
        classes = release.inventory.class_count(),
        "Loaded class inventory"
    );
    Ok(())
}

/// Compute revision count, authors, creation date and age of every class.
///
/// Releases must be in id order. Each release only looks at its own
/// commits; age chains through the previous release when the class existed there.
pub fn compute_class_history(releases: &mut [Release], vcs: &dyn VersionControl) -> Result<()> {
    let mut previous: Option<HashMap<String, (DateTime<Utc>, i64)>> = None;

    for release in releases.iter_mut() {
        let changes: Vec<Vec<FileChange>> = release
            .commits
            .par_iter()
            .map(|c| vcs.changes(c))
            .collect::<Result<_>>()?;

        for (commit, changed) in release.commits.iter().zip(&changes) {
            for change in changed {
                if !is_production_source(&change.path) {
                    continue;
                }
                let Some(class) = release.inventory.class_mut(&change.path) else {
                    continue;
                };
                match change.kind {
                    ChangeKind::Modified => {
                        class.revisions += 1;
                        class.authors.insert(commit.author.clone());
                    }
                    ChangeKind::Added => {
                        class.creation_date.get_or_insert(commit.date);
                    }
                    ChangeKind::Deleted => {}
                }
            }
        }

        let fallback = release.first_commit_date().unwrap_or(release.date);
        let release_date = release.date;
        for class in release.inventory.classes_mut() {
            let creation = *class.creation_date.get_or_insert(fallback);
            let prior = previous.as_ref().and_then(|p| p.get(&class.path));
            class.age = match prior {
                Some(&(prev_creation, prev_age)) => {
                    (creation - prev_creation).num_days() + prev_age
                }
                None => (release_date - creation).num_days(),
            };
        }

        previous = Some(
            release
                .inventory
                .classes()
                .filter_map(|c| c.creation_date.map(|d| (c.path.clone(), (d, c.age))))
                .collect(),
        );
        info!(release = %release.name, "Computed class history");
    }
    Ok(())
}

/// Attach commits to tickets whose key they mention (`KEY:`, `KEY]` or `KEY `).
///
/// Tickets left without commits are dropped.
pub fn associate_tickets(tickets: &mut Vec<Ticket>, commits: &[CommitInfo]) -> Result<()> {
    const SUFFIXES: [&str; 3] = [":", "]", " "];

    if tickets.is_empty() {
        return Ok(());
    }
    let patterns: Vec<String> = tickets
        .iter()
        .flat_map(|t| SUFFIXES.iter().map(move |s| format!("{}{s}", t.key)))
        .collect();
    let matcher = AhoCorasick::new(&patterns).map_err(|e| {
        MinerError::new(
            ErrorCode::InvalidRequest,
            format!("Failed to build ticket matcher: {e}"),
        )
    })?;

    for commit in commits {
        let mut hit: Vec<usize> = matcher
            .find_overlapping_iter(&commit.message)
            .map(|m| m.pattern().as_usize() / SUFFIXES.len())
            .collect();
        hit.sort_unstable();
        hit.dedup();
        for idx in hit {
            tickets[idx].commits.push(commit.clone());
        }
    }

    let before = tickets.len();
    tickets.retain(|t| !t.commits.is_empty());
    for ticket in tickets.iter_mut() {
        ticket.commits.sort_by_key(|c| c.date);
    }
    info!(
        kept = tickets.len(),
        dropped = before - tickets.len(),
        "Associated commits with tickets"
    );
    Ok(())
}

/// Give each release the tickets already fixed by it (`fv <= id`).
pub fn assign_tickets_to_releases(releases: &mut [Release], tickets: &[Ticket]) {
    for release in releases.iter_mut() {
        release.tickets = tickets
            .iter()
            .filter(|t| t.fv <= release.id)
            .cloned()
            .collect();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::git::CheckoutTier;
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::Arc;

    pub(crate) fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()
    }

    pub(crate) fn commit(id: &str, d: u32, author: &str, message: &str) -> CommitInfo {
        CommitInfo {
            id: id.into(),
            parents: vec!["p".into()],
            author: author.into(),
            date: day(d),
            message: message.into(),
        }
    }

    /// In-memory history: per-commit changes and file contents.
    #[derive(Default)]
    pub(crate) struct FakeVcs {
        pub changes: HashMap<String, Vec<FileChange>>,
        pub files: HashMap<(String, String), String>,
        pub trees: HashMap<String, Vec<String>>,
    }

    impl VersionControl for FakeVcs {
        fn commits(&self) -> Result<Vec<CommitInfo>> {
            Ok(Vec::new())
        }
        fn changes(&self, commit: &CommitInfo) -> Result<Vec<FileChange>> {
            Ok(self.changes.get(&commit.id).cloned().unwrap_or_default())
        }
        fn file_at(&self, commit: &str, path: &str) -> Result<Option<Arc<Vec<u8>>>> {
            Ok(self
                .files
                .get(&(commit.to_string(), path.to_string()))
                .map(|s| Arc::new(s.clone().into_bytes())))
        }
        fn list_files(&self, commit: &str) -> Result<Vec<String>> {
            Ok(self.trees.get(commit).cloned().unwrap_or_default())
        }
        fn checkout(&self, _: &str, _: CheckoutTier, _: &[String]) -> Result<()> {
            Ok(())
        }
        fn verify(&self) -> Result<()> {
            Ok(())
        }
        fn work_dir(&self) -> &Path {
            Path::new(".")
        }
    }

    fn versions() -> Vec<VersionInfo> {
        vec![
            VersionInfo {
                name: "2.0".into(),
                date: day(20),
            },
            VersionInfo {
                name: "1.0".into(),
                date: day(10),
            },
        ]
    }

    #[test]
    fn test_build_releases_sorts_and_numbers() {
        let releases = build_releases(&versions());
        assert_eq!(releases[0].name, "1.0");
        assert_eq!(releases[0].id, 1);
        assert_eq!(releases[1].id, 2);
    }

    #[test]
    fn test_assign_commits_two_releases() {
        let mut releases = build_releases(&versions());
        let commits = vec![
            commit("c3", 25, "a", ""),
            commit("c1", 5, "a", ""),
            commit("c2", 15, "a", ""),
        ];
        assign_commits(&mut releases, commits);

        assert_eq!(releases.len(), 2);
        let r1: Vec<_> = releases[0].commits.iter().map(|c| c.id.as_str()).collect();
        let r2: Vec<_> = releases[1].commits.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(r1, vec!["c1"]);
        assert_eq!(r2, vec!["c2", "c3"]);
        assert_eq!(releases[1].last_commit.as_ref().unwrap().id, "c3");
    }

    #[test]
    fn test_empty_release_is_dropped_leaving_gap() {
        let mut releases = build_releases(&[
            VersionInfo {
                name: "1.0".into(),
                date: day(5),
            },
            VersionInfo {
                name: "2.0".into(),
                date: day(10),
            },
            VersionInfo {
                name: "3.0".into(),
                date: day(15),
            },
        ]);
        assign_commits(
            &mut releases,
            vec![commit("a", 2, "x", ""), commit("b", 12, "x", "")],
        );
        let ids: Vec<u32> = releases.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_class_history_counts_and_age() {
        let mut releases = build_releases(&versions());
        assign_commits(
            &mut releases,
            vec![
                commit("c1", 2, "alice", ""),
                commit("c2", 4, "bob", ""),
                commit("c3", 15, "carol", ""),
            ],
        );
        let mut vcs = FakeVcs::default();
        let path = "src/main/java/a/Foo.java".to_string();
        vcs.changes.insert(
            "c1".into(),
            vec![FileChange {
                path: path.clone(),
                kind: ChangeKind::Added,
            }],
        );
        vcs.changes.insert(
            "c2".into(),
            vec![FileChange {
                path: path.clone(),
                kind: ChangeKind::Modified,
            }],
        );
        vcs.changes.insert(
            "c3".into(),
            vec![FileChange {
                path: path.clone(),
                kind: ChangeKind::Modified,
            }],
        );
        for r in &mut releases {
            r.inventory.class_entry(&path);
        }

        compute_class_history(&mut releases, &vcs).unwrap();

        let c1 = releases[0].inventory.class(&path).unwrap();
        assert_eq!(c1.revisions, 1);
        assert_eq!(c1.n_auth(), 1);
        assert_eq!(c1.creation_date, Some(day(2)));
        assert_eq!(c1.age, 8);

        // Not added in release 2: creation falls back to its first commit (day 15)
        let c2 = releases[1].inventory.class(&path).unwrap();
        assert_eq!(c2.creation_date, Some(day(15)));
        assert_eq!(c2.age, 13 + 8);
        assert_eq!(c2.revisions, 1);
    }

    #[test]
    fn test_associate_tickets_by_key_suffix() {
        let mut tickets = vec![
            ticket("PRJ-1", 1, 2),
            ticket("PRJ-12", 1, 2),
            ticket("PRJ-3", 1, 2),
        ];
        let commits = vec![
            commit("a", 1, "x", "PRJ-1: fix npe"),
            commit("b", 2, "x", "[PRJ-12] tidy"),
            commit("c", 3, "x", "PRJ-1 and PRJ-12 follow up"),
            commit("d", 4, "x", "PRJ-3"),
        ];
        associate_tickets(&mut tickets, &commits).unwrap();

        assert_eq!(tickets.len(), 2);
        let one = tickets.iter().find(|t| t.key == "PRJ-1").unwrap();
        let ids: Vec<_> = one.commits.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        let twelve = tickets.iter().find(|t| t.key == "PRJ-12").unwrap();
        assert_eq!(twelve.commits.len(), 2);
    }

    #[test]
    fn test_assign_tickets_to_releases_by_fix_version() {
        let mut releases = build_releases(&versions());
        let tickets = vec![ticket("A-1", 1, 1), ticket("A-2", 1, 2)];
        assign_tickets_to_releases(&mut releases, &tickets);
        assert_eq!(releases[0].tickets.len(), 1);
        assert_eq!(releases[1].tickets.len(), 2);
    }

    pub(crate) fn ticket(key: &str, ov: u32, fv: u32) -> Ticket {
        Ticket {
            key: key.into(),
            created: day(1),
            resolved: day(2),
            ov,
            fv,
            iv: None,
            commits: Vec::new(),
        }
    }
}
