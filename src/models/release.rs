use chrono::{DateTime, Utc};
use serde::Serialize;

use super::commit::CommitInfo;
use super::inventory::Inventory;
use super::ticket::Ticket;

/// A dated milestone and everything assigned to it.
#[derive(Debug, Clone)]
pub struct Release {
    pub id: u32,
    pub name: String,
    pub date: DateTime<Utc>,
    /// Chronological
    pub commits: Vec<CommitInfo>,
    /// Most recently dated member of `commits`
    pub last_commit: Option<CommitInfo>,
    pub tickets: Vec<Ticket>,
    pub proportion: f64,
    pub inventory: Inventory,
}

impl Release {
    pub fn new(id: u32, name: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            date,
            commits: Vec::new(),
            last_commit: None,
            tickets: Vec::new(),
            proportion: 0.0,
            inventory: Inventory::new(),
        }
    }

    pub fn first_commit_date(&self) -> Option<DateTime<Utc>> {
        self.commits.first().map(|c| c.date)
    }

    pub fn summary(&self) -> ReleaseSummary {
        ReleaseSummary {
            id: self.id,
            name: self.name.clone(),
            date: self.date,
            commits: self.commits.len(),
            last_commit: self.last_commit.as_ref().map(|c| c.id.clone()),
            tickets: self.tickets.len(),
            classes: self.inventory.class_count(),
        }
    }
}

/// A version entry as reported by the issue tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    pub name: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseSummary {
    pub id: u32,
    pub name: String,
    pub date: DateTime<Utc>,
    pub commits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<String>,
    pub tickets: usize,
    pub classes: usize,
}

/// Locate a release by id in an id-sorted slice. Ids may have gaps.
pub fn find_release(releases: &[Release], id: u32) -> Option<&Release> {
    releases
        .binary_search_by_key(&id, |r| r.id)
        .ok()
        .map(|i| &releases[i])
}
