//! Issue-tracker access: released versions and fixed bug tickets.

pub mod jira;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::engine::assigner::build_releases;
use crate::error::{ErrorCode, MinerError};
use crate::models::release::{Release, VersionInfo};
use crate::models::ticket::Ticket;

pub use jira::JiraExportSource;

/// A version entry as the tracker reports it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawVersion {
    pub name: Option<String>,
    pub released: bool,
    #[serde(rename = "releaseDate")]
    pub release_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IssueFields {
    pub created: Option<String>,
    pub resolutiondate: Option<String>,
    /// Affected versions
    pub versions: Vec<RawVersion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawIssue {
    pub key: String,
    #[serde(default)]
    pub fields: IssueFields,
}

/// One page of a search result.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IssuePage {
    pub start_at: usize,
    pub max_results: usize,
    pub total: usize,
    pub issues: Vec<RawIssue>,
}

/// Raw primitives of a tracker backend.
pub trait TicketSource: Send + Sync {
    fn versions(&self) -> Result<Vec<RawVersion>>;
    fn issue_page(&self, start_at: usize, max_results: usize) -> Result<IssuePage>;
}

/// Retrying, paginating client over a [`TicketSource`].
pub struct IssueTracker<S> {
    source: S,
    max_retries: u32,
    retry_delay: Duration,
    page_size: usize,
}

impl<S: TicketSource> IssueTracker<S> {
    pub fn new(source: S, config: &TrackerConfig) -> Self {
        Self {
            source,
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            page_size: config.page_size.max(1),
        }
    }

    /// Released, dated versions sorted by date.
    pub fn fetch_versions(&self) -> Result<Vec<VersionInfo>> {
        let raw = self.with_retry("versions", || self.source.versions())?;
        let mut versions: Vec<VersionInfo> = raw
            .into_iter()
            .filter(|v| v.released)
            .filter_map(|v| {
                let date = v.release_date.as_deref().and_then(parse_date)?;
                Some(VersionInfo {
                    name: v.name?,
                    date,
                })
            })
            .collect();
        versions.sort_by_key(|v| v.date);
        Ok(versions)
    }

    /// Releases numbered from 1 in date order.
    pub fn fetch_releases(&self) -> Result<Vec<Release>> {
        let releases = build_releases(&self.fetch_versions()?);
        info!(releases = releases.len(), "Fetched releases");
        Ok(releases)
    }

    /// Every fixed ticket whose dates fall inside the release range.
    pub fn fetch_tickets(&self, releases: &[Release]) -> Result<Vec<Ticket>> {
        let mut tickets = Vec::new();
        let mut start_at = 0;
        loop {
            let page = self.with_retry("issues", || {
                self.source.issue_page(start_at, self.page_size)
            })?;
            let received = page.issues.len();
            debug!(start_at, received, total = page.total, "Fetched issue page");
            tickets.extend(page.issues.iter().filter_map(|i| build_ticket(i, releases)));

            start_at += received;
            if received == 0 || start_at >= page.total {
                break;
            }
        }
        info!(
            tickets = tickets.len(),
            with_iv = tickets.iter().filter(|t| t.has_reported_iv()).count(),
            "Fetched tickets"
        );
        Ok(tickets)
    }

    fn with_retry<T>(&self, what: &str, op: impl Fn() -> Result<T>) -> Result<T> {
        let mut last = None;
        for attempt in 1..=self.max_retries {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(what, attempt, max = self.max_retries, error = %e, "Tracker request failed");
                    last = Some(e);
                    if attempt < self.max_retries {
                        thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        let detail = last.map(|e| e.to_string()).unwrap_or_default();
        Err(MinerError::new(
            ErrorCode::TrackerError,
            format!(
                "Tracker {what} request failed after {} attempts: {detail}",
                self.max_retries
            ),
        )
        .into())
    }
}

/// Ticket with OV/FV resolved against `releases`, `None` when either is
/// outside the release range.
///
/// The IV comes from the earliest released affected version before the
/// resolution, and is kept only if it also precedes the opening release and
/// the ticket spans more than one release.
fn build_ticket(issue: &RawIssue, releases: &[Release]) -> Option<Ticket> {
    let created = issue.fields.created.as_deref().and_then(parse_datetime)?;
    let resolved = issue.fields.resolutiondate.as_deref().and_then(parse_datetime)?;
    let ov = release_for_date(releases, created)?;
    let fv = release_for_date(releases, resolved)?;

    let first_affected = issue
        .fields
        .versions
        .iter()
        .filter(|v| v.released)
        .filter_map(|v| v.release_date.as_deref().and_then(parse_date))
        .filter(|d| *d < fv.date)
        .min();
    let iv = first_affected
        .filter(|d| ov.date > *d && ov.date < fv.date)
        .and_then(|d| release_for_date(releases, d))
        .map(|r| r.id);

    Some(Ticket {
        key: issue.key.clone(),
        created,
        resolved,
        ov: ov.id,
        fv: fv.id,
        iv,
        commits: Vec::new(),
    })
}

/// The release a date belongs to.
///
/// Dates up to the first release map to it, dates after the last release
/// map to nothing, anything else to the first release dated on or after it.
/// A date equal to a release date belongs to that release.
pub fn release_for_date(releases: &[Release], date: DateTime<Utc>) -> Option<&Release> {
    let first = releases.first()?;
    if date <= first.date {
        return Some(first);
    }
    let idx = releases.partition_point(|r| r.date < date);
    releases.get(idx)
}

/// `2013-06-03T13:44:32.000+0000` and RFC 3339.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// `yyyy-MM-dd`, at midnight UTC.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}
