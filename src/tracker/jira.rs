use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use super::{IssuePage, RawIssue, RawVersion, TicketSource};
use crate::error::MinerError;

const VERSIONS_FILE: &str = "versions.json";
const ISSUES_FILE: &str = "issues.json";

/// `/project/{key}/version` is paged (`values`), `/project/{key}/versions` is a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum VersionsDoc {
    Paged { values: Vec<RawVersion> },
    Plain(Vec<RawVersion>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IssuesDoc {
    Search { issues: Vec<RawIssue> },
    Plain(Vec<RawIssue>),
}

/// A Jira REST export on disk: `versions.json` plus `issues.json`.
pub struct JiraExportSource {
    dir: PathBuf,
    issues: Vec<RawIssue>,
}

impl JiraExportSource {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        for name in [VERSIONS_FILE, ISSUES_FILE] {
            let path = dir.join(name);
            if !path.is_file() {
                bail!(MinerError::file_not_found(&path.display().to_string()));
            }
        }
        let issues = match read_json::<IssuesDoc>(&dir.join(ISSUES_FILE))? {
            IssuesDoc::Search { issues } | IssuesDoc::Plain(issues) => issues,
        };
        Ok(Self { dir, issues })
    }
}

impl TicketSource for JiraExportSource {
    fn versions(&self) -> Result<Vec<RawVersion>> {
        Ok(match read_json::<VersionsDoc>(&self.dir.join(VERSIONS_FILE))? {
            VersionsDoc::Paged { values } | VersionsDoc::Plain(values) => values,
        })
    }

    fn issue_page(&self, start_at: usize, max_results: usize) -> Result<IssuePage> {
        Ok(IssuePage {
            start_at,
            max_results,
            total: self.issues.len(),
            issues: self
                .issues
                .iter()
                .skip(start_at)
                .take(max_results)
                .cloned()
                .collect(),
        })
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| MinerError::parse_error(&format!("{}: {e}", path.display())).into())
}
