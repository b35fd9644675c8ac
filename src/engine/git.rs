use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::DateTime;
use lru::LruCache;
use tracing::debug;

use crate::error::{ErrorCode, MinerError};
use crate::models::commit::{ChangeKind, CommitInfo, FileChange, is_production_source};

/// Escalating strategies for moving the shared working tree to a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutTier {
    /// Discard local changes and untracked files, then force the checkout
    Forced,
    /// Stash whatever is dirty and retry
    Stashed,
    /// Delete known problematic tracked files and retry once more
    Scrubbed,
}

impl CheckoutTier {
    pub const ALL: [CheckoutTier; 3] = [Self::Forced, Self::Stashed, Self::Scrubbed];
}

/// Version control primitives the miner is built on.
pub trait VersionControl: Send + Sync {
    /// Full history reachable from HEAD, newest first.
    fn commits(&self) -> Result<Vec<CommitInfo>>;

    /// Paths touched by `commit` relative to its first parent.
    /// A root commit is compared with the empty tree.
    fn changes(&self, commit: &CommitInfo) -> Result<Vec<FileChange>>;

    /// Raw content of `path` at `commit`, `None` when the path does not exist there.
    fn file_at(&self, commit: &str, path: &str) -> Result<Option<Arc<Vec<u8>>>>;

    /// Every file path in the tree of `commit`.
    fn list_files(&self, commit: &str) -> Result<Vec<String>>;

    /// Move the working tree to `commit` using one checkout tier.
    fn checkout(&self, commit: &str, tier: CheckoutTier, problematic: &[String]) -> Result<()>;

    /// Check that the repository is usable.
    fn verify(&self) -> Result<()>;

    fn work_dir(&self) -> &Path;
}

/// Production Java paths added (`only_added`) or modified by `commit`.
///
/// Commits without a parent yield nothing.
pub fn source_diff(
    vcs: &dyn VersionControl,
    commit: &CommitInfo,
    only_added: bool,
) -> Result<Vec<String>> {
    if commit.parent().is_none() {
        return Ok(Vec::new());
    }
    let wanted = if only_added {
        ChangeKind::Added
    } else {
        ChangeKind::Modified
    };
    Ok(vcs
        .changes(commit)?
        .into_iter()
        .filter(|c| c.kind == wanted && is_production_source(&c.path))
        .map(|c| c.path)
        .collect())
}

// ---------------------------------------------------------------------------
// git CLI implementation
// ---------------------------------------------------------------------------

const BLOB_CACHE_ENTRIES: usize = 4096;

/// [`VersionControl`] backed by the `git` executable.
pub struct GitCli {
    dir: PathBuf,
    blobs: Mutex<LruCache<String, Option<Arc<Vec<u8>>>>>,
}

impl GitCli {
    /// Open a repository. The path is made absolute so `work_dir` always
    /// has a final component, even for `.` or `..`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            bail!(MinerError::file_not_found(&dir.display().to_string()));
        }
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;
        let capacity = NonZeroUsize::new(BLOB_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        let git = Self {
            dir,
            blobs: Mutex::new(LruCache::new(capacity)),
        };
        git.verify()?;
        Ok(git)
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .map_err(|e| MinerError::vcs(format!("Failed to run git: {e}")).into())
    }

    /// Run git and return stdout, failing on a non-zero exit.
    fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(MinerError::vcs(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

impl VersionControl for GitCli {
    fn commits(&self) -> Result<Vec<CommitInfo>> {
        let stdout = self.git(&["log", "--format=%H%x1f%P%x1f%an%x1f%ct%x1f%B%x1e", "HEAD"])?;
        let text = String::from_utf8_lossy(&stdout);
        text.split('\x1e')
            .map(|record| record.trim_start_matches('\n'))
            .filter(|record| !record.trim().is_empty())
            .map(parse_log_record)
            .collect()
    }

    fn changes(&self, commit: &CommitInfo) -> Result<Vec<FileChange>> {
        let stdout = match commit.parent() {
            Some(parent) => self.git(&[
                "diff-tree",
                "-r",
                "-z",
                "--no-renames",
                "--name-status",
                parent,
                &commit.id,
            ])?,
            None => self.git(&[
                "diff-tree",
                "-r",
                "-z",
                "--root",
                "--no-renames",
                "--no-commit-id",
                "--name-status",
                &commit.id,
            ])?,
        };
        Ok(parse_name_status(&stdout))
    }

    fn file_at(&self, commit: &str, path: &str) -> Result<Option<Arc<Vec<u8>>>> {
        let key = format!("{commit}:{path}");
        if let Ok(mut cache) = self.blobs.lock()
            && let Some(hit) = cache.get(&key)
        {
            return Ok(hit.clone());
        }

        let output = self.run(&["cat-file", "blob", &key])?;
        let content = output
            .status
            .success()
            .then(|| Arc::new(output.stdout));

        if let Ok(mut cache) = self.blobs.lock() {
            cache.put(key, content.clone());
        }
        Ok(content)
    }

    fn list_files(&self, commit: &str) -> Result<Vec<String>> {
        let stdout = self.git(&["ls-tree", "-r", "-z", "--name-only", commit])?;
        Ok(stdout
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    fn checkout(&self, commit: &str, tier: CheckoutTier, problematic: &[String]) -> Result<()> {
        let attempt = || -> Result<()> {
            match tier {
                CheckoutTier::Forced => {
                    self.git(&["clean", "-fd"])?;
                    self.git(&["reset", "--hard"])?;
                }
                CheckoutTier::Stashed => {
                    let stash = self.run(&["stash", "push", "--include-untracked"])?;
                    // 退避できなくても強制 checkout に進む
                    debug!(
                        commit,
                        stashed = stash.status.success(),
                        output = %String::from_utf8_lossy(&stash.stdout).trim(),
                        "Stashed working tree"
                    );
                }
                CheckoutTier::Scrubbed => {
                    self.git(&["reset", "--hard"])?;
                    for rel in problematic {
                        let path = self.dir.join(rel);
                        if path.exists() {
                            std::fs::remove_file(&path)?;
                        }
                    }
                }
            }
            self.git(&["checkout", "--force", "--quiet", commit])?;
            Ok(())
        };
        attempt().map_err(|e| {
            MinerError::new(
                ErrorCode::CheckoutFailed,
                format!("{tier:?} checkout of {commit} failed: {e}"),
            )
            .into()
        })
    }

    fn verify(&self) -> Result<()> {
        self.git(&["rev-parse", "--git-dir"]).map(|_| ())
    }

    fn work_dir(&self) -> &Path {
        &self.dir
    }
}

fn parse_log_record(record: &str) -> Result<CommitInfo> {
    let mut fields = record.splitn(5, '\x1f');
    let mut next = || fields.next().unwrap_or("");
    let id = next().trim().to_string();
    let parents = next()
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let author = next().to_string();
    let secs: i64 = next()
        .trim()
        .parse()
        .map_err(|_| MinerError::vcs(format!("Bad commit timestamp in {id}")))?;
    let message = next().trim_end().to_string();
    let date = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| MinerError::vcs(format!("Timestamp out of range in {id}")))?;

    if id.is_empty() {
        bail!(MinerError::vcs("Empty commit id in git log output"));
    }
    Ok(CommitInfo {
        id,
        parents,
        author,
        date,
        message,
    })
}

/// Parse `--name-status -z` output: alternating status and path fields.
fn parse_name_status(stdout: &[u8]) -> Vec<FileChange> {
    let mut fields = stdout.split(|&b| b == 0).filter(|s| !s.is_empty());
    let mut changes = Vec::new();
    while let (Some(status), Some(path)) = (fields.next(), fields.next()) {
        let kind = match status.first() {
            Some(b'A') => ChangeKind::Added,
            Some(b'D') => ChangeKind::Deleted,
            _ => ChangeKind::Modified,
        };
        changes.push(FileChange {
            path: String::from_utf8_lossy(path).into_owned(),
            kind,
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_record() {
        let record = "abc123\x1fp1 p2\x1fAlice\x1f1700000000\x1fPRJ-1: fix\n\nbody\n";
        let c = parse_log_record(record).unwrap();
        assert_eq!(c.id, "abc123");
        assert_eq!(c.parents, vec!["p1", "p2"]);
        assert_eq!(c.author, "Alice");
        assert_eq!(c.date.timestamp(), 1_700_000_000);
        assert_eq!(c.message, "PRJ-1: fix\n\nbody");
    }

    #[test]
    fn test_parse_log_record_root() {
        let c = parse_log_record("abc\x1f\x1fBob\x1f1\x1finit").unwrap();
        assert!(c.parent().is_none());
    }

    #[test]
    fn test_parse_name_status() {
        let out = b"A\0src/A.java\0M\0src/B.java\0D\0src/C.java\0T\0src/D.java\0";
        let changes = parse_name_status(out);
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0].kind, ChangeKind::Added);
        assert_eq!(changes[1].kind, ChangeKind::Modified);
        assert_eq!(changes[2].kind, ChangeKind::Deleted);
        assert_eq!(changes[3].kind, ChangeKind::Modified);
        assert_eq!(changes[3].path, "src/D.java");
    }

    #[test]
    fn test_open_rejects_missing_dir() {
        assert!(GitCli::open("/nonexistent/defect-miner-repo").is_err());
    }

    #[test]
    fn test_open_resolves_relative_dir() {
        let root = tempfile::TempDir::new().unwrap();
        let repo = root.path().join("proj");
        std::fs::create_dir_all(repo.join("sub")).unwrap();
        let status = Command::new("git")
            .args(["init", "-q"])
            .current_dir(&repo)
            .status()
            .unwrap();
        assert!(status.success());

        let git = GitCli::open(repo.join("sub").join("..")).unwrap();
        assert!(git.work_dir().is_absolute());
        assert_eq!(git.work_dir().file_name().unwrap(), "proj");
    }
}
