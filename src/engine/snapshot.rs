//! Materialize commit snapshots for analysis.
//!
//! Two modes:
//! - `isolated`: blobs are read straight from the object store into a
//!   per-commit directory. Workers never touch the shared working tree.
//! - `worktree`: the shared working tree is checked out under one lock,
//!   guarded by a full backup that can be restored when the tree gets wedged.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use ignore::WalkBuilder;
use tracing::{debug, info, warn};

use crate::config::{SnapshotConfig, SnapshotMode};
use crate::engine::git::{CheckoutTier, VersionControl};
use crate::error::{ErrorCode, MinerError};
use crate::models::commit::{ChangeKind, CommitInfo, is_production_source};

/// An exported snapshot directory, removed when dropped.
#[derive(Debug)]
pub struct Snapshot {
    pub commit: String,
    pub dir: PathBuf,
    /// Repository-relative paths written into `dir`
    pub files: Vec<String>,
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if self.dir.exists() {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

struct CarriedFile {
    path: String,
    content: Arc<Vec<u8>>,
}

pub struct SnapshotManager {
    vcs: Arc<dyn VersionControl>,
    config: SnapshotConfig,
    export_root: PathBuf,
    restore_pause: Duration,
    checkout_lock: Mutex<()>,
    carry_over: Mutex<VecDeque<CarriedFile>>,
    backup: Mutex<Option<PathBuf>>,
}

impl SnapshotManager {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        config: SnapshotConfig,
        work_dir: &Path,
        restore_pause: Duration,
    ) -> Result<Self> {
        let export_root = work_dir.join("snapshots");
        fs::create_dir_all(&export_root).with_context(|| {
            format!("Failed to create snapshot dir: {}", export_root.display())
        })?;
        Ok(Self {
            vcs,
            config,
            export_root,
            restore_pause,
            checkout_lock: Mutex::new(()),
            carry_over: Mutex::new(VecDeque::new()),
            backup: Mutex::new(None),
        })
    }

    pub fn carry_over_len(&self) -> usize {
        lock(&self.carry_over).len()
    }

    /// Export the sources `commit` touched into a fresh directory.
    ///
    /// At most `export_cap` files are written: files carried over from
    /// earlier commits drain first, and anything past the cap is carried
    /// to the next call.
    pub fn snapshot(&self, commit: &CommitInfo) -> Result<Snapshot> {
        let dir = self.export_root.join(&commit.id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        let mut snapshot = Snapshot {
            commit: commit.id.clone(),
            dir,
            files: Vec::new(),
        };

        let changed: Vec<String> = self
            .vcs
            .changes(commit)?
            .into_iter()
            .filter(|c| c.kind != ChangeKind::Deleted && is_production_source(&c.path))
            .map(|c| c.path)
            .collect();

        match self.config.mode {
            SnapshotMode::Isolated => {
                let fetched = changed
                    .into_iter()
                    .filter_map(|path| match self.vcs.file_at(&commit.id, &path) {
                        Ok(Some(content)) => Some(Ok(CarriedFile { path, content })),
                        Ok(None) => None,
                        Err(e) => Some(Err(e)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.export(&mut snapshot, fetched)?;
            }
            SnapshotMode::Worktree => {
                let _guard = lock(&self.checkout_lock);
                self.checkout_tiered(&commit.id)?;
                let root = self.vcs.work_dir();
                let mut fetched = Vec::with_capacity(changed.len());
                for path in changed {
                    let src = root.join(&path);
                    if src.is_file() {
                        let content = fs::read(&src)
                            .with_context(|| format!("Failed to read {}", src.display()))?;
                        fetched.push(CarriedFile {
                            path,
                            content: Arc::new(content),
                        });
                    }
                }
                self.export(&mut snapshot, fetched)?;
            }
        }

        debug!(
            commit = commit.short_id(),
            files = snapshot.files.len(),
            "Exported snapshot"
        );
        Ok(snapshot)
    }

    fn export(&self, snapshot: &mut Snapshot, fresh: Vec<CarriedFile>) -> Result<()> {
        let cap = self.config.export_cap.max(1);
        let mut batch = Vec::with_capacity(cap.min(fresh.len() + 8));
        {
            let mut carried = lock(&self.carry_over);
            while batch.len() < cap {
                match carried.pop_front() {
                    Some(file) => batch.push(file),
                    None => break,
                }
            }
            let mut fresh = fresh.into_iter();
            batch.extend(fresh.by_ref().take(cap - batch.len()));
            let overflow: Vec<CarriedFile> = fresh.collect();
            if !overflow.is_empty() {
                debug!(
                    commit = %snapshot.commit,
                    carried = overflow.len(),
                    "Export cap reached, carrying files over"
                );
                carried.extend(overflow);
            }
        }

        for file in batch {
            let dest = snapshot.dir.join(&file.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, file.content.as_slice())
                .with_context(|| format!("Failed to export {}", file.path))?;
            snapshot.files.push(file.path);
        }
        Ok(())
    }

    fn checkout_tiered(&self, commit: &str) -> Result<()> {
        let mut last_err = None;
        for tier in CheckoutTier::ALL {
            match self
                .vcs
                .checkout(commit, tier, &self.config.problematic_paths)
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(commit, ?tier, error = %e, "Checkout tier failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            MinerError::new(ErrorCode::CheckoutFailed, format!("Checkout of {commit} failed"))
                .into()
        }))
    }

    // -----------------------------------------------------------------------
    // Backup / restore (worktree mode only)
    // -----------------------------------------------------------------------

    /// Take a full copy of the repository next to it.
    pub fn prepare(&self) -> Result<()> {
        if self.config.mode != SnapshotMode::Worktree {
            return Ok(());
        }
        let mut backup = lock(&self.backup);
        if let Some(stale) = backup.take() {
            self.delete_with_retry(&stale)?;
        }
        let repo = self.vcs.work_dir();
        let target = backup_dir_for(repo)?;
        copy_dir(repo, &target)?;
        info!(backup = %target.display(), "Repository backup created");
        *backup = Some(target);
        Ok(())
    }

    /// Replace the repository with the last backup and drop the backup.
    ///
    /// Calling it again without a new `prepare` is a no-op.
    pub fn restore(&self) -> Result<()> {
        if self.config.mode != SnapshotMode::Worktree {
            return Ok(());
        }
        let _guard = lock(&self.checkout_lock);
        let mut backup = lock(&self.backup);
        let Some(source) = backup.take() else {
            return Ok(());
        };
        let repo = self.vcs.work_dir();

        thread::sleep(self.restore_pause);
        self.delete_with_retry(repo)?;
        copy_dir(&source, repo)?;
        thread::sleep(self.restore_pause);

        if let Err(e) = self.vcs.verify() {
            // バックアップは残して次回起動時の復旧に任せる
            bail!(MinerError::vcs(format!(
                "Restored repository failed verification ({e}); backup kept at {}",
                source.display()
            )));
        }
        self.delete_with_retry(&source)?;
        lock(&self.carry_over).clear();
        info!(repo = %repo.display(), "Repository restored from backup");
        Ok(())
    }

    /// Put back a backup left behind by an interrupted run.
    pub fn recover_stale_backups(&self) -> Result<bool> {
        if self.config.mode != SnapshotMode::Worktree {
            return Ok(false);
        }
        let repo = self.vcs.work_dir();
        let mut stale = find_backups(repo)?;
        let Some(newest) = stale.pop() else {
            return Ok(false);
        };
        warn!(backup = %newest.display(), "Found stale backup, restoring repository");
        self.delete_with_retry(repo)?;
        copy_dir(&newest, repo)?;
        self.vcs.verify()?;
        self.delete_with_retry(&newest)?;
        for older in stale {
            self.delete_with_retry(&older)?;
        }
        Ok(true)
    }

    fn delete_with_retry(&self, path: &Path) -> Result<()> {
        let attempts = self.config.delete_retries.max(1);
        let pause = Duration::from_millis(self.config.delete_retry_ms);
        delete_dir_with_retry(path, attempts, pause)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn backup_dir_for(repo: &Path) -> Result<PathBuf> {
    let name = repo
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MinerError::new(ErrorCode::InvalidRequest, "Repository path has no name"))?;
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    Ok(repo.with_file_name(format!("{name}_backup_{millis}")))
}

/// Backups of `repo`, oldest first.
fn find_backups(repo: &Path) -> Result<Vec<PathBuf>> {
    let (Some(parent), Some(name)) = (repo.parent(), repo.file_name().and_then(|n| n.to_str()))
    else {
        return Ok(Vec::new());
    };
    let prefix = format!("{name}_backup_");
    let mut found: Vec<(u128, PathBuf)> = Vec::new();
    for entry in fs::read_dir(parent)? {
        let path = entry?.path();
        let Some(stamp) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
        else {
            continue;
        };
        if path.is_dir() {
            found.push((stamp.parse().unwrap_or(0), path));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

/// Remove a directory tree, retrying while handles are released.
pub fn delete_dir_with_retry(path: &Path, attempts: u32, pause: Duration) -> Result<()> {
    for attempt in 1..=attempts {
        if !path.exists() {
            return Ok(());
        }
        match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                debug!(path = %path.display(), attempt, error = %e, "Delete failed, retrying");
                thread::sleep(pause);
            }
            Err(e) => {
                bail!(MinerError::new(
                    ErrorCode::IoError,
                    format!("Failed to delete {} after {attempts} attempts: {e}", path.display()),
                ));
            }
        }
    }
    Ok(())
}

/// Copy a directory tree file by file, history metadata included.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let walker = WalkBuilder::new(src)
        .standard_filters(false)
        .follow_links(false)
        .build();
    for entry in walker {
        let entry = entry.map_err(|e| MinerError::new(ErrorCode::IoError, e.to_string()))?;
        let path = entry.path();
        let rel = path.strip_prefix(src)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);
        let Some(kind) = entry.file_type() else {
            continue;
        };
        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else if kind.is_symlink() {
            let link = fs::read_link(path)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            fs::copy(path, &target).map(|_| ())?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(path, &target)
                .with_context(|| format!("Failed to copy {}", path.display()))?;
        }
    }
    Ok(())
}
