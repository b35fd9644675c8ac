//! Persistent per-commit method cache, sharded across size-bounded JSON files.
//!
//! Each shard is one JSON object: commit id → (`class#method` → record).
//! A commit lives in exactly one shard and its entry is never rewritten.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, Visitor};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::engine::parser;
use crate::error::{ErrorCode, MinerError};
use crate::models::method::MethodRecord;

/// Method records of one commit, keyed by `class#method`.
pub type CommitMethods = BTreeMap<String, MethodRecord>;

/// Shards are only appended to while below this share of the maximum size.
const FILL_RATIO: f64 = 0.9;

/// Written into a resize staging dir once every new shard is in it.
/// Holds the number of new shards.
const STAGING_COMPLETE: &str = "COMPLETE";

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_shard_bytes: u64,
    pub chunk_size: usize,
}

impl CacheLimits {
    fn fill_limit(&self) -> u64 {
        (self.max_shard_bytes as f64 * FILL_RATIO) as u64
    }
}

impl From<&CacheConfig> for CacheLimits {
    fn from(c: &CacheConfig) -> Self {
        Self {
            max_shard_bytes: c.max_shard_mb * 1024 * 1024,
            chunk_size: c.chunk_size.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStat {
    pub name: String,
    pub bytes: u64,
    pub commits: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub project: String,
    pub dir: String,
    pub shards: Vec<ShardStat>,
    pub total_commits: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResizeReport {
    pub performed: bool,
    pub shards_before: usize,
    pub shards_after: usize,
    pub commits: usize,
    pub duplicates_dropped: usize,
}

pub struct CommitCache {
    dir: PathBuf,
    project: String,
    limits: CacheLimits,
    entries: DashMap<String, Arc<CommitMethods>>,
    pending: DashSet<String>,
    save_lock: Mutex<()>,
}

impl CommitCache {
    pub fn open(dir: impl Into<PathBuf>, project: &str, limits: CacheLimits) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache dir: {}", dir.display()))?;
        let cache = Self {
            dir,
            project: project.to_string(),
            limits,
            entries: DashMap::new(),
            pending: DashSet::new(),
            save_lock: Mutex::new(()),
        };
        cache.recover_interrupted_resize()?;
        Ok(cache)
    }

    // -----------------------------------------------------------------------
    // In-memory view
    // -----------------------------------------------------------------------

    /// Load the wanted commits from disk into memory. Returns how many are present.
    pub fn warm(&self, wanted: Option<&HashSet<String>>) -> Result<usize> {
        let loaded = self.load(wanted)?;
        let count = loaded.len();
        for (commit, methods) in loaded {
            self.entries.entry(commit).or_insert_with(|| Arc::new(methods));
        }
        Ok(count)
    }

    pub fn contains(&self, commit: &str) -> bool {
        self.entries.contains_key(commit)
    }

    pub fn get(&self, commit: &str) -> Option<Arc<CommitMethods>> {
        self.entries.get(commit).map(|e| Arc::clone(e.value()))
    }

    /// Record a freshly analyzed commit. Existing entries are kept as they are.
    pub fn insert(&self, commit: &str, methods: CommitMethods) -> bool {
        if self.entries.contains_key(commit) {
            return false;
        }
        self.entries
            .insert(commit.to_string(), Arc::new(methods));
        self.pending.insert(commit.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Write every not-yet-persisted entry to disk.
    pub fn persist(&self) -> Result<usize> {
        let batch: HashMap<String, CommitMethods> = self
            .pending
            .iter()
            .filter_map(|k| {
                self.get(k.key())
                    .map(|m| (k.key().clone(), m.as_ref().clone()))
            })
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }
        let written = self.save(&batch)?;
        for commit in batch.keys() {
            self.pending.remove(commit);
        }
        Ok(written)
    }

    // -----------------------------------------------------------------------
    // Disk operations
    // -----------------------------------------------------------------------

    /// Read cached commits, optionally only those in `wanted`.
    ///
    /// Oversized shards are rebalanced first. When a commit appears in more
    /// than one shard the first shard wins.
    pub fn load(
        &self,
        wanted: Option<&HashSet<String>>,
    ) -> Result<HashMap<String, CommitMethods>> {
        self.resize_if_needed()?;

        let want = match wanted {
            Some(set) => Want::Only(set),
            None => Want::All,
        };
        let mut out = HashMap::new();
        for shard in self.shard_files()? {
            let Some(read) = self.read_shard(&shard.path, want)? else {
                continue;
            };
            for (commit, methods) in read.entries {
                out.entry(commit).or_insert(methods);
            }
        }
        debug!(project = %self.project, commits = out.len(), "Loaded commit cache");
        Ok(out)
    }

    /// Append commits not yet on disk to the smallest shard, opening a new
    /// shard when the smallest one would pass 90% of the maximum size.
    pub fn save(&self, new_entries: &HashMap<String, CommitMethods>) -> Result<usize> {
        let _guard = self
            .save_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let limit = self.limits.fill_limit();

        let mut shards: Vec<ShardState> = Vec::new();
        let mut present: HashSet<String> = HashSet::new();
        let mut next_index = 0;
        for file in self.shard_files()? {
            next_index = next_index.max(file.index + 1);
            let Some(read) = self.read_shard(&file.path, Want::KeysOnly)? else {
                continue;
            };
            present.extend(read.keys);
            let bytes = fs::metadata(&file.path).map(|m| m.len()).unwrap_or(0);
            shards.push(ShardState {
                path: file.path,
                size: bytes,
                entries: None,
                dirty: false,
            });
        }

        let mut commits: Vec<&String> = new_entries.keys().collect();
        commits.sort();
        let mut written = 0;
        for commit in commits {
            if !present.insert(commit.clone()) {
                continue;
            }
            let methods = &new_entries[commit];
            let added = entry_size(commit, methods)?;

            let target = shards
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.size)
                .map(|(i, _)| i)
                .filter(|&i| shards[i].size + added + 1 <= limit);
            let idx = match target {
                Some(i) => i,
                None => {
                    shards.push(ShardState::fresh(self.shard_path(next_index)));
                    next_index += 1;
                    shards.len() - 1
                }
            };

            let shard = &mut shards[idx];
            if shard.entries.is_none() {
                let full = self
                    .read_shard(&shard.path, Want::All)?
                    .map(|r| r.entries)
                    .unwrap_or_default();
                shard.size = map_size(&full)?;
                shard.entries = Some(full);
            }
            if let Some(entries) = shard.entries.as_mut() {
                shard.size += added + u64::from(!entries.is_empty());
                entries.insert(commit.clone(), methods.clone());
                shard.dirty = true;
                written += 1;
            }
        }

        for shard in shards.iter().filter(|s| s.dirty) {
            if let Some(entries) = &shard.entries {
                write_shard(&shard.path, entries)?;
            }
        }
        if written > 0 {
            info!(project = %self.project, commits = written, "Saved commit cache");
        }
        Ok(written)
    }

    /// Rebalance only when some shard exceeds the maximum size.
    pub fn resize_if_needed(&self) -> Result<ResizeReport> {
        let oversized = self.shard_files()?.iter().any(|f| {
            fs::metadata(&f.path).is_ok_and(|m| m.len() > self.limits.max_shard_bytes)
        });
        if oversized {
            self.resize()
        } else {
            Ok(ResizeReport::default())
        }
    }

    /// Deduplicate every shard and redistribute all commits into fresh shards.
    ///
    /// Duplicates keep the entry with the lower age. Commits move in chunks
    /// placed on the least full shard that still has room.
    pub fn resize(&self) -> Result<ResizeReport> {
        let _guard = self
            .save_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let files = self.shard_files()?;
        let mut report = ResizeReport {
            performed: true,
            shards_before: files.len(),
            ..Default::default()
        };

        let mut merged: BTreeMap<String, CommitMethods> = BTreeMap::new();
        let mut sources = Vec::new();
        for file in &files {
            let Some(read) = self.read_shard(&file.path, Want::All)? else {
                continue;
            };
            sources.push(file.path.clone());
            for (commit, methods) in read.entries {
                match merged.get(&commit) {
                    Some(existing) => {
                        report.duplicates_dropped += 1;
                        if min_age(&methods) < min_age(existing) {
                            merged.insert(commit, methods);
                        }
                    }
                    None => {
                        merged.insert(commit, methods);
                    }
                }
            }
        }
        report.commits = merged.len();

        let bins = self.pack(&merged)?;
        let staging = self.staging_dir(unix_millis());
        fs::create_dir_all(&staging)?;
        for (i, bin) in bins.iter().enumerate() {
            write_shard_refs(&staging.join(self.shard_name(i)), bin)?;
        }
        fs::write(staging.join(STAGING_COMPLETE), bins.len().to_string())?;
        self.commit_staging(&staging, bins.len(), &sources)?;

        report.shards_after = bins.len();
        info!(
            project = %self.project,
            before = report.shards_before,
            after = report.shards_after,
            commits = report.commits,
            duplicates = report.duplicates_dropped,
            "Resized commit cache"
        );
        Ok(report)
    }

    fn staging_dir(&self, stamp: u128) -> PathBuf {
        self.dir.join(format!(".{}-resize-{stamp}", self.project))
    }

    /// Move staged shards into place, then drop the sources nothing replaced.
    ///
    /// Every rename overwrites atomically, so an interruption leaves each
    /// commit either in a moved shard, an old source or the staging dir.
    /// The new shards are exactly indexes `0..count`.
    fn commit_staging(&self, staging: &Path, count: usize, sources: &[PathBuf]) -> Result<()> {
        let mut staged: Vec<PathBuf> = fs::read_dir(staging)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        staged.sort();

        for path in &staged {
            fs::rename(path, self.dir.join(file_name(path)))
                .with_context(|| format!("Failed to move staged shard: {}", path.display()))?;
        }
        let placed: HashSet<PathBuf> = (0..count).map(|i| self.shard_path(i)).collect();
        for path in sources.iter().filter(|p| !placed.contains(*p)) {
            if path.exists() {
                fs::remove_file(path)
                    .with_context(|| format!("Failed to remove old shard: {}", path.display()))?;
            }
        }
        fs::remove_dir_all(staging)?;
        Ok(())
    }

    /// Finish or discard a resize that a previous process did not complete.
    ///
    /// A complete staging dir holds every commit, so it replaces all current
    /// shards. An incomplete one never touched them and is removed.
    fn recover_interrupted_resize(&self) -> Result<()> {
        let prefix = format!(".{}-resize-", self.project);
        let mut leftovers: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir() && file_name(p).starts_with(&prefix))
            .collect();
        leftovers.sort();

        for staging in leftovers {
            let count = fs::read_to_string(staging.join(STAGING_COMPLETE))
                .ok()
                .and_then(|c| c.trim().parse::<usize>().ok());
            if let Some(count) = count {
                let sources: Vec<PathBuf> =
                    self.shard_files()?.into_iter().map(|f| f.path).collect();
                warn!(staging = %staging.display(), count, "Completing interrupted cache resize");
                self.commit_staging(&staging, count, &sources)?;
            } else {
                warn!(staging = %staging.display(), "Discarding incomplete cache resize");
                fs::remove_dir_all(&staging)?;
            }
        }
        Ok(())
    }

    /// Bin-pack commits in chunks onto the least full bin with room.
    fn pack<'a>(
        &self,
        merged: &'a BTreeMap<String, CommitMethods>,
    ) -> Result<Vec<BTreeMap<&'a str, &'a CommitMethods>>> {
        let limit = self.limits.fill_limit();
        let sized: Vec<(&str, &CommitMethods, u64)> = merged
            .iter()
            .map(|(k, v)| -> Result<_> { Ok((k.as_str(), v, entry_size(k, v)?)) })
            .collect::<Result<_>>()?;

        let mut bins: Vec<(u64, BTreeMap<&str, &CommitMethods>)> = Vec::new();
        let mut place = |group: &[(&'a str, &'a CommitMethods, u64)]| {
            let bytes: u64 = group.iter().map(|(_, _, s)| s + 1).sum();
            let slot = bins
                .iter()
                .enumerate()
                .filter(|(_, (size, _))| size + bytes <= limit)
                .min_by_key(|(_, (size, _))| *size)
                .map(|(i, _)| i);
            let idx = slot.unwrap_or_else(|| {
                bins.push((2, BTreeMap::new()));
                bins.len() - 1
            });
            let bin = &mut bins[idx];
            for (k, v, _) in group {
                bin.1.insert(*k, *v);
            }
            bin.0 += bytes;
        };

        for chunk in sized.chunks(self.limits.chunk_size) {
            let bytes: u64 = chunk.iter().map(|(_, _, s)| s + 1).sum();
            if bytes + 2 <= limit {
                place(chunk);
            } else {
                for single in chunk.chunks(1) {
                    place(single);
                }
            }
        }
        Ok(bins.into_iter().map(|(_, b)| b).collect())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut shards = Vec::new();
        for file in self.shard_files()? {
            let Some(read) = self.read_shard(&file.path, Want::KeysOnly)? else {
                continue;
            };
            shards.push(ShardStat {
                name: file_name(&file.path),
                bytes: fs::metadata(&file.path).map(|m| m.len()).unwrap_or(0),
                commits: read.keys.len(),
            });
        }
        Ok(CacheStats {
            project: self.project.clone(),
            dir: self.dir.display().to_string(),
            total_commits: shards.iter().map(|s| s.commits).sum(),
            total_bytes: shards.iter().map(|s| s.bytes).sum(),
            shards,
        })
    }

    // -----------------------------------------------------------------------
    // Shard files
    // -----------------------------------------------------------------------

    fn shard_name(&self, index: usize) -> String {
        format!("{}_commit_cache_{index:03}.json", self.project)
    }

    fn shard_path(&self, index: usize) -> PathBuf {
        self.dir.join(self.shard_name(index))
    }

    /// Shard files of this project ordered by index.
    ///
    /// Recognizes `<p>_commit_cache_NNN.json` as well as the older
    /// `<p>_commit_cache.json` and `<p>_commit_cacheN.json`.
    fn shard_files(&self) -> Result<Vec<ShardFile>> {
        let prefix = format!("{}_commit_cache", self.project);
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = file_name(&path);
            let Some(index) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|rest| {
                    let digits = rest.strip_prefix('_').unwrap_or(rest);
                    if digits.is_empty() {
                        Some(0)
                    } else {
                        digits.parse::<usize>().ok()
                    }
                })
            else {
                continue;
            };
            files.push(ShardFile { path, index });
        }
        files.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }

    /// Parse a shard. Corrupt shards are moved aside and yield `None`.
    fn read_shard(&self, path: &Path, want: Want<'_>) -> Result<Option<ShardRead>> {
        let utf8 = Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|p| {
            MinerError::new(
                ErrorCode::CacheError,
                format!("Non UTF-8 shard path: {}", p.display()),
            )
        })?;
        let bytes = parser::read_file(&utf8)?;
        if bytes.is_empty() {
            return Ok(Some(ShardRead::default()));
        }
        let mut de = serde_json::Deserializer::from_slice(&bytes);
        let parsed = ShardSeed { want }
            .deserialize(&mut de)
            .and_then(|read| de.end().map(|_| read));
        match parsed {
            Ok(read) => Ok(Some(read)),
            Err(e) => {
                drop(bytes);
                let quarantine = path.with_extension("json.corrupt");
                warn!(
                    shard = %path.display(),
                    moved_to = %quarantine.display(),
                    error = %e,
                    "Corrupt cache shard skipped"
                );
                fs::rename(path, &quarantine).with_context(|| {
                    format!("Failed to quarantine shard: {}", path.display())
                })?;
                Ok(None)
            }
        }
    }
}

struct ShardFile {
    path: PathBuf,
    index: usize,
}

struct ShardState {
    path: PathBuf,
    size: u64,
    entries: Option<BTreeMap<String, CommitMethods>>,
    dirty: bool,
}

impl ShardState {
    fn fresh(path: PathBuf) -> Self {
        Self {
            path,
            size: 2,
            entries: Some(BTreeMap::new()),
            dirty: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming shard reader
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Want<'a> {
    All,
    Only(&'a HashSet<String>),
    KeysOnly,
}

#[derive(Default)]
struct ShardRead {
    entries: BTreeMap<String, CommitMethods>,
    keys: Vec<String>,
}

/// Deserializes a shard while skipping the values of unwanted commits.
struct ShardSeed<'a> {
    want: Want<'a>,
}

impl<'de> DeserializeSeed<'de> for ShardSeed<'_> {
    type Value = ShardRead;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ShardSeed<'_> {
    type Value = ShardRead;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object keyed by commit id")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut read = ShardRead::default();
        while let Some(commit) = map.next_key::<String>()? {
            let keep = match self.want {
                Want::All => true,
                Want::Only(set) => set.contains(&commit),
                Want::KeysOnly => false,
            };
            if keep {
                let methods: CommitMethods = map.next_value()?;
                read.keys.push(commit.clone());
                read.entries.entry(commit).or_insert(methods);
            } else {
                map.next_value::<IgnoredAny>()?;
                read.keys.push(commit);
            }
        }
        Ok(read)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compact-JSON size of `"commit":{...}`.
fn entry_size(commit: &str, methods: &CommitMethods) -> Result<u64> {
    let key = serde_json::to_string(commit)?.len();
    let value = serde_json::to_vec(methods)?.len();
    Ok((key + 1 + value) as u64)
}

/// Compact-JSON size of a whole shard object.
fn map_size(entries: &BTreeMap<String, CommitMethods>) -> Result<u64> {
    let mut size = 2;
    for (i, (k, v)) in entries.iter().enumerate() {
        size += entry_size(k, v)? + u64::from(i > 0);
    }
    Ok(size)
}

/// Lowest age among a commit's records; "more recently observed" wins ties on duplicates.
fn min_age(methods: &CommitMethods) -> i64 {
    methods.values().map(|m| m.age).min().unwrap_or(i64::MAX)
}

fn write_shard(path: &Path, entries: &BTreeMap<String, CommitMethods>) -> Result<()> {
    write_atomic(path, &serde_json::to_vec(entries)?)
}

fn write_shard_refs(path: &Path, entries: &BTreeMap<&str, &CommitMethods>) -> Result<()> {
    write_atomic(path, &serde_json::to_vec(entries)?)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class: &str, method: &str, age: i64) -> MethodRecord {
        MethodRecord {
            file_path: format!("{class}.{method}"),
            method_name: method.into(),
            class_name: class.into(),
            loc: 12,
            wmc: 3,
            qty_assignment: 2,
            qty_math_operations: 1,
            qty_try_catch: 1,
            qty_return: 2,
            fanin: 4,
            fanout: 5,
            age,
            n_auth: 2,
            nr: 7,
            n_smells: 1,
            buggy: true,
            release: String::new(),
        }
    }

    fn methods(n: usize, age: i64) -> CommitMethods {
        (0..n)
            .map(|i| {
                let r = record("src/a/Foo.java", &format!("m{i}/0"), age);
                (r.key(), r)
            })
            .collect()
    }

    fn cache(dir: &Path, max_bytes: u64) -> CommitCache {
        CommitCache::open(
            dir,
            "proj",
            CacheLimits {
                max_shard_bytes: max_bytes,
                chunk_size: 2,
            },
        )
        .unwrap()
    }

    fn shard_sizes(dir: &Path) -> Vec<u64> {
        let mut sizes: Vec<u64> = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
            .map(|e| e.metadata().unwrap().len())
            .collect();
        sizes.sort();
        sizes
    }

    #[test]
    fn test_save_load_round_trip_is_exact() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = cache(dir.path(), 1 << 20);
        let mut batch = HashMap::new();
        batch.insert("c1".to_string(), methods(3, 10));
        assert_eq!(c.save(&batch).unwrap(), 1);

        let loaded = c.load(None).unwrap();
        assert_eq!(loaded["c1"], batch["c1"]);
    }

    #[test]
    fn test_save_skips_commits_already_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = cache(dir.path(), 1 << 20);
        let mut batch = HashMap::new();
        batch.insert("c1".to_string(), methods(1, 10));
        c.save(&batch).unwrap();

        batch.insert("c1".to_string(), methods(2, 99));
        batch.insert("c2".to_string(), methods(1, 10));
        assert_eq!(c.save(&batch).unwrap(), 1);

        let loaded = c.load(None).unwrap();
        assert_eq!(loaded["c1"].len(), 1);
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_load_with_filter() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = cache(dir.path(), 1 << 20);
        let batch: HashMap<_, _> = ["a", "b", "c"]
            .iter()
            .map(|k| (k.to_string(), methods(1, 1)))
            .collect();
        c.save(&batch).unwrap();

        let wanted: HashSet<String> = ["b".to_string(), "zzz".to_string()].into();
        let loaded = c.load(Some(&wanted)).unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_new_shard_opened_near_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let one = entry_size("c0", &methods(2, 1)).unwrap();
        // room for two entries per shard under the 90% fill limit
        let max = ((2 + 2 * (one + 1)) as f64 / FILL_RATIO).ceil() as u64 + 1;
        let c = cache(dir.path(), max);

        for i in 0..5 {
            let mut batch = HashMap::new();
            batch.insert(format!("c{i}"), methods(2, 1));
            c.save(&batch).unwrap();
        }

        let stats = c.stats().unwrap();
        assert_eq!(stats.total_commits, 5);
        assert_eq!(stats.shards.len(), 3);
        assert!(stats.shards.iter().all(|s| s.bytes <= max));
    }

    #[test]
    fn test_resize_dedupes_and_bounds_shards() {
        let dir = tempfile::TempDir::new().unwrap();
        // Two legacy shards sharing commit "dup", one of them far too large
        let mut big: BTreeMap<String, CommitMethods> = BTreeMap::new();
        for i in 0..12 {
            big.insert(format!("c{i:02}"), methods(3, 50));
        }
        big.insert("dup".into(), methods(1, 50));
        write_shard(&dir.path().join("proj_commit_cache.json"), &big).unwrap();

        let mut small: BTreeMap<String, CommitMethods> = BTreeMap::new();
        small.insert("dup".into(), methods(1, 5));
        small.insert("z".into(), methods(1, 5));
        write_shard(&dir.path().join("proj_commit_cache2.json"), &small).unwrap();

        let per_entry = entry_size("c00", &methods(3, 50)).unwrap();
        let max = per_entry * 5;
        let c = cache(dir.path(), max);

        let report = c.resize_if_needed().unwrap();
        assert!(report.performed);
        assert_eq!(report.duplicates_dropped, 1);
        assert_eq!(report.commits, 14);

        assert!(shard_sizes(dir.path()).iter().all(|&s| s <= max));
        let loaded = c.load(None).unwrap();
        assert_eq!(loaded.len(), 14);
        assert_eq!(loaded["dup"].values().next().unwrap().age, 5);
        assert!(!dir.path().join("proj_commit_cache.json").exists());
    }

    /// One oversized shard of eight commits, with room for about three per shard.
    fn big_cache(dir: &Path) -> (CommitCache, u64, BTreeMap<String, CommitMethods>) {
        let mut shard: BTreeMap<String, CommitMethods> = BTreeMap::new();
        for i in 0..8 {
            shard.insert(format!("c{i}"), methods(3, 1));
        }
        write_shard(&dir.join("proj_commit_cache_000.json"), &shard).unwrap();
        let max = entry_size("c0", &methods(3, 1)).unwrap() * 4;
        (cache(dir, max), max, shard)
    }

    #[test]
    fn test_open_completes_interrupted_resize() {
        let dir = tempfile::TempDir::new().unwrap();
        let (c, max, merged) = big_cache(dir.path());

        // Staging written and marked complete
        let staging = c.staging_dir(1);
        fs::create_dir_all(&staging).unwrap();
        let bins = c.pack(&merged).unwrap();
        assert!(bins.len() > 1);
        for (i, bin) in bins.iter().enumerate() {
            write_shard_refs(&staging.join(c.shard_name(i)), bin).unwrap();
        }
        fs::write(staging.join(STAGING_COMPLETE), bins.len().to_string()).unwrap();
        // the first staged shard already replaced its source
        fs::rename(
            staging.join(c.shard_name(0)),
            dir.path().join(c.shard_name(0)),
        )
        .unwrap();
        drop(c);

        let reopened = cache(dir.path(), max);
        assert!(!staging.exists());
        let loaded = reopened.load(None).unwrap();
        assert_eq!(loaded.len(), 8);
        assert_eq!(reopened.stats().unwrap().shards.len(), bins.len());
    }

    #[test]
    fn test_open_discards_incomplete_resize() {
        let dir = tempfile::TempDir::new().unwrap();
        let (c, max, _) = big_cache(dir.path());
        let staging = c.staging_dir(1);
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join(c.shard_name(0)), "{\"c0\":{}}").unwrap();
        drop(c);

        let reopened = cache(dir.path(), max);
        assert!(!staging.exists());
        assert_eq!(reopened.load(None).unwrap().len(), 8);
    }

    #[test]
    fn test_resize_leaves_no_staging_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let (c, max, _) = big_cache(dir.path());
        let report = c.resize().unwrap();
        assert_eq!(report.commits, 8);
        assert!(report.shards_after > 1);
        assert!(shard_sizes(dir.path()).iter().all(|&s| s <= max));

        let hidden = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(hidden, 0);
        assert_eq!(c.load(None).unwrap().len(), 8);
    }

    #[test]
    fn test_corrupt_shard_is_quarantined() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("proj_commit_cache_000.json"), "{not json").unwrap();
        let c = cache(dir.path(), 1 << 20);

        assert!(c.load(None).unwrap().is_empty());
        assert!(dir.path().join("proj_commit_cache_000.json.corrupt").exists());

        let mut batch = HashMap::new();
        batch.insert("c1".to_string(), methods(1, 1));
        c.save(&batch).unwrap();
        assert_eq!(c.load(None).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_and_persist() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = cache(dir.path(), 1 << 20);
        assert!(c.insert("c1", methods(1, 1)));
        assert!(!c.insert("c1", methods(2, 1)));
        assert_eq!(c.pending_len(), 1);
        assert_eq!(c.persist().unwrap(), 1);
        assert_eq!(c.pending_len(), 0);
        assert_eq!(c.persist().unwrap(), 0);

        let reopened = cache(dir.path(), 1 << 20);
        let wanted: HashSet<String> = ["c1".to_string()].into();
        assert_eq!(reopened.warm(Some(&wanted)).unwrap(), 1);
        assert!(reopened.contains("c1"));
        assert_eq!(reopened.get("c1").unwrap().len(), 1);
    }

    #[test]
    fn test_other_projects_are_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("other_commit_cache.json"), "{}").unwrap();
        fs::write(dir.path().join("proj_commit_cache_notes.json"), "{}").unwrap();
        let c = cache(dir.path(), 1 << 20);
        assert!(c.stats().unwrap().shards.is_empty());
    }
}
