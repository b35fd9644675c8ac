use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::info;

use super::DatasetSink;
use crate::models::dataset::{DatasetKind, DatasetReport};
use crate::models::method::MethodRecord;

pub const HEADER: &str = "release,class,method,path,loc,wmc,assignmentsQty,mathOperationsQty,qtyTryCatch,qtyReturn,fanin,fanout,age,nAuth,nr,nSmell,buggy";

/// Writes `<PROJECT><Kind><id>.csv` files under the output directory.
#[derive(Debug, Clone)]
pub struct CsvDatasetWriter {
    root: PathBuf,
    project: String,
}

impl CsvDatasetWriter {
    pub fn new(root: impl Into<PathBuf>, project: &str) -> Self {
        Self {
            root: root.into(),
            project: project.to_uppercase(),
        }
    }
}

impl DatasetSink for CsvDatasetWriter {
    fn path_for(&self, kind: DatasetKind, release_id: u32) -> PathBuf {
        let dir = match kind.subdir() {
            Some(sub) => self.root.join(sub),
            None => self.root.clone(),
        };
        dir.join(format!("{}{}{release_id}.csv", self.project, kind.label()))
    }

    fn is_complete(&self, kind: DatasetKind, release_id: u32) -> bool {
        fs::metadata(self.path_for(kind, release_id)).is_ok_and(|m| m.len() > 0)
    }

    fn write(
        &self,
        kind: DatasetKind,
        release_id: u32,
        release_name: &str,
        methods: &[&MethodRecord],
    ) -> Result<DatasetReport> {
        let path = self.path_for(kind, release_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut rows: Vec<&MethodRecord> = methods.iter().copied().filter(|m| m.age >= 0).collect();
        rows.sort_by_cached_key(|m| m.key());

        let mut out = String::with_capacity(128 * (rows.len() + 1));
        out.push_str(HEADER);
        out.push('\n');
        for m in &rows {
            let release = if m.release.is_empty() {
                release_name
            } else {
                m.release.as_str()
            };
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                escape(release),
                escape(&m.class_name),
                escape(&m.method_name),
                escape(&m.file_path),
                m.loc,
                m.wmc,
                m.qty_assignment,
                m.qty_math_operations,
                m.qty_try_catch,
                m.qty_return,
                m.fanin,
                m.fanout,
                m.age,
                m.n_auth,
                m.nr,
                m.n_smells,
                m.buggy,
            );
        }

        let tmp = temp_path(&path);
        fs::write(&tmp, out).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        let buggy = rows.iter().filter(|m| m.buggy).count();
        info!(path = %path.display(), rows = rows.len(), buggy, ?kind, "Wrote dataset");
        Ok(DatasetReport {
            release: release_name.to_string(),
            kind,
            path: path.display().to_string(),
            rows: rows.len(),
            buggy,
            skipped: false,
        })
    }
}

/// Temp file private to one write, so concurrent writers of the same
/// dataset never interleave before the rename.
fn temp_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("csv.{}-{seq}.tmp", std::process::id()))
}

fn escape(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class: &str, method: &str, age: i64, buggy: bool) -> MethodRecord {
        MethodRecord {
            class_name: class.into(),
            method_name: method.into(),
            file_path: format!("{class}.{method}"),
            loc: 5,
            age,
            buggy,
            ..Default::default()
        }
    }

    #[test]
    fn test_paths_by_kind() {
        let w = CsvDatasetWriter::new("/out", "avro");
        assert_eq!(
            w.path_for(DatasetKind::Training, 3),
            PathBuf::from("/out/AVROTraining3.csv")
        );
        assert_eq!(
            w.path_for(DatasetKind::Test, 3),
            PathBuf::from("/out/tests/AVROTesting3.csv")
        );
        assert_eq!(
            w.path_for(DatasetKind::Partial, 1),
            PathBuf::from("/out/partials/AVROPartial1.csv")
        );
    }

    #[test]
    fn test_write_sorts_filters_and_escapes() {
        let dir = tempfile::TempDir::new().unwrap();
        let w = CsvDatasetWriter::new(dir.path(), "proj");
        let b = record("b/B.java", "m/0", 3, true);
        let a = record("a/A.java", "f/2[Map<K,V>,int]", 1, false);
        let gone = record("x/X.java", "g/0", -1, true);
        let mut tagged = record("a/A.java", "e/0", 0, false);
        tagged.release = "0.9".into();

        assert!(!w.is_complete(DatasetKind::Training, 2));
        let report = w
            .write(DatasetKind::Training, 2, "1.0", &[&b, &a, &gone, &tagged])
            .unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(report.buggy, 1);
        assert!(w.is_complete(DatasetKind::Training, 2));

        let text = fs::read_to_string(w.path_for(DatasetKind::Training, 2)).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[1], "0.9,a/A.java,e/0,a/A.java.e/0,5,0,0,0,0,0,0,0,0,0,0,0,false");
        assert!(lines[2].starts_with("1.0,a/A.java,\"f/2[Map<K,V>,int]\","));
        assert!(lines[3].ends_with(",true"));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_concurrent_writes_never_mix() {
        let dir = tempfile::TempDir::new().unwrap();
        let writer = CsvDatasetWriter::new(dir.path(), "proj");
        let batches: Vec<Vec<MethodRecord>> = (0..8)
            .map(|w| {
                (0..200)
                    .map(|i| record(&format!("src/W{w}.java"), &format!("m{i}/0"), 1, false))
                    .collect()
            })
            .collect();

        std::thread::scope(|scope| {
            for batch in &batches {
                let writer = &writer;
                scope.spawn(move || {
                    let refs: Vec<&MethodRecord> = batch.iter().collect();
                    writer.write(DatasetKind::Partial, 2, "2.0", &refs).unwrap();
                });
            }
        });

        let path = writer.path_for(DatasetKind::Partial, 2);
        let written = fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = written.lines().skip(1).collect();
        assert_eq!(rows.len(), 200);
        let class = rows[0].split(',').nth(1).unwrap();
        assert!(rows.iter().all(|r| r.split(',').nth(1) == Some(class)));

        let leftovers = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
