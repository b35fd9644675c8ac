//! Turn analyzer and linter output for one snapshot into method records.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use camino::Utf8PathBuf;
use tracing::{debug, warn};

use crate::cache::store::CommitMethods;
use crate::engine::analyzer::{ClassMetrics, MethodMetrics, StaticAnalyzer};
use crate::engine::lint::{Linter, SmellHit, smell_count};
use crate::engine::parser;
use crate::engine::snapshot::Snapshot;
use crate::models::inventory::{ClassRecord, Inventory};
use crate::models::method::{MethodRecord, UNRESOLVED};

/// Outcome of looking up the class record that owns analyzer output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClassMatch<'a> {
    Resolved(&'a ClassRecord),
    Unresolved,
}

pub struct MetricsExtractor {
    analyzer: Arc<dyn StaticAnalyzer>,
    linter: Arc<dyn Linter>,
    module_markers: Vec<String>,
}

impl MetricsExtractor {
    pub fn new(
        analyzer: Arc<dyn StaticAnalyzer>,
        linter: Arc<dyn Linter>,
        module_markers: Vec<String>,
    ) -> Self {
        Self {
            analyzer,
            linter,
            module_markers,
        }
    }

    /// Method records of every class in the snapshot, keyed by `class#method`.
    ///
    /// Class-level attributes come from `classes`; methods of classes that
    /// cannot be matched carry the unresolved sentinel for age and nAuth.
    pub fn extract(&self, snapshot: &Snapshot, classes: &Inventory) -> Result<CommitMethods> {
        let analyzed = self.analyzer.analyze(&snapshot.dir)?;

        let mut hits_by_file: HashMap<String, Option<Vec<SmellHit>>> = HashMap::new();
        let mut records = CommitMethods::new();
        let mut unresolved = 0usize;

        for class in analyzed.iter().filter(|c| !c.methods.is_empty()) {
            let hits = hits_by_file
                .entry(class.file.clone())
                .or_insert_with(|| self.lint_file(&snapshot.dir, &class.file));

            let matched = resolve_class(class, classes, &self.module_markers);
            if matched == ClassMatch::Unresolved {
                unresolved += 1;
            }
            for method in &class.methods {
                let record = to_record(class, method, matched, hits.as_deref());
                records.insert(record.key(), record);
            }
        }

        debug!(
            commit = %snapshot.commit,
            classes = analyzed.len(),
            methods = records.len(),
            unresolved,
            "Extracted method records"
        );
        Ok(records)
    }

    /// Lint hits for one file, `None` when the linter could not run.
    fn lint_file(&self, root: &Path, file: &str) -> Option<Vec<SmellHit>> {
        let path = Utf8PathBuf::from_path_buf(root.join(file)).ok()?;
        let result = parser::read_file(&path).and_then(|source| self.linter.lint(&source));
        match result {
            Ok(hits) => Some(hits),
            Err(e) => {
                warn!(file, error = %e, "Lint failed, smells unknown");
                None
            }
        }
    }
}

fn to_record(
    class: &ClassMetrics,
    method: &MethodMetrics,
    matched: ClassMatch<'_>,
    hits: Option<&[SmellHit]>,
) -> MethodRecord {
    let (class_name, age, n_auth, nr) = match matched {
        ClassMatch::Resolved(owner) => (
            owner.path.clone(),
            owner.age,
            owner.n_auth(),
            owner.revisions,
        ),
        ClassMatch::Unresolved => (class.file.clone(), UNRESOLVED, UNRESOLVED, 0),
    };
    MethodRecord {
        file_path: format!("{}.{}", class.class_name, method.signature),
        method_name: method.signature.clone(),
        class_name,
        loc: method.loc,
        wmc: method.wmc,
        qty_assignment: method.assignments,
        qty_math_operations: method.math_operations,
        qty_try_catch: method.try_catch,
        qty_return: method.returns,
        fanin: method.fanin,
        fanout: method.fanout,
        age,
        n_auth,
        nr,
        n_smells: hits.map_or(UNRESOLVED, |h| {
            smell_count(h, method.start_line, method.end_line)
        }),
        buggy: false,
        release: String::new(),
    }
}

// ---------------------------------------------------------------------------
// Class matching
// ---------------------------------------------------------------------------

/// Find the class record for analyzer output.
///
/// The analyzed file path is tried first. After that the lookup is
/// approximate: the normalized class name must be contained in a class
/// path, and a path whose file stem equals the simple name is preferred.
/// Several equally good candidates resolve to the first in path order.
pub fn resolve_class<'a>(
    class: &ClassMetrics,
    classes: &'a Inventory,
    module_markers: &[String],
) -> ClassMatch<'a> {
    if let Some(exact) = classes.class(&class.file) {
        return ClassMatch::Resolved(exact);
    }

    let needle = normalize_class_name(&class.class_name, module_markers);
    let simple = needle.rsplit('/').next().unwrap_or(&needle);
    let mut contained = None;
    for record in classes.classes() {
        if !record.path.contains(needle.as_str()) {
            continue;
        }
        let stem = Path::new(&record.path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        if stem == simple {
            return ClassMatch::Resolved(record);
        }
        contained.get_or_insert(record);
    }
    contained.map_or(ClassMatch::Unresolved, ClassMatch::Resolved)
}

/// Reduce a qualified class name to the fragment used for path containment.
///
/// Nested parts (`$Inner`) are dropped. When a package segment is a module
/// marker the name is kept from that segment on as a path, otherwise only
/// the simple name remains.
pub fn normalize_class_name(qualified: &str, module_markers: &[String]) -> String {
    let outer = qualified.split('$').next().unwrap_or(qualified);
    let segments: Vec<&str> = outer.split('.').collect();
    match segments
        .iter()
        .position(|s| module_markers.iter().any(|m| m == s))
    {
        Some(pos) => segments[pos..].join("/"),
        None => segments.last().copied().unwrap_or(outer).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::analyzer::JavaAnalyzer;
    use crate::engine::lint::RuleLinter;
    use std::fs;

    fn metrics(file: &str, class_name: &str) -> ClassMetrics {
        ClassMetrics {
            file: file.into(),
            class_name: class_name.into(),
            methods: Vec::new(),
        }
    }

    fn markers() -> Vec<String> {
        vec!["benchmark".to_string()]
    }

    #[test]
    fn test_normalize_class_name() {
        let m = markers();
        assert_eq!(normalize_class_name("org.demo.Calc$Inner", &m), "Calc");
        assert_eq!(
            normalize_class_name("org.benchmark.jmh.Runner", &m),
            "benchmark/jmh/Runner"
        );
        assert_eq!(normalize_class_name("Plain", &m), "Plain");
    }

    #[test]
    fn test_resolve_prefers_exact_file_then_stem() {
        let mut inv = Inventory::new();
        inv.class_entry("src/org/demo/CalcUtil.java");
        inv.class_entry("src/org/moved/Calc.java");

        let moved = metrics("src/org/demo/Calc.java", "org.demo.Calc");
        match resolve_class(&moved, &inv, &markers()) {
            ClassMatch::Resolved(c) => assert_eq!(c.path, "src/org/moved/Calc.java"),
            ClassMatch::Unresolved => panic!("expected a match"),
        }

        inv.class_entry("src/org/demo/Calc.java");
        match resolve_class(&moved, &inv, &markers()) {
            ClassMatch::Resolved(c) => assert_eq!(c.path, "src/org/demo/Calc.java"),
            ClassMatch::Unresolved => panic!("expected a match"),
        }
    }

    #[test]
    fn test_resolve_unmatched_is_unresolved() {
        let mut inv = Inventory::new();
        inv.class_entry("src/org/demo/Other.java");
        let gone = metrics("src/org/demo/Gone.java", "org.demo.Gone");
        assert_eq!(resolve_class(&gone, &inv, &markers()), ClassMatch::Unresolved);
    }

    #[test]
    fn test_extract_snapshot() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("c1");
        let file = root.join("src/org/demo/Calc.java");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(
            &file,
            "package org.demo;\nclass Calc {\n  int f(int tmp) {\n    return tmp;\n  }\n  void g() {}\n}\n",
        )
        .unwrap();
        let orphan = root.join("src/org/demo/Orphan.java");
        fs::write(&orphan, "package org.demo;\nclass Orphan { void h() {} }\n").unwrap();

        let mut inv = Inventory::new();
        let class = inv.class_entry("src/org/demo/Calc.java");
        class.age = 30;
        class.revisions = 4;
        class.authors.insert("alice".into());

        let extractor = MetricsExtractor::new(
            Arc::new(JavaAnalyzer),
            Arc::new(RuleLinter::new(None).unwrap()),
            markers(),
        );
        let snapshot = Snapshot {
            commit: "c1".into(),
            dir: root.clone(),
            files: Vec::new(),
        };
        let records = extractor.extract(&snapshot, &inv).unwrap();
        drop(snapshot);
        assert!(!root.exists());

        let f = &records["src/org/demo/Calc.java#f/1[int]"];
        assert_eq!(f.age, 30);
        assert_eq!(f.n_auth, 1);
        assert_eq!(f.nr, 4);
        assert_eq!(f.n_smells, 2); // two tmp identifiers
        assert_eq!(f.file_path, "org.demo.Calc.f/1[int]");
        assert_eq!(records["src/org/demo/Calc.java#g/0"].n_smells, 0);

        let h = &records["src/org/demo/Orphan.java#h/0"];
        assert_eq!(h.age, UNRESOLVED);
        assert_eq!(h.n_auth, UNRESOLVED);
        assert!(!h.buggy);
    }
}
