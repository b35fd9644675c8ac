use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A commit as enumerated from version control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    pub author: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

impl CommitInfo {
    /// First parent, if any. Root commits have none.
    pub fn parent(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }

    /// Abbreviated id for log lines.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(10)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// A single path touched by a commit relative to its first parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
}

/// Production Java source: `.java`, outside test trees, and not a test or mock by name.
pub fn is_production_source(path: &str) -> bool {
    if !path.ends_with(".java") {
        return false;
    }
    let lower = path.to_ascii_lowercase();
    if lower.contains("/test/") || lower.starts_with("test/") {
        return false;
    }
    let file_name = lower.rsplit('/').next().unwrap_or(&lower);
    !(file_name.contains("test") || file_name.contains("mock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_source_filter() {
        assert!(is_production_source("src/main/java/org/a/Foo.java"));
        assert!(!is_production_source("src/test/java/org/a/Foo.java"));
        assert!(!is_production_source("src/main/java/org/a/FooTest.java"));
        assert!(!is_production_source("src/main/java/org/a/MockClient.java"));
        assert!(!is_production_source("src/main/java/org/a/Foo.kt"));
        assert!(!is_production_source("README.md"));
    }

    #[test]
    fn test_parent_of_root_commit_is_none() {
        let c = CommitInfo {
            id: "abcdef0123456789".into(),
            parents: vec![],
            author: "a".into(),
            date: Utc::now(),
            message: String::new(),
        };
        assert!(c.parent().is_none());
        assert_eq!(c.short_id(), "abcdef0123");
    }
}
