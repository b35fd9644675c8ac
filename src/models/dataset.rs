use serde::{Deserialize, Serialize};

/// Which dataset a CSV belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Training,
    Test,
    Partial,
}

impl DatasetKind {
    /// Infix used in file names (`<PROJECT><label><id>.csv`).
    pub fn label(self) -> &'static str {
        match self {
            Self::Training => "Training",
            Self::Test => "Testing",
            Self::Partial => "Partial",
        }
    }

    /// Subdirectory under the output dir, `None` for the top level.
    pub fn subdir(self) -> Option<&'static str> {
        match self {
            Self::Training => None,
            Self::Test => Some("tests"),
            Self::Partial => Some("partials"),
        }
    }
}

/// Summary of one emitted dataset, printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub release: String,
    pub kind: DatasetKind,
    pub path: String,
    pub rows: usize,
    pub buggy: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}
