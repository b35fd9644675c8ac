//! Dataset emission.

pub mod csv;

use std::path::PathBuf;

use anyhow::Result;

use crate::models::dataset::{DatasetKind, DatasetReport};
use crate::models::method::MethodRecord;

pub use csv::CsvDatasetWriter;

/// Destination for per-release datasets.
pub trait DatasetSink: Send + Sync {
    fn path_for(&self, kind: DatasetKind, release_id: u32) -> PathBuf;

    /// Whether a non-empty dataset is already in place.
    fn is_complete(&self, kind: DatasetKind, release_id: u32) -> bool;

    /// Write one dataset, replacing any previous file.
    ///
    /// Records without a release tag are written under `release_name`.
    fn write(
        &self,
        kind: DatasetKind,
        release_id: u32,
        release_name: &str,
        methods: &[&MethodRecord],
    ) -> Result<DatasetReport>;
}
