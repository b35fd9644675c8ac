use anyhow::{Context, Result};
use camino::Utf8Path;
use tree_sitter::{Language, Parser, Tree};

use crate::error::MinerError;

/// The Java grammar.
pub fn java_language() -> Language {
    Language::new(tree_sitter_java::LANGUAGE)
}

/// Parse Java source bytes.
pub fn parse_java(source: &[u8]) -> Result<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&java_language())
        .context("Failed to set parser language")?;

    parser
        .parse(source, None)
        .ok_or_else(|| MinerError::parse_error("<source>").into())
}

/// Parse Java source and reject trees containing syntax errors.
pub fn parse_java_strict(source: &[u8], origin: &str) -> Result<Tree> {
    let tree = parse_java(source)?;
    if tree.root_node().has_error() {
        anyhow::bail!(MinerError::parse_error(origin));
    }
    Ok(tree)
}

/// Maximum file size: 100 MB.
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Zero-copy capable source buffer.
/// Uses mmap for files > 64KB (avoids copying), Vec<u8> for smaller files.
pub enum SourceBuf {
    Mmap(memmap2::Mmap),
    Vec(Vec<u8>),
}

impl SourceBuf {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SourceBuf::Mmap(m) => m,
            SourceBuf::Vec(v) => v,
        }
    }
}

impl std::ops::Deref for SourceBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Read a file into a zero-copy buffer (mmap for large files, Vec for small).
pub fn read_file(path: &Utf8Path) -> Result<SourceBuf> {
    use std::fs::File;
    let file =
        File::open(path.as_std_path()).map_err(|_| MinerError::file_not_found(path.as_str()))?;
    let metadata = file.metadata()?;

    if metadata.len() == 0 {
        return Ok(SourceBuf::Vec(Vec::new()));
    }

    if metadata.len() > MAX_FILE_SIZE {
        anyhow::bail!(MinerError::new(
            crate::error::ErrorCode::InvalidRequest,
            format!(
                "File too large ({} bytes > {} bytes): {}",
                metadata.len(),
                MAX_FILE_SIZE,
                path
            ),
        ));
    }

    // 64KB 超は mmap で読む (exported snapshots can hold generated sources)
    if metadata.len() > 65536 {
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Ok(SourceBuf::Mmap(mmap))
    } else {
        use std::io::Read;
        let mut buf = Vec::with_capacity(metadata.len() as usize);
        let mut reader = std::io::BufReader::new(file);
        reader.read_to_end(&mut buf)?;
        Ok(SourceBuf::Vec(buf))
    }
}
