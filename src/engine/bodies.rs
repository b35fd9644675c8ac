use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tracing::warn;
use tree_sitter::Node;

use crate::engine::parser;

/// Method name → body text for one source file.
pub type BodyMap = HashMap<String, String>;

/// Extracts method bodies by simple name.
#[derive(Debug, Clone)]
pub struct BodyExtractor {
    side_dir: PathBuf,
}

impl BodyExtractor {
    /// Unparsable sources are copied into `side_dir` for later inspection.
    pub fn new(side_dir: impl Into<PathBuf>) -> Self {
        Self {
            side_dir: side_dir.into(),
        }
    }

    /// Bodies of every method and constructor in `source`.
    ///
    /// Overloads share a name, the last one wins. Returns `None` when the
    /// source does not parse, in which case nothing in it is extractable.
    pub fn extract(&self, origin: &str, source: &str) -> Option<BodyMap> {
        match parser::parse_java_strict(source.as_bytes(), origin) {
            Ok(tree) => {
                let mut bodies = BodyMap::new();
                collect_bodies(tree.root_node(), source.as_bytes(), &mut bodies);
                Some(bodies)
            }
            Err(e) => {
                let side_file = self.write_side_file(source);
                warn!(
                    origin,
                    error = %e,
                    side_file = side_file.as_deref().unwrap_or("<not written>"),
                    "Method bodies not extractable"
                );
                None
            }
        }
    }

    fn write_side_file(&self, source: &str) -> Option<String> {
        let hash = blake3::hash(source.as_bytes()).to_hex();
        let path = self
            .side_dir
            .join(format!("parsing_error_{}.java", &hash[..16]));
        fs::create_dir_all(&self.side_dir).ok()?;
        fs::write(&path, source).ok()?;
        Some(path.display().to_string())
    }
}

fn collect_bodies(node: Node<'_>, source: &[u8], out: &mut BodyMap) {
    if matches!(node.kind(), "method_declaration" | "constructor_declaration")
        && let Some(name) = node
            .child_by_field_name("name")
            .and_then(|n| n.utf8_text(source).ok())
    {
        // abstract や interface のメソッドは本体なし
        let body = node
            .child_by_field_name("body")
            .and_then(|b| b.utf8_text(source).ok())
            .unwrap_or("");
        out.insert(name.to_string(), body.to_string());
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_bodies(child, source, out);
    }
}
