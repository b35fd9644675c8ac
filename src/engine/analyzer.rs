//! Per-method structural metrics for Java sources.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Result;
use camino::Utf8PathBuf;
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::Serialize;
use tracing::warn;
use tree_sitter::Node;

use crate::engine::parser;

/// Metrics of one method or constructor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MethodMetrics {
    /// `name/arity[T1,T2]`
    pub signature: String,
    /// 1-based, inclusive
    pub start_line: usize,
    pub end_line: usize,
    pub loc: i64,
    pub wmc: i64,
    pub assignments: i64,
    pub math_operations: i64,
    pub try_catch: i64,
    pub returns: i64,
    pub fanin: i64,
    pub fanout: i64,
    #[serde(skip)]
    callees: BTreeSet<String>,
}

impl MethodMetrics {
    pub fn simple_name(&self) -> &str {
        crate::models::method::simple_name(&self.signature)
    }
}

/// Metrics of one class found in a file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    /// Path relative to the analyzed directory
    pub file: String,
    /// Fully qualified, `$` between nested classes
    pub class_name: String,
    pub methods: Vec<MethodMetrics>,
}

/// Computes structural metrics over a directory of sources.
pub trait StaticAnalyzer: Send + Sync {
    fn analyze(&self, dir: &Path) -> Result<Vec<ClassMetrics>>;
}

/// tree-sitter based analyzer for Java.
#[derive(Debug, Default)]
pub struct JavaAnalyzer;

impl StaticAnalyzer for JavaAnalyzer {
    fn analyze(&self, dir: &Path) -> Result<Vec<ClassMetrics>> {
        let files = java_files(dir);
        let mut classes: Vec<ClassMetrics> = files
            .par_iter()
            .flat_map_iter(|path| match analyze_file(dir, path) {
                Ok(found) => found,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unanalyzable file");
                    Vec::new()
                }
            })
            .collect();

        link_fan_in(&mut classes);
        classes.sort_by(|a, b| {
            a.file
                .cmp(&b.file)
                .then_with(|| a.class_name.cmp(&b.class_name))
        });
        Ok(classes)
    }
}

fn java_files(dir: &Path) -> Vec<PathBuf> {
    WalkBuilder::new(dir)
        .standard_filters(false)
        .build()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "java"))
        .collect()
}

/// Analyze one source file; `root` makes the reported path relative.
pub fn analyze_file(root: &Path, path: &Path) -> Result<Vec<ClassMetrics>> {
    let utf8 = Utf8PathBuf::from_path_buf(path.to_path_buf())
        .map_err(|p| anyhow::anyhow!("Non UTF-8 path: {}", p.display()))?;
    let source = parser::read_file(&utf8)?;
    let rel = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    analyze_source(&rel, &source)
}

/// Analyze Java source text.
pub fn analyze_source(file: &str, source: &[u8]) -> Result<Vec<ClassMetrics>> {
    let tree = parser::parse_java(source)?;
    let root = tree.root_node();
    let package = package_name(root, source);

    let mut classes = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        collect_classes(child, source, file, package.as_deref(), None, &mut classes);
    }
    Ok(classes)
}

fn package_name(root: Node<'_>, source: &[u8]) -> Option<String> {
    let mut cursor = root.walk();
    let decl = root
        .named_children(&mut cursor)
        .find(|n| n.kind() == "package_declaration")?;
    let mut inner = decl.walk();
    let name = decl
        .named_children(&mut inner)
        .find(|n| matches!(n.kind(), "scoped_identifier" | "identifier"))?;
    name.utf8_text(source).ok().map(str::to_string)
}

fn is_type_declaration(kind: &str) -> bool {
    matches!(
        kind,
        "class_declaration" | "interface_declaration" | "enum_declaration" | "record_declaration"
    )
}

fn collect_classes(
    node: Node<'_>,
    source: &[u8],
    file: &str,
    package: Option<&str>,
    enclosing: Option<&str>,
    out: &mut Vec<ClassMetrics>,
) {
    if !is_type_declaration(node.kind()) {
        return;
    }
    let Some(name) = node
        .child_by_field_name("name")
        .and_then(|n| n.utf8_text(source).ok())
    else {
        return;
    };
    let class_name = match (enclosing, package) {
        (Some(outer), _) => format!("{outer}${name}"),
        (None, Some(pkg)) => format!("{pkg}.{name}"),
        (None, None) => name.to_string(),
    };

    let mut methods = Vec::new();
    let mut nested = Vec::new();
    if let Some(body) = node.child_by_field_name("body") {
        let mut members = Vec::new();
        let mut cursor = body.walk();
        for member in body.named_children(&mut cursor) {
            // enum 本体は enum_body_declarations の中にメンバを持つ
            if member.kind() == "enum_body_declarations" {
                let mut inner = member.walk();
                members.extend(member.named_children(&mut inner));
            } else {
                members.push(member);
            }
        }
        for member in members {
            match member.kind() {
                "method_declaration" | "constructor_declaration" => {
                    methods.push(method_metrics(member, source));
                }
                k if is_type_declaration(k) => nested.push(member),
                _ => {}
            }
        }
    }

    out.push(ClassMetrics {
        file: file.to_string(),
        class_name: class_name.clone(),
        methods,
    });
    for inner in nested {
        collect_classes(inner, source, file, package, Some(&class_name), out);
    }
}

fn method_metrics(node: Node<'_>, source: &[u8]) -> MethodMetrics {
    let name = node
        .child_by_field_name("name")
        .and_then(|n| n.utf8_text(source).ok())
        .unwrap_or("<anonymous>");

    let mut metrics = MethodMetrics {
        signature: signature(name, node, source),
        start_line: node.start_position().row + 1,
        end_line: node.end_position().row + 1,
        loc: count_loc(node.utf8_text(source).unwrap_or("")),
        wmc: 1,
        ..Default::default()
    };
    if let Some(body) = node.child_by_field_name("body") {
        walk_body(body, source, &mut metrics);
    }
    metrics.fanout = metrics.callees.len() as i64;
    metrics
}

/// CK-style signature: `name/arity` plus `[types]` when there are parameters.
fn signature(name: &str, node: Node<'_>, source: &[u8]) -> String {
    let mut types = Vec::new();
    if let Some(params) = node.child_by_field_name("parameters") {
        let mut cursor = params.walk();
        for param in params.named_children(&mut cursor) {
            let ty = match param.kind() {
                "formal_parameter" => param
                    .child_by_field_name("type")
                    .and_then(|t| t.utf8_text(source).ok())
                    .map(str::to_string),
                "spread_parameter" => param
                    .named_child(0)
                    .filter(|t| t.kind() != "modifiers")
                    .or_else(|| param.named_child(1))
                    .and_then(|t| t.utf8_text(source).ok())
                    .map(|t| format!("{t}...")),
                _ => None,
            };
            if let Some(ty) = ty {
                types.push(ty.split_whitespace().collect::<String>());
            }
        }
    }
    if types.is_empty() {
        format!("{name}/0")
    } else {
        format!("{name}/{}[{}]", types.len(), types.join(","))
    }
}

fn walk_body(node: Node<'_>, source: &[u8], m: &mut MethodMetrics) {
    match node.kind() {
        "if_statement" | "for_statement" | "enhanced_for_statement" | "while_statement"
        | "do_statement" | "ternary_expression" => m.wmc += 1,
        "catch_clause" => {
            m.wmc += 1;
            m.try_catch += 1;
        }
        "try_statement" | "try_with_resources_statement" => m.try_catch += 1,
        "switch_label" => {
            if node
                .utf8_text(source)
                .is_ok_and(|t| t.trim_start().starts_with("case"))
            {
                m.wmc += 1;
            }
        }
        "binary_expression" => {
            let op = node
                .child_by_field_name("operator")
                .map(|o| o.kind())
                .unwrap_or("");
            match op {
                "&&" | "||" => m.wmc += 1,
                "+" | "-" | "*" | "/" | "%" => m.math_operations += 1,
                _ => {}
            }
        }
        "assignment_expression" => m.assignments += 1,
        "variable_declarator" => {
            if node.child_by_field_name("value").is_some() {
                m.assignments += 1;
            }
        }
        "return_statement" => m.returns += 1,
        "method_invocation" => {
            if let Some(name) = node
                .child_by_field_name("name")
                .and_then(|n| n.utf8_text(source).ok())
            {
                m.callees.insert(name.to_string());
            }
        }
        // ローカルクラスは別クラスとして数えない
        k if is_type_declaration(k) => return,
        _ => {}
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk_body(child, source, m);
    }
}

/// Non-blank lines that are not pure comment lines.
fn count_loc(text: &str) -> i64 {
    text.lines()
        .map(str::trim)
        .filter(|l| {
            !l.is_empty()
                && !l.starts_with("//")
                && !l.starts_with("/*")
                && !l.starts_with('*')
        })
        .count() as i64
}

/// Fan-in: how many other methods in the analyzed set call a method's name.
fn link_fan_in(classes: &mut [ClassMetrics]) {
    let mut callers: HashMap<&str, usize> = HashMap::new();
    for class in classes.iter() {
        for method in &class.methods {
            for callee in &method.callees {
                if callee != method.simple_name() {
                    *callers.entry(callee.as_str()).or_insert(0) += 1;
                }
            }
        }
    }
    let fan_in: HashMap<String, i64> = callers
        .into_iter()
        .map(|(k, v)| (k.to_string(), v as i64))
        .collect();
    for class in classes.iter_mut() {
        for method in &mut class.methods {
            method.fanin = fan_in.get(method.simple_name()).copied().unwrap_or(0);
        }
    }
}
