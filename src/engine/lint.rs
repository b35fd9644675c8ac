use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use streaming_iterator::StreamingIterator;
use tree_sitter::{Node, Query, QueryCursor};
use tracing::warn;

use crate::engine::parser;

/// Severity level for a lint rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A smell rule definition (loaded from YAML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule identifier
    pub id: String,
    /// Target language, only "java" rules are applied
    #[serde(default = "default_language")]
    pub language: String,
    pub severity: Severity,
    /// Human-readable message
    pub message: String,
    /// tree-sitter S-expression query (mutually exclusive with pattern).
    /// Captures starting with `_` are helpers and are not reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Simple text pattern to match against identifiers (mutually exclusive with query)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

fn default_language() -> String {
    "java".to_string()
}

/// One reported smell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmellHit {
    pub rule_id: String,
    /// 1-based
    pub line: usize,
}

/// Reports code smells with line numbers.
pub trait Linter: Send + Sync {
    fn lint(&self, source: &[u8]) -> Result<Vec<SmellHit>>;
}

/// Number of hits whose line falls in `[start_line, end_line]`.
pub fn smell_count(hits: &[SmellHit], start_line: usize, end_line: usize) -> i64 {
    hits.iter()
        .filter(|h| (start_line..=end_line).contains(&h.line))
        .count() as i64
}

const BUILTIN_RULES: &str = r#"
- id: empty-catch
  severity: warning
  message: Empty catch block swallows the exception
  query: '(catch_clause body: (block) @smell (#match? @smell "^\\{\\s*\\}$"))'
- id: generic-catch
  severity: warning
  message: Catching a generic exception type
  query: '(catch_formal_parameter (catch_type (type_identifier) @smell) (#match? @smell "^(Exception|Throwable|RuntimeException)$"))'
- id: print-stack-trace
  severity: warning
  message: printStackTrace instead of logging
  query: '(method_invocation name: (identifier) @smell (#eq? @smell "printStackTrace"))'
- id: console-output
  severity: info
  message: Writing to System.out or System.err
  query: '(method_invocation object: (field_access object: (identifier) @_sys field: (identifier) @_stream) name: (identifier) @smell (#eq? @_sys "System") (#match? @_stream "^(out|err)$"))'
- id: nested-ternary
  severity: info
  message: Nested conditional expression
  query: '(ternary_expression (ternary_expression) @smell)'
- id: temp-name
  severity: info
  message: Temporary-looking identifier
  pattern: tmp
"#;

enum Matcher {
    Query(Query),
    Pattern(String),
}

struct CompiledRule {
    id: String,
    matcher: Matcher,
}

/// YAML-rule linter over the Java grammar.
pub struct RuleLinter {
    rules: Vec<CompiledRule>,
    warnings: Vec<String>,
}

impl RuleLinter {
    /// Built-in rules plus every `*.yaml`/`*.yml` file in `rules_dir`.
    pub fn new(rules_dir: Option<&Path>) -> Result<Self> {
        let mut rules: Vec<Rule> =
            serde_yaml::from_str(BUILTIN_RULES).context("Built-in lint rules are invalid")?;
        if let Some(dir) = rules_dir {
            rules.extend(load_rules_from_dir(dir)?);
        }
        Ok(Self::from_rules(rules))
    }

    /// Compile rules. Rules that cannot be used are skipped with a warning.
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        let language = parser::java_language();
        let mut compiled = Vec::new();
        let mut warnings = Vec::new();

        for rule in rules {
            if rule.language != "java" {
                continue;
            }
            if rule.query.is_some() && rule.pattern.is_some() {
                warnings.push(format!(
                    "Rule '{}': query and pattern are mutually exclusive; using query",
                    rule.id
                ));
            }
            let matcher = match (&rule.query, &rule.pattern) {
                (Some(src), _) => match Query::new(&language, src) {
                    Ok(query) => Matcher::Query(query),
                    Err(e) => {
                        warnings.push(format!(
                            "Rule '{}': invalid tree-sitter query: {e}; skipped",
                            rule.id
                        ));
                        continue;
                    }
                },
                (None, Some(pattern)) => Matcher::Pattern(pattern.clone()),
                (None, None) => {
                    warnings.push(format!(
                        "Rule '{}': must have either query or pattern; skipped",
                        rule.id
                    ));
                    continue;
                }
            };
            compiled.push(CompiledRule {
                id: rule.id,
                matcher,
            });
        }

        for w in &warnings {
            warn!("{w}");
        }
        Self {
            rules: compiled,
            warnings,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn lint_tree(&self, root: Node<'_>, source: &[u8]) -> Vec<SmellHit> {
        let mut hits = Vec::new();
        for rule in &self.rules {
            match &rule.matcher {
                Matcher::Query(query) => {
                    let names = query.capture_names();
                    let mut cursor = QueryCursor::new();
                    let mut matches = cursor.matches(query, root, source);
                    while let Some(m) = matches.next() {
                        for capture in m.captures {
                            let reported = names
                                .get(capture.index as usize)
                                .is_some_and(|n| !n.starts_with('_'));
                            if reported {
                                hits.push(SmellHit {
                                    rule_id: rule.id.clone(),
                                    line: capture.node.start_position().row + 1,
                                });
                            }
                        }
                    }
                }
                Matcher::Pattern(pattern) => {
                    collect_pattern_matches(root, source, pattern, &rule.id, &mut hits);
                }
            }
        }
        hits.sort_by_key(|h| h.line);
        hits
    }
}

impl Linter for RuleLinter {
    fn lint(&self, source: &[u8]) -> Result<Vec<SmellHit>> {
        let tree = parser::parse_java(source)?;
        Ok(self.lint_tree(tree.root_node(), source))
    }
}

/// Load rules from all YAML files in a directory.
pub fn load_rules_from_dir(dir: &Path) -> Result<Vec<Rule>> {
    let mut all_rules = Vec::new();
    if !dir.is_dir() {
        return Ok(all_rules);
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            matches!(
                e.path().extension().and_then(|s| s.to_str()),
                Some("yaml" | "yml")
            )
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let content = std::fs::read_to_string(entry.path())?;
        let rules: Vec<Rule> = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid rule file: {}", entry.path().display()))?;
        all_rules.extend(rules);
    }
    Ok(all_rules)
}

/// Recursively walk the AST and match identifier nodes against a text pattern.
fn collect_pattern_matches(
    node: Node<'_>,
    source: &[u8],
    pattern: &str,
    rule_id: &str,
    hits: &mut Vec<SmellHit>,
) {
    if node.kind() == "identifier"
        && let Ok(text) = node.utf8_text(source)
        && text.contains(pattern)
    {
        hits.push(SmellHit {
            rule_id: rule_id.to_string(),
            line: node.start_position().row + 1,
        });
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_pattern_matches(child, source, pattern, rule_id, hits);
    }
}
