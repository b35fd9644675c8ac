use std::fs;
use std::path::Path;
use std::process::Command;

use serde::Serialize;

use crate::config::Config;
use crate::engine::lint::RuleLinter;
use crate::engine::parser;

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub version: String,
    pub healthy: bool,
    pub checks: Vec<CheckStatus>,
}

#[derive(Debug, Serialize)]
pub struct CheckStatus {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckStatus {
    fn new(name: &str, result: Result<Option<String>, String>) -> Self {
        match result {
            Ok(detail) => Self {
                name: name.to_string(),
                ok: true,
                detail,
            },
            Err(detail) => Self {
                name: name.to_string(),
                ok: false,
                detail: Some(detail),
            },
        }
    }
}

/// Run the doctor check: external tools, grammar, rules and writable dirs.
pub fn run_doctor(config: &Config) -> DoctorReport {
    let checks = vec![
        CheckStatus::new("git", check_git()),
        CheckStatus::new("java_grammar", check_grammar()),
        CheckStatus::new("lint_rules", check_rules(config)),
        CheckStatus::new("cache_dir", check_writable(&config.cache_dir)),
        CheckStatus::new("output_dir", check_writable(&config.output_dir)),
    ];

    DoctorReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        healthy: checks.iter().all(|c| c.ok),
        checks,
    }
}

fn check_git() -> Result<Option<String>, String> {
    let output = Command::new("git")
        .arg("--version")
        .output()
        .map_err(|e| format!("git is not executable: {e}"))?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
}

fn check_grammar() -> Result<Option<String>, String> {
    let language = parser::java_language();
    let mut ts_parser = tree_sitter::Parser::new();
    ts_parser
        .set_language(&language)
        .map_err(|e| e.to_string())?;
    Ok(Some(format!("abi {}", language.abi_version())))
}

fn check_rules(config: &Config) -> Result<Option<String>, String> {
    let linter =
        RuleLinter::new(config.analysis.rules_dir.as_deref()).map_err(|e| e.to_string())?;
    if !linter.warnings().is_empty() {
        return Err(linter.warnings().join("; "));
    }
    Ok(Some(format!("{} rules", linter.rule_count())))
}

fn check_writable(dir: &Path) -> Result<Option<String>, String> {
    fs::create_dir_all(dir).map_err(|e| format!("{}: {e}", dir.display()))?;
    let marker = dir.join(".defect-miner-write-check");
    fs::write(&marker, b"ok").map_err(|e| format!("{}: {e}", dir.display()))?;
    let _ = fs::remove_file(&marker);
    Ok(Some(dir.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doctor_reports_every_check() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            cache_dir: dir.path().join("cache"),
            output_dir: dir.path().join("out"),
            ..Default::default()
        };
        let report = run_doctor(&config);
        let names: Vec<_> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            ["git", "java_grammar", "lint_rules", "cache_dir", "output_dir"]
        );
        let grammar = report.checks.iter().find(|c| c.name == "java_grammar").unwrap();
        assert!(grammar.ok);
        assert!(dir.path().join("out").is_dir());
    }
}
