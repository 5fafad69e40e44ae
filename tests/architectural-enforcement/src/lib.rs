//! Architectural Enforcement
//!
//! Source-level checks that keep the streaming library honest:
//! - No blocking sleeps; all waiting goes through the Tokio timer
//! - No subscriber installation; only binaries configure logging
//! - No `unwrap()`/`expect()` outside test modules
//! - No printing to stdout/stderr from the library
//!
//! The checks live in `tests/`; this library only provides the scanner.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A forbidden pattern found in production code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the match
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Pattern that matched
    pub pattern: &'static str,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: `{}`", self.path.display(), self.line, self.pattern)
    }
}

/// Root of the workspace this crate lives in
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Production lines of a source file: everything before the first
/// `#[cfg(test)]`, with comment lines blanked
#[must_use]
pub fn production_lines(source: &str) -> Vec<(usize, &str)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line))
        .collect()
}

/// Scan every `.rs` file under `dir` for `patterns` in production code
#[must_use]
pub fn scan(dir: &Path, patterns: &[&'static str]) -> Vec<Violation> {
    let mut violations = Vec::new();

    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
    {
        let Ok(source) = fs::read_to_string(entry.path()) else {
            continue;
        };
        for (line, text) in production_lines(&source) {
            for pattern in patterns {
                if text.contains(pattern) {
                    violations.push(Violation {
                        path: entry.path().to_path_buf(),
                        line,
                        pattern,
                    });
                }
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n// x.unwrap()\nfn b() {}\n#[cfg(test)]\nmod tests {}\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}"), (3, "fn b() {}")]);
    }
}
