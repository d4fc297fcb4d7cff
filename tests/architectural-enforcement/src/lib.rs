//! Architectural Enforcement
//!
//! Source scanners shared by the enforcement tests in `tests/`. They read the
//! workspace's production sources line by line and report rule violations:
//! - No sleep() in production code, except between reconnect attempts
//! - No unwrap()/expect() in production code
//!
//! Everything after a file's first `#[cfg(test)]` is test code and skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["engine/core/src", "engine/chat/src"];

/// One offending line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Every `.rs` file under the production roots
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.into_path());
            }
        }
    }

    files.sort();
    files
}

/// Lines that precede the file's test module
pub fn production_lines(content: &str) -> Vec<&str> {
    content
        .lines()
        .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
        .collect()
}

/// The part of a line before any `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Run `check` over every production line of every production file
pub fn scan(check: impl Fn(&[&str], usize) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();

    for path in production_files() {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        let lines = production_lines(&content);
        for idx in 0..lines.len() {
            if check(&lines, idx) {
                violations.push(Violation {
                    path: path.clone(),
                    line: idx + 1,
                    text: lines[idx].trim().to_string(),
                });
            }
        }
    }

    violations
}

/// A sleep call outside a backoff context
pub fn is_forbidden_sleep(lines: &[&str], idx: usize) -> bool {
    let code = code_part(lines[idx]);
    (code.contains("::sleep(") || code.contains(".sleep(")) && !is_backoff_context(lines, idx)
}

/// Check if sleep is used for exponential backoff between reconnect attempts
pub fn is_backoff_context(lines: &[&str], idx: usize) -> bool {
    let range = idx.saturating_sub(15)..std::cmp::min(idx + 5, lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for line in &lines[range] {
        let line = line.to_lowercase();
        if line.contains("<<") || line.contains("pow") || line.contains("delay_for") {
            has_backoff_calc = true;
        }
        if line.contains("retry")
            || line.contains("reconnect")
            || line.contains("backoff")
            || line.contains("attempt")
        {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

/// An `unwrap()` or `expect(..)` call
pub fn is_forbidden_unwrap(lines: &[&str], idx: usize) -> bool {
    let code = code_part(lines[idx]);
    code.contains(".unwrap()") || code.contains(".expect(")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests { fn b() { x.unwrap(); } }\n";
        assert_eq!(production_lines(content), vec!["fn a() {}"]);
    }

    #[test]
    fn test_plain_sleep_is_forbidden() {
        let lines = [
            "async fn poll_until_ready() {",
            "    tokio::time::sleep(Duration::from_millis(10)).await;",
            "}",
        ];
        assert!(is_forbidden_sleep(&lines, 1));
    }

    #[test]
    fn test_backoff_sleep_is_allowed() {
        let lines = [
            "async fn reconnect_loop() {",
            "    let delay = policy.delay_for(attempts);",
            "    warn!(attempt = attempts, \"Reconnecting after backoff\");",
            "    tokio::time::sleep(delay).await;",
            "}",
        ];
        assert!(is_backoff_context(&lines, 3));
        assert!(!is_forbidden_sleep(&lines, 3));
    }

    #[test]
    fn test_sleep_until_is_not_a_sleep_call() {
        let lines = ["    tokio::time::sleep_until(deadline).await;"];
        assert!(!is_forbidden_sleep(&lines, 0));
    }

    #[test]
    fn test_unwrap_variants() {
        assert!(is_forbidden_unwrap(&["let x = y.unwrap();"], 0));
        assert!(is_forbidden_unwrap(&["let x = y.expect(\"set\");"], 0));
        assert!(!is_forbidden_unwrap(&["let x = y.unwrap_or_default();"], 0));
        assert!(!is_forbidden_unwrap(&["//! let peer = server.accept().await.unwrap();"], 0));
        assert!(!is_forbidden_unwrap(&["let x = y; // never .unwrap() here"], 0));
    }
}
