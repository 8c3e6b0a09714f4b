//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the integration tests in `tests/`:
//! - No idle sleeps in production code
//! - No blocking I/O inside async functions
//!
//! Scanning is line-based. Everything after a `#[cfg(test)]` line is treated
//! as test code and skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source trees checked by every rule, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["switchboard/core/src", "switchboard/daemon/src"];

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
    pub reason: &'static str,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.text
        )
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Every `.rs` file under the production directories
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }

        for entry in walkdir::WalkDir::new(path)
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

/// Lines of `path` that come before its test module
pub fn production_lines(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .take_while(|line| line.trim() != "#[cfg(test)]")
        .map(str::to_string)
        .collect()
}

/// Strip a trailing `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether the nearest enclosing `fn` above `idx` is async
pub fn is_in_async_function(lines: &[String], idx: usize) -> bool {
    for line in lines[..=idx].iter().rev() {
        let line = line.trim();
        if line.contains("async fn ") || line.contains("async move") {
            return true;
        }
        if line.contains("fn ") {
            return false;
        }
    }
    false
}

/// Whether a line within `before` lines above or `after` lines below `idx`
/// contains any of `needles`
pub fn near(lines: &[String], idx: usize, before: usize, after: usize, needles: &[&str]) -> bool {
    let start = idx.saturating_sub(before);
    let end = std::cmp::min(idx + after + 1, lines.len());
    lines[start..end].iter().any(|line| {
        let line = line.to_lowercase();
        needles.iter().any(|needle| line.contains(needle))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(code: &[&str]) -> Vec<String> {
        code.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_async_function_detection() {
        let code = lines(&[
            "async fn poll() {",
            "    let data = std::fs::read(\"x\");",
            "}",
            "fn load() {",
            "    let data = std::fs::read(\"x\");",
            "}",
        ]);

        assert!(is_in_async_function(&code, 1));
        assert!(!is_in_async_function(&code, 4));
    }

    #[test]
    fn test_async_block_counts_as_async() {
        let code = lines(&[
            "fn spawn_reader() {",
            "    tokio::spawn(async move {",
            "        let data = std::fs::read(\"x\");",
            "    });",
            "}",
        ]);

        assert!(is_in_async_function(&code, 2));
    }

    #[test]
    fn test_near_window() {
        let code = lines(&["let a = 1;", "// Retry later", "sleep();", "let b = 2;"]);

        assert!(near(&code, 2, 1, 0, &["retry"]));
        assert!(!near(&code, 0, 0, 0, &["retry"]));
    }

    #[test]
    fn test_code_part_drops_comments() {
        assert_eq!(code_part("let x = 1; // std::fs::read"), "let x = 1; ");
    }

    #[test]
    fn test_production_files_found() {
        let files = production_files();
        assert!(files.iter().any(|f| f.ends_with("lib.rs")));
        assert!(files.iter().any(|f| f.ends_with("main.rs")));
    }
}
