//! Architectural Enforcement
//!
//! Source scanners backing the integration tests in `tests/`:
//! - No sleep() calls in production code outside reconnect backoff
//! - No blocking I/O inside async functions
//!
//! Only the production part of each file is scanned: everything from the
//! first `#[cfg(test)]` onwards is ignored.

use std::fs;
use std::path::{Path, PathBuf};

/// Crate source roots checked by the enforcement tests
pub const PRODUCTION_ROOTS: &[&str] = &["logstream/core/src", "logstream/daemon/src"];

/// A rule violation at a source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending source line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Kind of function enclosing a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    /// `async fn`
    Async,
    /// Plain `fn`
    Sync,
}

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every `.rs` file under the production roots
///
/// # Panics
///
/// Panics if a production root is missing, so a moved crate cannot silently
/// turn the checks into no-ops.
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_ROOTS {
        let path = root.join(dir);
        assert!(path.exists(), "production root missing: {}", path.display());

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.into_path());
            }
        }
    }

    files.sort();
    files
}

/// Lines of `content` before its test module
#[must_use]
pub fn production_lines(content: &str) -> Vec<&str> {
    content
        .lines()
        .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
        .collect()
}

/// The part of a line before any `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

fn strip_visibility(line: &str) -> &str {
    let line = line.trim_start();
    if let Some(rest) = line.strip_prefix("pub(crate) ") {
        return rest;
    }
    line.strip_prefix("pub ").unwrap_or(line)
}

/// Kind of the nearest function declared above `idx`
#[must_use]
pub fn enclosing_fn(lines: &[&str], idx: usize) -> Option<FnKind> {
    for line in lines[..=idx.min(lines.len().saturating_sub(1))].iter().rev() {
        let decl = strip_visibility(code_part(line));
        if decl.starts_with("async fn ") {
            return Some(FnKind::Async);
        }
        if decl.starts_with("fn ") {
            return Some(FnKind::Sync);
        }
    }
    None
}

/// Whether any line within `before` lines above or `after` lines below
/// `idx` contains one of `needles` (case-insensitive)
#[must_use]
pub fn context_mentions(
    lines: &[&str],
    idx: usize,
    before: usize,
    after: usize,
    needles: &[&str],
) -> bool {
    let end = (idx + after + 1).min(lines.len());
    lines[idx.saturating_sub(before)..end].iter().any(|line| {
        let lower = line.to_lowercase();
        needles.iter().any(|n| lower.contains(n))
    })
}

/// Scan every production file with `check`, collecting violations
///
/// # Panics
///
/// Panics if a production file cannot be read.
#[must_use]
pub fn scan<F>(check: F) -> Vec<Violation>
where
    F: Fn(&[&str], usize) -> bool,
{
    let mut violations = Vec::new();

    for path in production_files() {
        let content = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_tests() {
        let content = "fn a() {}\n\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n";
        assert_eq!(production_lines(content), vec!["fn a() {}", ""]);
    }

    #[test]
    fn test_enclosing_fn_detection() {
        let code = vec![
            "impl Opener {",
            "    pub(crate) async fn open(&self) {",
            "        let x = 1;",
            "    }",
            "    pub fn sync_helper() {",
            "        let y = 2;",
            "    }",
            "}",
        ];
        assert_eq!(enclosing_fn(&code, 2), Some(FnKind::Async));
        assert_eq!(enclosing_fn(&code, 5), Some(FnKind::Sync));
        assert_eq!(enclosing_fn(&code, 0), None);
    }

    #[test]
    fn test_commented_declarations_ignored() {
        let code = vec!["fn outer() {", "    // async fn inner()", "    work();"];
        assert_eq!(enclosing_fn(&code, 2), Some(FnKind::Sync));
    }

    #[test]
    fn test_context_mentions() {
        let code = vec!["let backoff = delay(n);", "", "sleep(backoff).await;"];
        assert!(context_mentions(&code, 2, 5, 0, &["backoff"]));
        assert!(!context_mentions(&code, 2, 0, 0, &["retry"]));
    }

    #[test]
    fn test_production_roots_exist() {
        assert!(!production_files().is_empty());
    }
}
