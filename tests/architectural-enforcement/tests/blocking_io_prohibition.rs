//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async functions MUST NOT use blocking I/O.
//! **Required**: `tokio::fs`, `tokio::net`, `tokio::io`, not `std::fs`, `std::net`
//! or `std::thread::sleep`.
//!
//! Blocking calls in plain functions (config loading before the runtime
//! serves sessions) are acceptable.

use architectural_enforcement::{code_part, enclosing_fn, scan, FnKind};

const BLOCKING_PATTERNS: &[&str] = &[
    "std::fs::",
    "std::net::",
    "std::thread::sleep",
    "std::io::stdin()",
    "std::io::stdout()",
    "std::process::Command",
];

fn is_blocking_call(line: &str) -> bool {
    let code = code_part(line);
    BLOCKING_PATTERNS.iter().any(|p| code.contains(p))
}

#[test]
fn test_no_blocking_io_in_async_code() {
    let violations = scan(|lines, idx| {
        is_blocking_call(lines[idx]) && enclosing_fn(lines, idx) == Some(FnKind::Async)
    });

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found inside async functions:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::File::open().await");
        eprintln!("  - tokio::io::stdin(), tokio::io::stdout()");

        panic!(
            "\nFound {} blocking I/O violation(s) in async code.",
            violations.len()
        );
    }
}

#[test]
fn test_blocking_io_detection() {
    let code = vec![
        "async fn open(&self) {",
        "    let contents = std::fs::read_to_string(path)?;",
        "}",
    ];
    assert!(is_blocking_call(code[1]));
    assert_eq!(enclosing_fn(&code, 1), Some(FnKind::Async));
}

#[test]
fn test_sync_config_loading_allowed() {
    let code = vec![
        "pub fn load_config_from_path(path: Option<PathBuf>) {",
        "    let toml = std::fs::read_to_string(path)?;",
        "}",
    ];
    assert!(is_blocking_call(code[1]));
    assert_eq!(enclosing_fn(&code, 1), Some(FnKind::Sync));
}

#[test]
fn test_async_io_not_flagged() {
    assert!(!is_blocking_call("let file = tokio::fs::File::open(&path).await?;"));
    assert!(!is_blocking_call("// std::fs::read is blocking"));
}
