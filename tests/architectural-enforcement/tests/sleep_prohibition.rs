//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep. Streams are driven by I/O
//! readiness; periodic work uses `tokio::time::interval`.
//! **Exception**: the delay between reconnect attempts.

use architectural_enforcement::{code_part, context_mentions, scan};

fn is_sleep_call(line: &str) -> bool {
    let code = code_part(line);
    code.contains("::sleep(") || code.contains(".sleep(")
}

fn is_backoff_context(lines: &[&str], idx: usize) -> bool {
    context_mentions(lines, idx, 15, 5, &["backoff"])
        && context_mentions(lines, idx, 15, 5, &["retry", "reconnect", "attempt"])
}

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(|lines, idx| is_sleep_call(lines[idx]) && !is_backoff_context(lines, idx));

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE:");
        eprintln!("  - Reconnect backoff between attempts");
        eprintln!("  - Periodic polling with tokio::time::interval()");
        eprintln!("  - Test code");

        panic!("\nFound {} sleep violation(s) in production code.", violations.len());
    }
}

#[test]
fn test_backoff_detection() {
    let code = vec![
        "let backoff = self.policy.backoff.delay(failures);",
        "let message = format!(\"retry {failures}\");",
        "tokio::time::sleep(backoff).await;",
    ];
    assert!(is_sleep_call(code[2]));
    assert!(is_backoff_context(&code, 2));
}

#[test]
fn test_polling_sleep_is_flagged() {
    let code = vec![
        "loop {",
        "    if ready() { break; }",
        "    tokio::time::sleep(Duration::from_millis(10)).await;",
        "}",
    ];
    assert!(is_sleep_call(code[2]));
    assert!(!is_backoff_context(&code, 2));
}
