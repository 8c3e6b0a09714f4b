//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code waits on I/O, timers or cancellation, never on
//! a bare sleep.
//! **Exceptions**: retry delays between connect attempts, waits raced against
//! a cancellation token, test code.

use architectural_enforcement::{code_part, near, production_files, production_lines, Violation};

#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Delay between retry attempts");
        eprintln!("  - tokio::select! racing the sleep against a cancellation token");
        eprintln!("  - Test code");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in a loop that polls a flag");
        eprintln!("  - Sleep as synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

fn find_sleep_violations() -> Vec<Violation> {
    let mut violations = Vec::new();

    for path in production_files() {
        let lines = production_lines(&path);
        for (idx, line) in lines.iter().enumerate() {
            let code = code_part(line);
            if !(code.contains("::sleep(") || code.contains(".sleep(")) {
                continue;
            }
            if is_retry_delay(&lines, idx) || is_cancellable_wait(&lines, idx) {
                continue;
            }

            violations.push(Violation {
                path: path.clone(),
                line: idx + 1,
                text: line.trim().to_string(),
                reason: "Sleep",
            });
        }
    }

    violations
}

fn is_retry_delay(lines: &[String], idx: usize) -> bool {
    near(lines, idx, 12, 2, &["retry", "attempt", "backoff"])
}

fn is_cancellable_wait(lines: &[String], idx: usize) -> bool {
    near(lines, idx, 4, 0, &["tokio::select!"]) && near(lines, idx, 4, 0, &["cancelled()"])
}

#[test]
fn test_retry_delay_is_allowed() {
    let code: Vec<String> = [
        "if try_number < tries {",
        "    tokio::time::sleep(self.config.retry_delay()).await;",
        "}",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect();

    assert!(is_retry_delay(&code, 1));
}

#[test]
fn test_cancellable_wait_is_allowed() {
    let code: Vec<String> = [
        "tokio::select! {",
        "    () = token.cancelled() => break,",
        "    () = tokio::time::sleep(delay) => {}",
        "}",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect();

    assert!(is_cancellable_wait(&code, 2));
    assert!(!is_retry_delay(&code, 2));
}
