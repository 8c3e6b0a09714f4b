//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in switchboard MUST NOT use blocking I/O.
//! **Required**: `tokio::net`, `tokio::fs`, async `reqwest`
//!
//! Plain functions may block (config loading runs before the adapters start).
//! Address types such as `std::net::SocketAddr` are not I/O and are allowed.

use architectural_enforcement::{
    code_part, is_in_async_function, production_files, production_lines, Violation,
};

const BLOCKING_CALLS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::TcpStream", "Blocking network I/O"),
    ("std::net::TcpListener", "Blocking network I/O"),
    ("std::net::UdpSocket", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::thread::sleep", "Blocking sleep"),
    ("std::io::stdin()", "Blocking stdin"),
];

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O calls found in async code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::net::TcpStream / TcpListener");
        eprintln!("  - tokio::fs");
        eprintln!("  - reqwest::Client (not reqwest::blocking)");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

fn find_blocking_io_violations() -> Vec<Violation> {
    let mut violations = Vec::new();

    for path in production_files() {
        let lines = production_lines(&path);
        for (idx, line) in lines.iter().enumerate() {
            let code = code_part(line);

            // The blocking client is never acceptable, async context or not
            if code.contains("reqwest::blocking") {
                violations.push(Violation {
                    path: path.clone(),
                    line: idx + 1,
                    text: line.trim().to_string(),
                    reason: "Blocking HTTP client",
                });
                continue;
            }

            let Some((_, reason)) = BLOCKING_CALLS
                .iter()
                .find(|(pattern, _)| code.contains(pattern))
            else {
                continue;
            };
            if is_in_async_function(&lines, idx) {
                violations.push(Violation {
                    path: path.clone(),
                    line: idx + 1,
                    text: line.trim().to_string(),
                    reason: *reason,
                });
            }
        }
    }

    violations
}

#[test]
fn test_detects_blocking_read_in_async_fn() {
    let code: Vec<String> = [
        "async fn load() {",
        "    let text = std::fs::read_to_string(path);",
        "}",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect();

    assert!(code_part(&code[1]).contains("std::fs::"));
    assert!(is_in_async_function(&code, 1));
}
