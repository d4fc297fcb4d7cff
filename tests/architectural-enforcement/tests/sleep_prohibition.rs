//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Engine and chat production code MUST NOT sleep. Deadlines are
//! armed with `sleep_until` on a timer task and periodic work uses
//! `tokio::time::interval`.
//! **Exceptions**: exponential backoff between reconnect attempts, test code

use architectural_enforcement::{is_forbidden_sleep, production_files, scan};

#[test]
fn test_no_sleep_in_production_code() {
    assert!(
        !production_files().is_empty(),
        "no production sources found; is the workspace layout intact?"
    );

    let violations = scan(is_forbidden_sleep);

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable: reconnect backoff, tokio::time::interval, sleep_until deadlines, tests");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
