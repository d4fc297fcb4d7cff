//! Integration Test: Unwrap Prohibition
//!
//! **Policy**: Engine and chat production code propagates errors with `?` or
//! handles them; it never calls `unwrap()` or `expect()`.
//! **Exceptions**: test code, doc comments

use architectural_enforcement::{is_forbidden_unwrap, scan};

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = scan(is_forbidden_unwrap);

    if !violations.is_empty() {
        eprintln!("\nunwrap()/expect() found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nReturn a Result, use a fallback (unwrap_or_else), or log and continue.");

        panic!(
            "\nFound {} unwrap violation(s) in production code.",
            violations.len()
        );
    }
}
