//! Workspace policy checks
//!
//! Background components wait on `Notify`, channels and tokio timers; a
//! blocking sleep would stall a runtime worker thread. Failures are
//! propagated or logged, never unwrapped.

use architectural_enforcement::{find_violations, Violation};

const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

fn report(policy: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    for violation in violations {
        eprintln!("  {violation}");
    }
    panic!(
        "\nFound {} violation(s) of '{policy}' in production code.",
        violations.len()
    );
}

#[test]
fn test_no_blocking_sleep_in_production_code() {
    let violations = find_violations(PRODUCTION_DIRS, |code| code.contains("thread::sleep("));
    report("no blocking sleep", &violations);
}

#[test]
fn test_no_unwrap_or_expect_in_library_code() {
    let violations = find_violations(&["relay/core/src"], |code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });
    report("no unwrap/expect outside tests", &violations);
}

#[test]
fn test_library_never_installs_a_subscriber() {
    let violations = find_violations(&["relay/core/src"], |code| {
        code.contains("tracing_subscriber")
    });
    report("library does not own logging output", &violations);
}
