//! Rules for the streaming library's production code

use architectural_enforcement::{scan, workspace_root, Violation};

fn core_src() -> std::path::PathBuf {
    workspace_root().join("tablestream").join("core").join("src")
}

fn assert_clean(violations: &[Violation], rule: &str) {
    assert!(
        violations.is_empty(),
        "{rule}:\n{}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}

#[test]
fn test_scanner_finds_library_sources() {
    assert!(core_src().join("lib.rs").exists());
}

#[test]
fn test_no_blocking_sleep() {
    let violations = scan(&core_src(), &["std::thread::sleep", "thread::sleep("]);
    assert_clean(&violations, "Blocking sleep in async library code");
}

#[test]
fn test_library_never_installs_subscriber() {
    let violations = scan(&core_src(), &["tracing_subscriber", "set_global_default"]);
    assert_clean(&violations, "Only binaries may configure logging");
}

#[test]
fn test_no_panicking_unwraps() {
    let violations = scan(&core_src(), &[".unwrap()", ".expect("]);
    assert_clean(&violations, "Propagate errors instead of panicking");
}

#[test]
fn test_no_direct_printing() {
    let violations = scan(&core_src(), &["println!", "eprintln!", "dbg!("]);
    assert_clean(&violations, "Use tracing instead of printing");
}
