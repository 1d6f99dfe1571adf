//! Subprocess harness for tests that need a process to themselves
//!
//! The parent re-runs the test binary filtered to one test with
//! `WEFT_ABORT_VICTIM` set; the child takes the real path. Used for paths
//! that end in `fatal!` (the parent checks for SIGABRT) and for checks
//! that parallel tests would disturb, such as descriptor reuse.
//!
//! Compiled for this crate's own tests and, through the `test-support`
//! feature, for the dev-builds of crates layered on top of it.

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

const VICTIM_ENV: &str = "WEFT_ABORT_VICTIM";

/// True inside the child process
pub fn is_victim() -> bool {
    std::env::var_os(VICTIM_ENV).is_some()
}

fn run_alone(test_path: &str) -> Output {
    let exe = std::env::current_exe().unwrap();
    Command::new(exe)
        .args([test_path, "--exact", "--nocapture", "--test-threads=1"])
        .env(VICTIM_ENV, "1")
        .output()
        .unwrap()
}

/// Run `test_path` in a child process and assert it aborted
pub fn assert_aborts(test_path: &str) {
    let output = run_alone(test_path);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "{} did not abort: {:?}\nstderr:\n{}",
        test_path,
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Run `test_path` alone in a child process and assert it passed
pub fn assert_passes_alone(test_path: &str) {
    let output = run_alone(test_path);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success() && stdout.contains("1 passed"),
        "{} failed in isolation: {:?}\nstdout:\n{}\nstderr:\n{}",
        test_path,
        output.status,
        stdout,
        String::from_utf8_lossy(&output.stderr)
    );
}
