//! The startup guard against a real process's fd 1.
//!
//! The test re-runs this test binary with a marker variable set; in that child
//! the guard is engaged on the real stdout, noise is written, and stdout is
//! restored before a final line.
#![cfg(unix)]

use std::io::Write;
use std::process::Command;

use combine_mcp::isolation::StdoutGuard;

const CHILD_MARKER: &str = "COMBINE_MCP_STDOUT_GUARD_CHILD";

#[test]
fn test_stdout_guard_child() {
    if std::env::var_os(CHILD_MARKER).is_none() {
        return;
    }

    let mut guard = StdoutGuard::engage().unwrap();
    assert!(guard.is_engaged());

    let mut stdout = std::io::stdout();
    writeln!(stdout, "startup noise from a dependency").unwrap();
    stdout.flush().unwrap();

    guard.restore().unwrap();
    assert!(!guard.is_engaged());
    writeln!(stdout, "first protocol line").unwrap();
    stdout.flush().unwrap();
}

#[test]
fn test_engaged_guard_keeps_startup_noise_off_stdout() {
    let output = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "test_stdout_guard_child", "--nocapture", "--test-threads=1"])
        .env(CHILD_MARKER, "1")
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "child failed: {stdout}\n{stderr}");

    assert!(!stdout.contains("startup noise"), "stdout: {stdout}");
    assert!(stdout.contains("first protocol line"), "stdout: {stdout}");
    assert!(stderr.contains("startup noise from a dependency"), "stderr: {stderr}");
}
