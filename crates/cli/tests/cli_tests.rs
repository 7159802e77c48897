//! CLI integration tests

use std::process::Command;

fn clusterctl(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_clusterctl"))
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = clusterctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("group manager"), "Should describe the tool");
    assert!(stdout.contains("status"), "Should show status command");
    assert!(stdout.contains("hosts"), "Should show hosts command");
    assert!(stdout.contains("reconfigure"), "Should show reconfigure command");
    assert!(stdout.contains("vms"), "Should show vms command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = clusterctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("clusterctl"), "Should show binary name");
}

#[test]
fn test_vms_submit_help() {
    let output = clusterctl(&["vms", "submit", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Submit help should succeed");
    assert!(stdout.contains("--file"), "Should show file option");
    assert!(stdout.contains("--wait"), "Should show wait option");
    assert!(stdout.contains("--host"), "Should show host binding option");
}

#[test]
fn test_vms_control_rejects_unknown_command() {
    let output = clusterctl(&["vms", "control", "lc-a", "vm-1", "explode"]);

    assert!(!output.status.success(), "Unknown commands should be rejected");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("explode"));
}

#[test]
fn test_unreachable_group_manager_fails() {
    let output = clusterctl(&["--api-url", "http://127.0.0.1:1", "status"]);

    assert!(!output.status.success(), "Status should fail without a group manager");
}
