//! ---
//! dbr_section: "15-testing-qa-runbook"
//! dbr_subsection: "integration-tests"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Command-line behaviour of dbrctl against the simulated channel."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use assert_cmd::Command;

fn dbrctl(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("dbrctl").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("DBR_CONFIG")
        .env_remove("DBR_TIMEOUT");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "dbrctl failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn help_lists_lifecycle_commands_only() {
    let dir = tempfile::tempdir().unwrap();
    let stdout = stdout_of(dbrctl(&dir).arg("--help"));
    for command in ["start", "stop", "save", "restore", "status"] {
        assert!(stdout.contains(command), "missing {command}");
    }
    assert!(!stdout.contains("launch-one-node"));
}

#[test]
fn simulated_start_reaches_ready() {
    let dir = tempfile::tempdir().unwrap();
    let stdout = stdout_of(dbrctl(&dir).args([
        "--channel",
        "simulated",
        "--hosts",
        "c1,c2",
        "--print-metrics",
        "start",
    ]));
    assert!(stdout.contains("\"phase\": \"ready\""));
    assert!(stdout.contains("\"endpoint\": \"c2:1601\""));
    assert!(stdout.contains("dbr_cluster_phase 3"));
}

#[test]
fn simulated_save_reports_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let stdout = stdout_of(dbrctl(&dir).args([
        "--channel",
        "simulated",
        "--hosts",
        "c1,c2,c3",
        "save",
    ]));
    assert!(stdout.contains("\"lastsave\""));
    for node in ["0-0", "1-0", "2-0"] {
        assert!(stdout.contains(node), "missing node {node}");
    }
}

#[test]
fn status_reads_host_file() {
    let dir = tempfile::tempdir().unwrap();
    let hostfile = dir.path().join("hosts");
    std::fs::write(&hostfile, "h1\nh2\nh1\n").unwrap();
    let stdout = stdout_of(
        dbrctl(&dir)
            .args(["--channel", "simulated", "status", "--hostfile"])
            .arg(&hostfile),
    );
    assert_eq!(stdout.matches("\"ready\": true").count(), 2);
}

#[test]
fn config_prints_effective_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let stdout = stdout_of(dbrctl(&dir).arg("config"));
    assert!(stdout.contains("\"base_port\": 1601"));
    assert!(stdout.contains("LSB_DJOB_HOSTFILE"));
}

#[test]
fn config_masks_cluster_password() {
    let dir = tempfile::tempdir().unwrap();
    let stdout = stdout_of(dbrctl(&dir).arg("config"));
    assert!(!stdout.contains("foobared"));
    assert!(stdout.contains("\"password\": \"<redacted>\""));
}
