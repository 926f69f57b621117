//! Integration tests that lock mshell CLI flag and output behavior.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn combined_output(output: &std::process::Output) -> String {
    let mut combined = String::new();
    combined.push_str(&String::from_utf8_lossy(&output.stdout));
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

fn mshell_bin() -> &'static str {
    option_env!("CARGO_BIN_EXE_mshell").expect("mshell test binary not built")
}

#[test]
fn help_mentions_the_nohup_subcommand() {
    let output = Command::new(mshell_bin())
        .arg("--help")
        .output()
        .expect("run mshell --help");
    assert!(output.status.success());
    let combined = combined_output(&output);
    assert!(combined.contains("nohup"));
    assert!(combined.contains("--logs"));
}

#[test]
fn nohup_help_documents_the_socket_flag() {
    let output = Command::new(mshell_bin())
        .args(["nohup", "--help"])
        .output()
        .expect("run mshell nohup --help");
    assert!(output.status.success());
    let combined = combined_output(&output);
    assert!(combined.contains("--stdin-socket"));
    assert!(combined.contains("--idle-flush-ms"));
}

#[test]
fn bare_command_name_is_refused() {
    let output = Command::new(mshell_bin())
        .args(["nohup", "--", "run.sh"])
        .output()
        .expect("run mshell nohup run.sh");
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("containing directory"));
}

#[test]
fn supervised_command_produces_a_complete_record() {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("ms-cli-{nanos}"));
    fs::create_dir_all(&dir).expect("create process dir");
    let script = dir.join("run.sh");
    fs::write(&script, "#!/bin/sh\necho from-cli\nexit 7\n").expect("write script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod script");

    let output = Command::new(mshell_bin())
        .args(["nohup", "--", script.to_str().expect("utf-8 path")])
        .output()
        .expect("run mshell nohup");
    // The supervisor's own exit code is independent of the child's.
    assert!(output.status.success(), "{}", combined_output(&output));

    let exit_status = fs::read_to_string(dir.join("exit-status")).expect("exit-status");
    assert_eq!(exit_status, "7");
    assert_eq!(
        fs::read_to_string(dir.join("completed")).expect("completed"),
        "true"
    );
    let log = fs::read(dir.join("output.log")).expect("output.log");
    assert!(!log.is_empty());
}
