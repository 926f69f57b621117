//! End-to-end supervision tests against real `/bin/sh` children.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mshell::chunk::{Chunk, STREAM_SIGNAL, STREAM_STDERR, STREAM_STDIN, STREAM_STDOUT};
use mshell::codec::{encode, LogReader};
use mshell::procdir::ProcessDir;
use mshell::supervisor::{RunConfig, RunOutcome, Supervisor};

fn scratch_process_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("ms-e2e-{tag}-{nanos}"));
    fs::create_dir_all(&dir).expect("create process dir");
    dir
}

/// Install a `/bin/sh` script as the supervised executable and return the
/// run configuration pointing at it.
fn script_config(tag: &str, body: &str) -> RunConfig {
    let dir = scratch_process_dir(tag);
    let script = dir.join("run.sh");
    fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod script");
    RunConfig::new(
        vec![script.to_string_lossy().into_owned()],
        dir,
    )
}

fn run_to_completion(config: RunConfig) -> (ProcessDir, RunOutcome) {
    let dir = ProcessDir::new(config.process_dir.clone());
    let outcome = Supervisor::new(config).run().expect("supervision");
    (dir, outcome)
}

fn log_chunks(dir: &ProcessDir) -> Vec<Chunk> {
    let bytes = fs::read(dir.output_log_path()).unwrap_or_default();
    LogReader::new(std::io::Cursor::new(bytes))
        .chunks()
        .filter(|c| c.error.is_none())
        .collect()
}

fn stream_payload(dir: &ProcessDir, stream: &str) -> Vec<u8> {
    log_chunks(dir)
        .into_iter()
        .filter(|c| c.stream == stream)
        .flat_map(|c| c.payload)
        .collect()
}

fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn socket_path(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("ms-{tag}-{nanos}.sock"))
}

fn send_frame(path: &Path, stream: &str, payload: &[u8]) {
    let mut client = UnixStream::connect(path).expect("connect control socket");
    client
        .write_all(&encode(&Chunk::now(stream, payload.to_vec())))
        .expect("send control frame");
    client.flush().expect("flush control frame");
}

#[test]
fn exit_status_propagates_and_record_is_finalized() {
    let (dir, outcome) = run_to_completion(script_config("exit42", "exit 42"));

    assert_eq!(outcome.exit_status, 42);
    assert_eq!(outcome.signal, None);
    assert_eq!(dir.read("exit-status").expect("exit-status"), "42");
    assert_eq!(dir.read("completed").expect("completed"), "true");
    assert!(!dir.exists("signal"), "signal file must be absent");
    assert!(!dir.exists("status"), "status file must be absent when done");
    assert!(dir.exists("pid"));
    assert!(dir.exists("starttime"));
    assert!(dir.exists("endtime"));
    assert_eq!(
        dir.read("content-type").expect("content-type"),
        "text/plain; charset=utf-8"
    );
    let recorded_cmd = dir.read_cmd().expect("cmd");
    assert!(recorded_cmd[0].ends_with("run.sh"));
}

#[test]
fn prompt_without_newline_becomes_visible_while_child_still_runs() {
    let config = script_config("prompt", "printf 'Enter filename: '\nsleep 2");
    let dir = ProcessDir::new(config.process_dir.clone());
    let runner = thread::spawn(move || Supervisor::new(config).run());

    let appeared = wait_until(Duration::from_millis(1200), || {
        log_chunks(&dir)
            .iter()
            .any(|c| c.stream == STREAM_STDOUT && c.payload == b"Enter filename: ")
    });
    assert!(appeared, "prompt chunk did not appear before the child slept out");

    runner.join().expect("runner thread").expect("supervision");
}

#[test]
fn newlines_are_preserved_byte_exactly() {
    let (dir, _) = run_to_completion(script_config("newline", "printf 'line1\\nline2\\n'"));
    assert_eq!(stream_payload(&dir, STREAM_STDOUT), b"line1\nline2\n");
}

#[test]
fn hundred_lines_arrive_in_order_and_settle_the_classifier() {
    let body = "i=1\nwhile [ $i -le 100 ]; do echo \"line $i\"; i=$((i+1)); done";
    let (dir, _) = run_to_completion(script_config("order", body));

    let expected: Vec<u8> = (1..=100)
        .flat_map(|i| format!("line {i}\n").into_bytes())
        .collect();
    assert_eq!(stream_payload(&dir, STREAM_STDOUT), expected);

    let output_type = dir.read("output-type").expect("output-type");
    assert!(
        output_type.starts_with("text,"),
        "unexpected verdict {output_type:?}"
    );
}

#[test]
fn child_sees_a_controlling_terminal() {
    let (dir, _) = run_to_completion(script_config("tty", "test -t 0 && echo tty"));
    let stdout = stream_payload(&dir, STREAM_STDOUT);
    assert!(
        stdout.windows(3).any(|w| w == b"tty"),
        "stdout was {stdout:?}"
    );
}

#[test]
fn ansi_escapes_pass_through_unmodified() {
    let (dir, _) = run_to_completion(script_config(
        "ansi",
        "printf '\\033[31mRED\\033[0m\\n'",
    ));
    let stdout = stream_payload(&dir, STREAM_STDOUT);
    assert!(
        stdout.windows(5).any(|w| w == b"\x1b[31m"),
        "stdout was {stdout:?}"
    );
}

#[test]
fn stderr_is_captured_on_its_own_stream() {
    let (dir, _) = run_to_completion(script_config(
        "stderr",
        "echo visible\necho oops >&2",
    ));
    assert_eq!(stream_payload(&dir, STREAM_STDERR), b"oops\n");
    assert_eq!(stream_payload(&dir, STREAM_STDOUT), b"visible\n");
}

#[test]
fn named_signal_reaches_a_trapping_child_and_is_recorded() {
    let mut config = script_config(
        "sigterm",
        "trap 'exit 143' TERM\necho ready\nwhile :; do sleep 0.1; done",
    );
    let socket = socket_path("sigterm");
    config.stdin_socket = Some(socket.clone());
    let dir = ProcessDir::new(config.process_dir.clone());
    let runner = thread::spawn(move || Supervisor::new(config).run());

    assert!(
        wait_until(Duration::from_secs(5), || {
            stream_payload(&dir, STREAM_STDOUT)
                .windows(5)
                .any(|w| w == b"ready")
        }),
        "child never reported ready"
    );
    send_frame(&socket, STREAM_SIGNAL, b"TERM");

    let outcome = runner.join().expect("runner thread").expect("supervision");
    assert_ne!(outcome.exit_status, 0);
    assert_eq!(dir.read("completed").expect("completed"), "true");
    assert_ne!(dir.read("exit-status").expect("exit-status"), "0");
    let signal = dir.read("signal").expect("signal file");
    assert!(
        signal.contains("terminated"),
        "signal file was {signal:?}"
    );
    // Control traffic never lands in the log as content.
    assert!(log_chunks(&dir).iter().all(|c| c.stream != STREAM_SIGNAL));
}

#[test]
fn numeric_signal_kills_an_untrappable_loop() {
    let mut config = script_config("sigkill", "echo ready\nwhile :; do sleep 0.1; done");
    let socket = socket_path("sigkill");
    config.stdin_socket = Some(socket.clone());
    let dir = ProcessDir::new(config.process_dir.clone());
    let runner = thread::spawn(move || Supervisor::new(config).run());

    assert!(
        wait_until(Duration::from_secs(5), || {
            stream_payload(&dir, STREAM_STDOUT)
                .windows(5)
                .any(|w| w == b"ready")
        }),
        "child never reported ready"
    );
    send_frame(&socket, STREAM_SIGNAL, b"9");

    let outcome = runner.join().expect("runner thread").expect("supervision");
    assert_eq!(outcome.exit_status, 128 + 9);
    let signal = dir.read("signal").expect("signal file");
    assert!(signal.contains("killed"), "signal file was {signal:?}");
    assert_eq!(dir.read("completed").expect("completed"), "true");
}

#[test]
fn stdin_frames_reach_the_child_and_are_audited() {
    let mut config = script_config("stdin", "read line\necho \"got:$line\"");
    let socket = socket_path("stdin");
    config.stdin_socket = Some(socket.clone());
    let dir = ProcessDir::new(config.process_dir.clone());
    let runner = thread::spawn(move || Supervisor::new(config).run());

    assert!(
        wait_until(Duration::from_secs(5), || socket.exists()),
        "control socket never appeared"
    );
    send_frame(&socket, STREAM_STDIN, b"hello\n");

    runner.join().expect("runner thread").expect("supervision");
    assert_eq!(stream_payload(&dir, STREAM_STDIN), b"hello\n");
    let stdout = stream_payload(&dir, STREAM_STDOUT);
    assert!(
        stdout
            .windows(9)
            .any(|w| w == b"got:hello"),
        "stdout was {stdout:?}"
    );
}

#[test]
fn preexisting_output_log_refuses_to_start() {
    let config = script_config("refuse", "echo never runs");
    let dir = ProcessDir::new(config.process_dir.clone());
    fs::write(dir.output_log_path(), b"left over").expect("seed stale log");

    let err = Supervisor::new(config).run().expect_err("must refuse");
    assert!(
        err.to_string().contains("already exists"),
        "error was {err:#}"
    );
    assert_eq!(dir.read("completed").expect("completed"), "false");
    assert!(!dir.exists("pid"), "child must not have been spawned");
}
