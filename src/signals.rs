//! Signal delivery and naming for supervised children.
//!
//! Control-socket clients address signals by symbolic name (`TERM`, `KILL`,
//! optionally `SIG`-prefixed) or by decimal number; the process record
//! stores the conventional description (`terminated`, `killed`, ...).

use std::io;

/// name, number, conventional description.
const SIGNAL_TABLE: &[(&str, i32, &str)] = &[
    ("HUP", libc::SIGHUP, "hangup"),
    ("INT", libc::SIGINT, "interrupt"),
    ("QUIT", libc::SIGQUIT, "quit"),
    ("ILL", libc::SIGILL, "illegal instruction"),
    ("TRAP", libc::SIGTRAP, "trace/breakpoint trap"),
    ("ABRT", libc::SIGABRT, "aborted"),
    ("BUS", libc::SIGBUS, "bus error"),
    ("FPE", libc::SIGFPE, "floating point exception"),
    ("KILL", libc::SIGKILL, "killed"),
    ("USR1", libc::SIGUSR1, "user defined signal 1"),
    ("SEGV", libc::SIGSEGV, "segmentation fault"),
    ("USR2", libc::SIGUSR2, "user defined signal 2"),
    ("PIPE", libc::SIGPIPE, "broken pipe"),
    ("ALRM", libc::SIGALRM, "alarm clock"),
    ("TERM", libc::SIGTERM, "terminated"),
    ("CHLD", libc::SIGCHLD, "child exited"),
    ("CONT", libc::SIGCONT, "continued"),
    ("STOP", libc::SIGSTOP, "stopped (signal)"),
    ("TSTP", libc::SIGTSTP, "stopped"),
    ("TTIN", libc::SIGTTIN, "stopped (tty input)"),
    ("TTOU", libc::SIGTTOU, "stopped (tty output)"),
    ("WINCH", libc::SIGWINCH, "window changed"),
];

/// Parse a control payload into a signal number: a symbolic name with an
/// optional `SIG` prefix, or a decimal number.
pub fn parse_signal(payload: &[u8]) -> Option<i32> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(number) = text.parse::<i32>() {
        return (number > 0).then_some(number);
    }
    let name = text.to_ascii_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    SIGNAL_TABLE
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|&(_, number, _)| number)
}

/// Conventional description for a signal, e.g. `terminated` for SIGTERM.
pub fn signal_description(signo: i32) -> String {
    SIGNAL_TABLE
        .iter()
        .find(|&&(_, number, _)| number == signo)
        .map(|&(_, _, description)| description.to_string())
        .unwrap_or_else(|| format!("signal {signo}"))
}

/// Send a signal to a process group first, then fall back to the direct pid.
///
/// The supervised child calls `setsid()`, so signaling `-pid` reaches its
/// descendants as well. Callers choose whether a missing pid (`ESRCH`)
/// should be treated as success (already exited) or as an error.
pub fn signal_process_group_or_pid(pid: i32, signal: i32, missing_is_ok: bool) -> io::Result<()> {
    if pid <= 0 {
        return Ok(());
    }

    // SAFETY: `libc::kill` is called with plain integer pid/signal values.
    // We do not dereference pointers, and we only read errno immediately
    // after each syscall to capture its result for this thread.
    unsafe {
        if libc::kill(-pid, signal) == 0 {
            return Ok(());
        }
        let group_err = io::Error::last_os_error();

        if libc::kill(pid, signal) == 0 {
            return Ok(());
        }
        let pid_err = io::Error::last_os_error();

        if missing_target_can_be_ignored(missing_is_ok, &pid_err) {
            return Ok(());
        }

        Err(io::Error::new(
            pid_err.kind(),
            format!(
                "group(-{pid}) signal failed: {group_err}; pid({pid}) signal failed: {pid_err}"
            ),
        ))
    }
}

fn is_no_such_process(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ESRCH)
}

fn missing_target_can_be_ignored(missing_is_ok: bool, pid_err: &io::Error) -> bool {
    // Treat "missing target" as success only when the direct pid lookup
    // reports ESRCH. A missing process group alone does not guarantee the
    // pid signal path is safe to ignore.
    missing_is_ok && is_no_such_process(pid_err)
}
