//! PTY allocation and child lifecycle so the supervised command behaves as
//! if running in an interactive terminal.
//!
//! The child is spawned in a new session with the PTY slave as its
//! controlling terminal (stdin and stdout); standard error goes to a
//! dedicated pipe so the two output streams stay distinguishable.

use std::ffi::CString;
use std::io::{self, ErrorKind};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

/// Fixed terminal geometry for supervised children.
pub const WINDOW_ROWS: u16 = 24;
pub const WINDOW_COLS: u16 = 80;

/// A spawned supervised child: the PTY master (child stdin and stdout), the
/// stderr pipe read end, and the child pid.
pub struct SpawnedChild {
    pub master: OwnedFd,
    pub stderr: OwnedFd,
    pub pid: i32,
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
}

/// Fork and exec `argv` under a fresh PTY, in a new session, with `workdir`
/// as its working directory and `TERM=term`.
///
/// # Errors
///
/// Returns an error if PTY allocation, the stderr pipe, or the fork fails,
/// or if any argument contains a NUL byte.
pub fn spawn_supervised(argv: &[String], workdir: &Path, term: &str) -> Result<SpawnedChild> {
    if argv.is_empty() {
        bail!("refusing to spawn an empty command");
    }
    let cwd = CString::new(workdir.as_os_str().as_bytes())
        .with_context(|| format!("working directory contains NUL byte: {}", workdir.display()))?;
    let term_value =
        CString::new(term).with_context(|| format!("TERM value contains NUL byte: {term}"))?;
    let mut argv_c: Vec<CString> = Vec::with_capacity(argv.len());
    for arg in argv {
        argv_c.push(
            CString::new(arg.as_str())
                .with_context(|| format!("command argument contains NUL byte: {arg}"))?,
        );
    }

    // SAFETY: argv/cwd/TERM are valid CStrings; spawn_pty_child transfers
    // ownership of the returned fds to the caller exactly once.
    unsafe { spawn_pty_child(&argv_c, &cwd, &term_value) }
}

/// Forks and execs a child process under a new PTY.
///
/// # Safety
///
/// The caller must ensure `argv`, `working_dir`, and `term_value` are valid
/// C strings. The child process calls `_exit(1)` on any setup failure to
/// avoid undefined behavior from returning after `fork()`.
unsafe fn spawn_pty_child(
    argv: &[CString],
    working_dir: &CString,
    term_value: &CString,
) -> Result<SpawnedChild> {
    let mut master_fd: RawFd = -1;
    let mut slave_fd: RawFd = -1;
    let mut stderr_fds = [-1; 2];

    let mut winsize = libc::winsize {
        ws_row: WINDOW_ROWS,
        ws_col: WINDOW_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: openpty expects valid pointers for master/slave/winsize; we
    // pass stack locals.
    if libc::openpty(
        &mut master_fd,
        &mut slave_fd,
        ptr::null_mut(),
        ptr::null_mut(),
        &mut winsize,
    ) != 0
    {
        return Err(errno_error("openpty failed"));
    }

    if libc::pipe(stderr_fds.as_mut_ptr()) != 0 {
        close_fd(master_fd);
        close_fd(slave_fd);
        return Err(errno_error("pipe(stderr) failed"));
    }

    set_cloexec(master_fd)?;
    set_cloexec(slave_fd)?;
    set_cloexec(stderr_fds[0])?;
    set_cloexec(stderr_fds[1])?;

    // SAFETY: fork is called before any unsafe Rust invariants are relied on.
    let pid = libc::fork();
    if pid < 0 {
        close_fd(master_fd);
        close_fd(slave_fd);
        close_fd(stderr_fds[0]);
        close_fd(stderr_fds[1]);
        return Err(errno_error("fork failed"));
    }

    if pid == 0 {
        child_exec(
            master_fd,
            slave_fd,
            stderr_fds[0],
            stderr_fds[1],
            argv,
            working_dir,
            term_value,
        );
    }

    close_fd(slave_fd);
    close_fd(stderr_fds[1]);
    Ok(SpawnedChild {
        master: OwnedFd::from_raw_fd(master_fd),
        stderr: OwnedFd::from_raw_fd(stderr_fds[0]),
        pid,
    })
}

/// Child process setup after fork: configures the PTY and execs the target.
///
/// # Safety
///
/// Must only be called in the child process after `fork()`. Never returns:
/// it either execs or `_exit(1)`s.
unsafe fn child_exec(
    master_fd: RawFd,
    slave_fd: RawFd,
    stderr_read_fd: RawFd,
    stderr_write_fd: RawFd,
    argv: &[CString],
    working_dir: &CString,
    term_value: &CString,
) -> ! {
    let fail = |context: &str| -> ! {
        let err = io::Error::last_os_error();
        let msg = format!("child setup {context} failed: {err}\n");
        // SAFETY: write is async-signal-safe and stderr is a valid fd in
        // the child (the stderr pipe once dup2 has run).
        let _ = libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
        );
        libc::_exit(1);
    };

    close_fd(master_fd);
    close_fd(stderr_read_fd);

    if libc::setsid() == -1 {
        fail("setsid");
    }
    if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
        fail("ioctl(TIOCSCTTY)");
    }

    // The log must hold the child's bytes unmodified; stop the line
    // discipline from rewriting LF to CRLF on the way out.
    let mut termios: libc::termios = std::mem::zeroed();
    if libc::tcgetattr(slave_fd, &mut termios) == 0 {
        termios.c_oflag &= !libc::ONLCR;
        let _ = libc::tcsetattr(slave_fd, libc::TCSANOW, &termios);
    }

    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0 || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
    {
        fail("dup2(slave)");
    }
    if libc::dup2(stderr_write_fd, libc::STDERR_FILENO) < 0 {
        fail("dup2(stderr pipe)");
    }
    close_fd(slave_fd);
    close_fd(stderr_write_fd);

    if libc::chdir(working_dir.as_ptr()) != 0 {
        fail("chdir");
    }

    let term_key = b"TERM\0";
    if libc::setenv(
        term_key.as_ptr() as *const libc::c_char,
        term_value.as_ptr(),
        1,
    ) != 0
    {
        fail("setenv(TERM)");
    }

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(ptr::null());

    libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
    fail("execvp");
}

/// Apply the fixed window size to the PTY master.
///
/// # Errors
///
/// Returns an error if the window-size ioctl fails; callers treat this as
/// best-effort.
pub fn set_winsize(master_fd: RawFd, rows: u16, cols: u16) -> Result<()> {
    let ws = libc::winsize {
        ws_row: rows.max(1),
        ws_col: cols.max(1),
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: ioctl reads master_fd and the initialized ws struct.
    let result = unsafe { libc::ioctl(master_fd, libc::TIOCSWINSZ, &ws) };
    if result != 0 {
        return Err(errno_error("ioctl(TIOCSWINSZ) failed"));
    }
    Ok(())
}

/// Block until the child terminates; reaps it.
pub fn wait_child(pid: i32) -> io::Result<ChildStatus> {
    loop {
        let mut status = 0;
        // SAFETY: pid is the supervised child owned by this process; waitpid
        // with no flags blocks until a state change.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if libc::WIFEXITED(status) {
            return Ok(ChildStatus::Exited(libc::WEXITSTATUS(status)));
        }
        if libc::WIFSIGNALED(status) {
            return Ok(ChildStatus::Signaled(libc::WTERMSIG(status)));
        }
    }
}

/// Attempt a single write without retry loops.
pub(crate) fn try_write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    // SAFETY: fd is a live descriptor and data is a live slice.
    let written = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    if written == 0 {
        return Err(io::Error::new(ErrorKind::WriteZero, "write returned 0"));
    }
    Ok(written as usize)
}

/// Write the entire buffer, retrying short writes and transient errors.
pub(crate) fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let written = match try_write(fd, data) {
            Ok(written) => written,
            Err(err) => {
                if err.kind() == ErrorKind::Interrupted || err.kind() == ErrorKind::WouldBlock {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                if err.kind() == ErrorKind::WriteZero {
                    return Err(anyhow!("write returned 0"));
                }
                return Err(anyhow!("write failed: {err}"));
            }
        };
        data = if written <= data.len() {
            &data[written..]
        } else {
            &[]
        };
    }
    Ok(())
}

/// Configure a file descriptor for non-blocking reads.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl only inspects and updates flags on fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Mark a file descriptor close-on-exec so leaked descriptors do not survive
/// exec boundaries.
fn set_cloexec(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Ok(());
    }
    // SAFETY: fcntl only inspects and updates flags on fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(errno_error("fcntl(F_GETFD) failed"));
    }
    // SAFETY: as above.
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(errno_error("fcntl(F_SETFD, FD_CLOEXEC) failed"));
    }
    Ok(())
}

/// Helper that formats OS errors with additional context.
fn errno_error(context: &str) -> anyhow::Error {
    anyhow!("{context}: {}", io::Error::last_os_error())
}

/// Close a file descriptor while ignoring errors.
///
/// # Safety
///
/// `fd` must be a valid, open file descriptor (or -1 to ignore).
unsafe fn close_fd(fd: RawFd) {
    if fd >= 0 {
        let _ = libc::close(fd);
    }
}
