//! fork/exec with reliable pre-exec error propagation.
//!
//! Every child is created through a *control pipe*:
//!
//! 1. a pipe is created with the write end close-on-exec;
//! 2. after `fork()`, the child plumbs its stdio, switches process group,
//!    user and directory, and calls `exec`;
//! 3. anything that fails before `exec` is serialised onto the control
//!    pipe, and the child exits;
//! 4. the parent reads the pipe to EOF: an empty read means `exec`
//!    happened (the close-on-exec flag closed the pipe), anything else is
//!    the child's error, reported to the caller as if it were local.
//!
//! The serialised form is the wire error union, so the same payload works
//! for local spawns and for spawns performed remotely on behalf of an RPC
//! peer.

use std::ffi::{CString, OsStr, OsString};
use std::io::Read;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{ForkResult, Gid, Pid, Uid, User};
use tracing::warn;

use ns0_proto::{RemoteError, RemoteErrorKind};

/// Grace period between SIGTERM and SIGKILL when destroying a child.
pub const KILL_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("child setup failed: {0}")]
    PreExec(RemoteError),

    #[error("OS error: {0}")]
    Os(#[from] Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpawnError>;

/// Everything needed to start one child process.
#[derive(Debug, Default)]
pub struct SpawnConfig {
    /// Program to exec. When it contains no slash, `$PATH` is searched.
    /// Falls back to `argv[0]`.
    pub executable: Option<OsString>,
    pub argv: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// `None` inherits the caller's environment.
    pub env: Option<Vec<(OsString, OsString)>>,
    /// User to switch to (name or decimal uid) after setting groups.
    pub user: Option<String>,
    /// Redirection targets, dup'ed into fds 0/1/2. The originals are left
    /// open in the parent.
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
}

/// Resolved account identity for a user switch.
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
}

/// Resolve a user name or decimal uid against the account database.
pub fn lookup_user(user: &str) -> Result<Account> {
    let looked_up = if user.bytes().all(|b| b.is_ascii_digit()) {
        let uid: u32 = user
            .parse()
            .map_err(|_| SpawnError::UnknownUser(user.to_owned()))?;
        User::from_uid(Uid::from_raw(uid))
    } else {
        User::from_name(user)
    };
    match looked_up {
        Ok(Some(u)) => Ok(Account {
            name: u.name,
            uid: u.uid,
            gid: u.gid,
            home: u.dir,
        }),
        Ok(None) => Err(SpawnError::UnknownUser(user.to_owned())),
        Err(e) => Err(SpawnError::Os(e)),
    }
}

fn cstring(s: &OsStr) -> std::result::Result<CString, RemoteError> {
    CString::new(s.as_bytes()).map_err(|_| {
        RemoteError::new(RemoteErrorKind::Value, "NUL byte in argument")
    })
}

/// Child-side setup and exec. Only returns on failure.
fn child_setup(cfg: &SpawnConfig) -> RemoteError {
    fn os_err(what: &str, e: Errno) -> RemoteError {
        RemoteError::new(RemoteErrorKind::Os, format!("{what}: {e}")).with_errno(e as i32)
    }

    // Lift redirection fds above the stdio range first so a later dup2
    // cannot clobber a target that is still pending.
    let mut targets: [Option<RawFd>; 3] = [cfg.stdin, cfg.stdout, cfg.stderr];
    for slot in targets.iter_mut() {
        if let Some(fd) = *slot {
            if fd < 3 {
                let lifted = unsafe { libc::fcntl(fd, libc::F_DUPFD, 3) };
                if lifted < 0 {
                    return os_err("dup", Errno::last());
                }
                *slot = Some(lifted);
            }
        }
    }
    for (stdio, fd) in targets.iter().enumerate() {
        if let Some(fd) = *fd {
            if unsafe { libc::dup2(fd, stdio as RawFd) } < 0 {
                return os_err("dup2", Errno::last());
            }
        }
    }

    if let Err(e) = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        return os_err("setpgid", e);
    }

    if let Some(user) = &cfg.user {
        let account = match lookup_user(user) {
            Ok(a) => a,
            Err(_) => {
                return RemoteError::new(
                    RemoteErrorKind::Key,
                    format!("unknown user: {user}"),
                );
            }
        };
        let name = match CString::new(account.name.as_bytes()) {
            Ok(n) => n,
            Err(_) => return RemoteError::new(RemoteErrorKind::Value, "bad user name"),
        };
        let groups = match nix::unistd::getgrouplist(&name, account.gid) {
            Ok(g) => g,
            Err(e) => return os_err("getgrouplist", e),
        };
        if let Err(e) = nix::unistd::setgid(account.gid) {
            return os_err("setgid", e);
        }
        if let Err(e) = nix::unistd::setgroups(&groups) {
            return os_err("setgroups", e);
        }
        if let Err(e) = nix::unistd::setuid(account.uid) {
            return os_err("setuid", e);
        }
    }

    if let Some(cwd) = &cfg.cwd {
        if let Err(e) = nix::unistd::chdir(cwd) {
            return os_err(&format!("chdir to {}", cwd.display()), e);
        }
    }

    let executable = match (&cfg.executable, cfg.argv.first()) {
        (Some(exe), _) => exe.clone(),
        (None, Some(argv0)) => argv0.clone(),
        (None, None) => {
            return RemoteError::new(RemoteErrorKind::Value, "empty argv");
        }
    };
    let exe_c = match cstring(&executable) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let argv_c: Vec<CString> = match cfg.argv.iter().map(|a| cstring(a)).collect() {
        Ok(v) => v,
        Err(e) => return e,
    };
    let search_path = !executable.as_bytes().contains(&b'/');

    let exec_result = match &cfg.env {
        Some(env) => {
            let env_c: Vec<CString> = match env
                .iter()
                .map(|(k, v)| {
                    let mut kv = k.clone();
                    kv.push("=");
                    kv.push(v);
                    cstring(&kv)
                })
                .collect()
            {
                Ok(v) => v,
                Err(e) => return e,
            };
            if search_path {
                nix::unistd::execvpe(&exe_c, &argv_c, &env_c)
            } else {
                nix::unistd::execve(&exe_c, &argv_c, &env_c)
            }
        }
        None => {
            if search_path {
                nix::unistd::execvp(&exe_c, &argv_c)
            } else {
                nix::unistd::execv(&exe_c, &argv_c)
            }
        }
    };
    match exec_result {
        Ok(never) => match never {},
        Err(e) => os_err(&format!("exec {}", executable.to_string_lossy()), e),
    }
}

/// Fork and exec per `cfg`; returns the child pid once `exec` succeeded.
///
/// Failures inside the child, up to and including the `exec` call itself,
/// are reported here as [`SpawnError::PreExec`]; the child never survives
/// them.
pub fn spawn(cfg: &SpawnConfig) -> Result<i32> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;

    match unsafe { nix::unistd::fork() }? {
        ForkResult::Parent { child } => {
            drop(write_end);
            let mut report = Vec::new();
            let mut file = std::fs::File::from(read_end);
            file.read_to_end(&mut report)?;
            if report.is_empty() {
                return Ok(child.as_raw());
            }
            // The child never ran exec; reap it before reporting.
            let _ = wait(child.as_raw());
            let remote: RemoteError = serde_json::from_slice(&report).unwrap_or_else(|_| {
                RemoteError::new(
                    RemoteErrorKind::Runtime,
                    String::from_utf8_lossy(&report).into_owned(),
                )
            });
            Err(SpawnError::PreExec(remote))
        }
        ForkResult::Child => {
            drop(read_end);
            let err = child_setup(cfg);
            let payload = serde_json::to_vec(&err).unwrap_or_default();
            let _ = nix::unistd::write(write_end.as_fd(), &payload);
            unsafe { libc::_exit(1) }
        }
    }
}

// ---------------------------------------------------------------------------
// Wait / poll / signal
// ---------------------------------------------------------------------------

/// Decoded raw wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with this code.
    Exited(i32),
    /// Killed by this signal.
    Signaled(i32),
}

/// Split a raw wait status into exit code or terminating signal.
pub fn decode_status(raw: i32) -> ExitStatus {
    if libc::WIFSIGNALED(raw) {
        ExitStatus::Signaled(libc::WTERMSIG(raw))
    } else {
        ExitStatus::Exited(libc::WEXITSTATUS(raw))
    }
}

fn waitpid_raw(pid: i32, flags: libc::c_int) -> Result<Option<i32>> {
    loop {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, flags) };
        if rc == pid {
            return Ok(Some(status));
        }
        if rc == 0 {
            return Ok(None);
        }
        let errno = Errno::last();
        if errno == Errno::EINTR {
            continue;
        }
        return Err(SpawnError::Os(errno));
    }
}

/// Non-blocking check; the raw status when the child has terminated.
pub fn poll(pid: i32) -> Result<Option<i32>> {
    waitpid_raw(pid, libc::WNOHANG)
}

/// Block until the child terminates; returns the raw status.
pub fn wait(pid: i32) -> Result<i32> {
    match waitpid_raw(pid, 0)? {
        Some(status) => Ok(status),
        // WNOHANG not set, so None cannot happen
        None => Err(SpawnError::Os(Errno::ECHILD)),
    }
}

/// Send a signal to the child.
pub fn send_signal(pid: i32, signal: i32) -> Result<()> {
    let sig = Signal::try_from(signal).map_err(SpawnError::Os)?;
    kill(Pid::from_raw(pid), sig)?;
    Ok(())
}

/// Terminate a still-running child: SIGTERM, up to [`KILL_WAIT`] of
/// polling, then SIGKILL. Returns the raw status.
pub fn terminate(pid: i32) -> Result<i32> {
    if let Some(status) = poll(pid)? {
        return Ok(status);
    }
    send_signal(pid, libc::SIGTERM)?;
    let deadline = Instant::now() + KILL_WAIT;
    while Instant::now() < deadline {
        if let Some(status) = poll(pid)? {
            return Ok(status);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    warn!(pid, "killing forcefully");
    send_signal(pid, libc::SIGKILL)?;
    wait(pid)
}

/// A pipe pair for stdio plumbing, read end first.
pub fn stdio_pipe() -> Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe()?)
}

/// Duplicate an inherited raw fd into an owned one.
///
/// # Safety
/// `fd` must be open and not owned elsewhere as an `OwnedFd`.
pub unsafe fn owned_from_raw(fd: RawFd) -> OwnedFd {
    unsafe { OwnedFd::from_raw_fd(fd) }
}
