//! Running programs inside nodes.
//!
//! [`Subprocess`] is the low-level handle: spawn via the node's slave,
//! then poll/wait/signal by pid. [`Popen`] adds pipe plumbing and a
//! `communicate` loop in the style of the usual process libraries. All
//! descriptors created for pipes live in the master; the child ends are
//! passed over the RPC channel and closed locally after the spawn.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::warn;

use ns0_spawn::{ExitStatus, decode_status};

use crate::client::RemoteSpawn;
use crate::config;
use crate::node::{Node, NodeInner, lock};
use crate::{Error, Result};

/// Grace period between TERM and KILL when a handle is dropped while its
/// child still runs.
const KILL_WAIT: Duration = Duration::from_secs(3);

/// Redirection request for one stdio slot.
#[derive(Debug, Default)]
pub enum Stdio {
    /// Share the slave's descriptor.
    #[default]
    Inherit,
    /// Create a pipe whose master end becomes a stream on the handle.
    Pipe,
    /// Redirect to this descriptor.
    Fd(OwnedFd),
    /// Duplicate whatever stdout got (stderr only).
    ToStdout,
}

/// Which account the child runs under.
#[derive(Debug, Clone, Default)]
pub enum UserSpec {
    /// The configured default ([`config::run_as`]).
    #[default]
    Default,
    /// No user switch.
    Current,
    /// A specific user name or decimal uid.
    Named(String),
}

/// Everything describing one child to start inside a node.
#[derive(Debug, Default)]
pub struct SpawnOpts {
    pub argv: Vec<OsString>,
    /// Overrides `argv[0]` as the program to exec.
    pub executable: Option<OsString>,
    /// Wrap the (single-element) argv in `/bin/sh -c`.
    pub shell: bool,
    pub cwd: Option<PathBuf>,
    pub env: Option<Vec<(OsString, OsString)>>,
    pub user: UserSpec,
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl SpawnOpts {
    pub fn command<S: AsRef<OsStr>>(argv: &[S]) -> SpawnOpts {
        SpawnOpts {
            argv: argv.iter().map(|s| s.as_ref().to_owned()).collect(),
            ..Default::default()
        }
    }

    pub fn shell(command: &str) -> SpawnOpts {
        SpawnOpts {
            argv: vec![OsString::from(command)],
            shell: true,
            ..Default::default()
        }
    }
}

pub(crate) struct SubprocessInner {
    node: Arc<NodeInner>,
    pid: i32,
    /// Raw wait status, once collected.
    status: Mutex<Option<i32>>,
    reaped: AtomicBool,
}

/// A child process inside a node.
#[derive(Clone)]
pub struct Subprocess {
    inner: Arc<SubprocessInner>,
}

impl Subprocess {
    /// The pid of the child, as seen by the kernel.
    pub fn pid(&self) -> i32 {
        self.inner.pid
    }

    /// Exit state without blocking; `None` while the child runs.
    pub fn poll(&self) -> Result<Option<ExitStatus>> {
        self.inner.poll()
    }

    /// Block until the child exits.
    pub fn wait(&self) -> Result<ExitStatus> {
        self.inner.wait()
    }

    /// Send a signal (TERM when none given). Ignored once the child has
    /// been reaped.
    pub fn signal(&self, signal: Option<i32>) -> Result<()> {
        if lock(&self.inner.status).is_some() {
            return Ok(());
        }
        self.inner.node.rpc(|c| c.signal(self.inner.pid, signal))
    }

    /// Last collected exit state, if any.
    pub fn returncode(&self) -> Option<ExitStatus> {
        lock(&self.inner.status).map(decode_status)
    }

    /// TERM, a grace period, then KILL. Also what dropping the last
    /// handle does.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl SubprocessInner {
    fn poll(&self) -> Result<Option<ExitStatus>> {
        if let Some(status) = *lock(&self.status) {
            return Ok(Some(decode_status(status)));
        }
        match self.node.rpc(|c| c.poll(self.pid))? {
            Some(status) => {
                *lock(&self.status) = Some(status);
                self.reaped.store(true, Ordering::SeqCst);
                Ok(Some(decode_status(status)))
            }
            None => Ok(None),
        }
    }

    fn wait(&self) -> Result<ExitStatus> {
        if let Some(status) = *lock(&self.status) {
            return Ok(decode_status(status));
        }
        let status = self.node.rpc(|c| c.wait(self.pid))?;
        *lock(&self.status) = Some(status);
        self.reaped.store(true, Ordering::SeqCst);
        Ok(decode_status(status))
    }

    pub(crate) fn destroy(&self) {
        if self.reaped.load(Ordering::SeqCst) || lock(&self.status).is_some() {
            return;
        }
        let term = self.node.rpc(|c| c.signal(self.pid, None));
        if term.is_err() {
            return;
        }
        let deadline = Instant::now() + KILL_WAIT;
        while Instant::now() < deadline {
            match self.poll() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
            }
        }
        warn!(pid = self.pid, "killing forcefully");
        let _ = self.node.rpc(|c| c.signal(self.pid, Some(libc::SIGKILL)));
        let _ = self.wait();
    }
}

impl Drop for SubprocessInner {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Pipe plumbing prepared for one spawn.
#[derive(Default)]
struct Plumbing {
    child_stdin: Option<OwnedFd>,
    child_stdout: Option<OwnedFd>,
    child_stderr: Option<OwnedFd>,
    master_stdin: Option<File>,
    master_stdout: Option<File>,
    master_stderr: Option<File>,
}

fn prepare(opts: &mut SpawnOpts) -> Result<Plumbing> {
    let mut plumbing = Plumbing::default();

    match std::mem::take(&mut opts.stdin) {
        Stdio::Inherit => {}
        Stdio::Fd(fd) => plumbing.child_stdin = Some(fd),
        Stdio::Pipe => {
            let (read_end, write_end) = ns0_spawn::stdio_pipe()?;
            plumbing.child_stdin = Some(read_end);
            plumbing.master_stdin = Some(File::from(write_end));
        }
        Stdio::ToStdout => {
            return Err(Error::Config(String::from("stdin cannot go to stdout")));
        }
    }
    match std::mem::take(&mut opts.stdout) {
        Stdio::Inherit => {}
        Stdio::Fd(fd) => plumbing.child_stdout = Some(fd),
        Stdio::Pipe => {
            let (read_end, write_end) = ns0_spawn::stdio_pipe()?;
            plumbing.child_stdout = Some(write_end);
            plumbing.master_stdout = Some(File::from(read_end));
        }
        Stdio::ToStdout => {
            return Err(Error::Config(String::from("stdout cannot go to stdout")));
        }
    }
    match std::mem::take(&mut opts.stderr) {
        Stdio::Inherit => {}
        Stdio::Fd(fd) => plumbing.child_stderr = Some(fd),
        Stdio::Pipe => {
            let (read_end, write_end) = ns0_spawn::stdio_pipe()?;
            plumbing.child_stderr = Some(write_end);
            plumbing.master_stderr = Some(File::from(read_end));
        }
        // resolved in spawn_into, once stdout's child end is known
        Stdio::ToStdout => {}
    }
    Ok(plumbing)
}

fn spawn_into(node: &Arc<NodeInner>, mut opts: SpawnOpts) -> Result<(Arc<SubprocessInner>, Plumbing)> {
    let stderr_to_stdout = matches!(opts.stderr, Stdio::ToStdout);
    let plumbing = prepare(&mut opts)?;

    let mut argv = opts.argv;
    if argv.is_empty() {
        return Err(Error::Config(String::from("empty argv")));
    }
    if opts.shell {
        let mut wrapped = vec![OsString::from("/bin/sh"), OsString::from("-c")];
        wrapped.extend(argv);
        argv = wrapped;
    }

    let user = match opts.user {
        UserSpec::Default => Some(config::run_as()),
        UserSpec::Current => None,
        UserSpec::Named(name) => Some(name),
    };

    let stderr_fd = if stderr_to_stdout {
        plumbing.child_stdout.as_ref().map(|fd| fd.as_fd())
    } else {
        plumbing.child_stderr.as_ref().map(|fd| fd.as_fd())
    };
    let req = RemoteSpawn {
        executable: opts.executable,
        argv,
        cwd: opts.cwd,
        env: opts.env,
        user,
        stdin: plumbing.child_stdin.as_ref().map(|fd| fd.as_fd()),
        stdout: plumbing.child_stdout.as_ref().map(|fd| fd.as_fd()),
        stderr: stderr_fd,
    };
    let pid = node.rpc(|c| c.spawn(&req))?;

    let inner = Arc::new(SubprocessInner {
        node: node.clone(),
        pid,
        status: Mutex::new(None),
        reaped: AtomicBool::new(false),
    });
    node.register_process(&inner);
    Ok((inner, plumbing))
}

/// A child with optional pipe streams attached.
pub struct Popen {
    process: Subprocess,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

impl Popen {
    pub fn process(&self) -> &Subprocess {
        &self.process
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    pub fn wait(&self) -> Result<ExitStatus> {
        self.process.wait()
    }

    pub fn poll(&self) -> Result<Option<ExitStatus>> {
        self.process.poll()
    }

    pub fn returncode(&self) -> Option<ExitStatus> {
        self.process.returncode()
    }

    /// Feed `input` to stdin (when piped) while draining stdout/stderr,
    /// until all three are closed; then reap the child.
    ///
    /// Returns the captured streams, `None` for ones that were not
    /// piped.
    pub fn communicate(
        &mut self,
        input: Option<&[u8]>,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let mut stdin = self.stdin.take();
        if input.is_none() {
            stdin = None;
        }
        let input = input.unwrap_or_default();
        let mut offset = 0usize;

        let mut out = self.stdout.as_ref().map(|_| Vec::new());
        let mut err = self.stderr.as_ref().map(|_| Vec::new());

        while stdin.is_some() || self.stdout.is_some() || self.stderr.is_some() {
            // The descriptor set is rebuilt every round; the readiness
            // flags are extracted before any stream is touched again.
            let (stdin_ready, stdout_ready, stderr_ready) = {
                let mut fds = Vec::new();
                let stdin_at = stdin.as_ref().map(|f| {
                    fds.push(PollFd::new(f.as_fd(), PollFlags::POLLOUT));
                    fds.len() - 1
                });
                let stdout_at = self.stdout.as_ref().map(|f| {
                    fds.push(PollFd::new(f.as_fd(), PollFlags::POLLIN));
                    fds.len() - 1
                });
                let stderr_at = self.stderr.as_ref().map(|f| {
                    fds.push(PollFd::new(f.as_fd(), PollFlags::POLLIN));
                    fds.len() - 1
                });

                loop {
                    match nix::poll::poll(&mut fds, PollTimeout::NONE) {
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => return Err(Error::Os(e)),
                        Ok(_) => break,
                    }
                }

                let ready = |at: Option<usize>| {
                    at.and_then(|i| fds.get(i))
                        .and_then(PollFd::revents)
                        .map(|r| !r.is_empty())
                        .unwrap_or(false)
                };
                (ready(stdin_at), ready(stdout_at), ready(stderr_at))
            };

            if stdin_ready {
                if let Some(f) = stdin.as_mut() {
                    let chunk = input.get(offset..).unwrap_or_default();
                    let chunk = chunk.get(..chunk.len().min(512)).unwrap_or_default();
                    match f.write(chunk) {
                        Ok(n) => offset += n,
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                            stdin = None;
                        }
                        Err(e) => return Err(Error::Io(e)),
                    }
                    if offset >= input.len() {
                        stdin = None;
                    }
                }
            }
            if stdout_ready {
                drain(&mut self.stdout, out.as_mut())?;
            }
            if stderr_ready {
                drain(&mut self.stderr, err.as_mut())?;
            }
        }

        self.wait()?;
        Ok((out, err))
    }
}

fn drain(slot: &mut Option<File>, sink: Option<&mut Vec<u8>>) -> Result<()> {
    let Some(file) = slot.as_mut() else {
        return Ok(());
    };
    let mut buf = [0u8; 1024];
    match file.read(&mut buf) {
        Ok(0) => {
            *slot = None;
        }
        Ok(n) => {
            if let Some(sink) = sink {
                sink.extend_from_slice(buf.get(..n).unwrap_or_default());
            }
        }
        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
        Err(e) => return Err(Error::Io(e)),
    }
    Ok(())
}

impl Node {
    /// Start a child inside the node. Pipe redirections are only
    /// available through [`Node::popen`].
    pub fn subprocess(&self, opts: SpawnOpts) -> Result<Subprocess> {
        if matches!(opts.stdin, Stdio::Pipe)
            || matches!(opts.stdout, Stdio::Pipe)
            || matches!(opts.stderr, Stdio::Pipe)
        {
            return Err(Error::Config(String::from(
                "pipe redirection needs popen",
            )));
        }
        let (inner, _plumbing) = spawn_into(&self.inner, opts)?;
        Ok(Subprocess { inner })
    }

    /// Start a child with pipe plumbing.
    pub fn popen(&self, opts: SpawnOpts) -> Result<Popen> {
        let (inner, plumbing) = spawn_into(&self.inner, opts)?;
        Ok(Popen {
            process: Subprocess { inner },
            stdin: plumbing.master_stdin,
            stdout: plumbing.master_stdout,
            stderr: plumbing.master_stderr,
        })
        // child-end descriptors in `plumbing` drop here, after the spawn
    }

    /// Run to completion with inherited stdio; the exit state.
    pub fn system<S: AsRef<OsStr>>(&self, argv: &[S]) -> Result<ExitStatus> {
        self.subprocess(SpawnOpts::command(argv))?.wait()
    }

    /// Run and capture stdout.
    pub fn backticks<S: AsRef<OsStr>>(&self, argv: &[S]) -> Result<Vec<u8>> {
        let mut opts = SpawnOpts::command(argv);
        opts.stdout = Stdio::Pipe;
        let mut popen = self.popen(opts)?;
        let (out, _) = popen.communicate(None)?;
        Ok(out.unwrap_or_default())
    }

    /// Run and capture stdout, failing on a non-zero exit.
    pub fn backticks_raise<S: AsRef<OsStr>>(&self, argv: &[S]) -> Result<Vec<u8>> {
        let mut opts = SpawnOpts::command(argv);
        opts.stdout = Stdio::Pipe;
        let mut popen = self.popen(opts)?;
        let (out, _) = popen.communicate(None)?;
        match popen.returncode() {
            Some(ExitStatus::Exited(0)) => Ok(out.unwrap_or_default()),
            Some(ExitStatus::Exited(code)) => Err(Error::Config(format!(
                "command failed with return code {code}"
            ))),
            Some(ExitStatus::Signaled(sig)) => Err(Error::Config(format!(
                "command killed by signal {sig}"
            ))),
            None => Err(Error::Config(String::from("command not reaped"))),
        }
    }
}
