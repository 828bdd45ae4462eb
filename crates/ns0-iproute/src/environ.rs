//! Environment probe and external command execution.
//!
//! Locates the external binaries the layer shells out to, verifies sysfs
//! is mounted, and captures the clock-tick constant used for tbf burst
//! sizing. Probing happens once, on first use; a missing mandatory tool
//! is fatal for every subsequent operation.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock};

use tracing::{trace, warn};

use crate::{Error, Result};

/// Fixed fallback directories searched after `$PATH`.
const SEARCH_DIRS: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/usr/local/bin",
    "/usr/local/sbin",
];

/// Locations of the external tools plus the kernel tick rate.
#[derive(Debug, Clone)]
pub struct Tools {
    pub ip: PathBuf,
    pub tc: PathBuf,
    pub brctl: PathBuf,
    pub sysctl: PathBuf,
    pub tcpdump: Option<PathBuf>,
    pub netperf: Option<PathBuf>,
    pub xauth: Option<PathBuf>,
    pub xdpyinfo: Option<PathBuf>,
    /// `sysconf(_SC_CLK_TCK)`; a lower bound for the kernel's internal HZ,
    /// good enough for burst sizing.
    pub hz: u64,
}

static EXTRA_PATHS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
static TOOLS: OnceLock<std::result::Result<Tools, String>> = OnceLock::new();

/// Register an extra directory to search for tools. Only effective before
/// the first call to [`tools`].
pub fn add_search_path(dir: impl Into<PathBuf>) {
    if let Ok(mut extra) = EXTRA_PATHS.lock() {
        extra.push(dir.into());
    }
}

/// Try hard to find the location of a needed program.
fn find_bin(name: &str) -> Option<PathBuf> {
    if let Ok(path) = which::which(name) {
        return Some(path);
    }
    let extra = EXTRA_PATHS
        .lock()
        .map(|v| v.clone())
        .unwrap_or_default();
    for dir in SEARCH_DIRS.iter().map(Path::new).chain(extra.iter().map(PathBuf::as_path)) {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn find_bin_or_die(name: &str) -> std::result::Result<PathBuf, String> {
    find_bin(name).ok_or_else(|| name.to_owned())
}

fn clock_tick() -> u64 {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK) {
        Ok(Some(hz)) if hz > 0 => hz as u64,
        _ => {
            warn!("cannot read _SC_CLK_TCK, assuming 100");
            100
        }
    }
}

fn probe() -> std::result::Result<Tools, String> {
    if !Path::new("/sys/class/net").exists() {
        return Err(String::from("/sys/class/net"));
    }
    Ok(Tools {
        ip: find_bin_or_die("ip")?,
        tc: find_bin_or_die("tc")?,
        brctl: find_bin_or_die("brctl")?,
        sysctl: find_bin_or_die("sysctl")?,
        tcpdump: find_bin("tcpdump"),
        netperf: find_bin("netperf"),
        xauth: find_bin("xauth"),
        xdpyinfo: find_bin("xdpyinfo"),
        hz: clock_tick(),
    })
}

/// The probed tool set, shared process-wide.
pub fn tools() -> Result<&'static Tools> {
    match TOOLS.get_or_init(probe) {
        Ok(t) => Ok(t),
        Err(missing) if missing == "/sys/class/net" => Err(Error::SysfsMissing),
        Err(missing) => Err(Error::MissingTool(missing.clone())),
    }
}

fn run(argv: &[String], capture_stdout: bool) -> Result<String> {
    let command_str = argv.join(" ");
    trace!(command = %command_str, "exec");
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Parse(String::from("empty command")))?;
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| Error::Command {
            command: command_str.clone(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::Command {
            command: command_str,
            detail: stderr,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command; silent on success, error carrying stderr on non-zero
/// exit.
pub fn execute<S: AsRef<str>>(argv: &[S]) -> Result<()> {
    let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_owned()).collect();
    run(&argv, false).map(|_| ())
}

/// Run a command and capture stdout; same failure policy as [`execute`].
pub fn backticks<S: AsRef<str>>(argv: &[S]) -> Result<String> {
    let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_owned()).collect();
    run(&argv, true)
}

/// Retry a raw syscall wrapper while it fails with EINTR.
pub fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(nix::errno::Errno::EINTR) => continue,
            other => return other,
        }
    }
}
