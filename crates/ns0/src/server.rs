//! Slave-side RPC server.
//!
//! Runs inside the forked helper, after the namespace unshare. Reads one
//! command per line, executes it against the kernel-configuration and
//! process layers, and writes one reply. Handler failures never kill the
//! session: they are marshalled into 550 replies and the loop continues.
//!
//! The PROC family is a two-phase build: `PROC CRTE` opens a pending
//! process description, the modifier commands fill it in (descriptor
//! transfers included), and `PROC RUN`/`PROC ABRT` close it. While a
//! build is open only build commands are accepted; a stray base command
//! discards the pending process.

use std::collections::HashSet;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use ns0_iproute as iproute;
use ns0_proto::{
    self as proto, Arg, Mode, ParsedCommand, RemoteError, RemoteErrorKind, format_reply,
    help_text, parse_command,
};
use ns0_spawn::{self as spawn_engine, SpawnConfig};

use crate::x11;
use crate::{Error, Result};

/// One in-flight `PROC CRTE` … `PROC RUN` sequence.
#[derive(Debug, Default)]
struct PendingProc {
    executable: OsString,
    argv: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Option<Vec<(OsString, OsString)>>,
    user: Option<String>,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

/// X11 session state created by `X11 SET`.
struct X11Session {
    listener: Option<TcpListener>,
    display: u16,
    protoname: String,
    hexkey: String,
}

enum Action {
    Ok(String),
    NotFinished,
    Quit,
    /// The handler already wrote its replies.
    Done,
}

pub struct Server {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
    children: HashSet<i32>,
    building: Option<PendingProc>,
    x11: Option<X11Session>,
    xauth_files: Vec<PathBuf>,
}

impl Server {
    pub fn new(stream: UnixStream) -> Result<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Server {
            stream,
            reader,
            children: HashSet::new(),
            building: None,
            x11: None,
            xauth_files: Vec::new(),
        })
    }

    fn reply(&mut self, code: u16, text: &str) -> Result<()> {
        self.stream
            .write_all(format_reply(code, text).as_bytes())?;
        Ok(())
    }

    /// Serve until QUIT or EOF, then clean up. Never returns while the
    /// master lives.
    pub fn run(mut self) -> Result<()> {
        self.reply(
            proto::GREETING,
            &format!("ns0 slave (pid {}) ready", std::process::id()),
        )?;
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                debug!("master went away");
                break;
            }
            let line = line.trim_end_matches(['\r', '\n']).to_owned();
            if line.trim().is_empty() {
                self.reply(proto::PROTO_ERROR, "empty command")?;
                continue;
            }
            if !self.serve_line(&line)? {
                break;
            }
        }
        self.cleanup();
        Ok(())
    }

    /// Handle one line; `false` ends the session.
    fn serve_line(&mut self, line: &str) -> Result<bool> {
        let parsed = match parse_command(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                // A malformed non-build command aborts an open build.
                if self.building.is_some() && !is_build_command(line) {
                    self.building = None;
                }
                self.reply(proto::PROTO_ERROR, &e.to_string())?;
                return Ok(true);
            }
        };

        let allowed = match parsed.def.mode {
            Mode::Any => true,
            Mode::Build => self.building.is_some(),
            Mode::Base => self.building.is_none(),
        };
        if !allowed {
            if self.building.is_some() && parsed.def.mode != Mode::Build {
                self.building = None;
            }
            self.reply(
                proto::PROTO_ERROR,
                &format!("{} not valid now", parsed.def.full_name()),
            )?;
            return Ok(true);
        }

        match self.dispatch(&parsed) {
            Ok(Action::Ok(body)) => self.reply(proto::OK, &body)?,
            Ok(Action::NotFinished) => self.reply(proto::NOT_FINISHED, "not finished yet")?,
            Ok(Action::Done) => {}
            Ok(Action::Quit) => {
                self.reply(proto::GOODBYE, "bye")?;
                return Ok(false);
            }
            Err(e) => {
                // A handler failure closes any open build.
                self.building = None;
                let remote = to_remote(e).with_trace(format!("while serving: {line}"));
                self.reply(proto::REMOTE_ERROR, &remote.to_reply_body())?;
            }
        }
        Ok(true)
    }

    fn dispatch(&mut self, parsed: &ParsedCommand) -> Result<Action> {
        let args = &parsed.args;
        match (parsed.def.name, parsed.def.sub) {
            ("QUIT", None) => Ok(Action::Quit),
            ("HELP", None) => Ok(Action::Ok(help_text())),
            ("IF", Some("LIST")) => self.if_list(opt_int(args, 0)?),
            ("IF", Some("SET")) => self.if_set(args),
            ("IF", Some("RTRN")) => self.if_rtrn(int(args, 0)?, int(args, 1)?),
            ("IF", Some("DEL")) => self.if_del(int(args, 0)?),
            ("ADDR", Some("LIST")) => self.addr_list(opt_int(args, 0)?),
            ("ADDR", Some("ADD")) => self.addr_add(args),
            ("ADDR", Some("DEL")) => self.addr_del(args),
            ("ROUT", Some("LIST")) => self.rout_list(),
            ("ROUT", Some("ADD")) => self.rout_change(args, true),
            ("ROUT", Some("DEL")) => self.rout_change(args, false),
            ("PROC", Some("CRTE")) => self.proc_crte(args),
            ("PROC", Some("USER")) => self.proc_user(args),
            ("PROC", Some("CWD")) => self.proc_cwd(args),
            ("PROC", Some("ENV")) => self.proc_env(args),
            ("PROC", Some(sub @ ("SIN" | "SOUT" | "SERR"))) => self.proc_fd(sub),
            ("PROC", Some("RUN")) => self.proc_run(),
            ("PROC", Some("ABRT")) => {
                self.building = None;
                Ok(Action::Ok(String::from("aborted")))
            }
            ("PROC", Some("POLL")) => self.proc_poll(int(args, 0)?),
            ("PROC", Some("WAIT")) => self.proc_wait(int(args, 0)?),
            ("PROC", Some("KILL")) => self.proc_kill(int(args, 0)?, opt_int(args, 1)?),
            ("X11", Some("SET")) => self.x11_set(args),
            ("X11", Some("SOCK")) => self.x11_sock(),
            (name, sub) => Err(Error::Protocol(format!(
                "unhandled command {name} {sub:?}"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // IF
    // -----------------------------------------------------------------------

    fn if_list(&mut self, ifnr: Option<i64>) -> Result<Action> {
        match ifnr {
            Some(nr) => {
                let attrs = iproute::get_if_by_index(index_of(nr)?)?;
                Ok(Action::Ok(encode_payload(&attrs)?))
            }
            None => {
                let (byidx, _) = iproute::get_if_data()?;
                let all: Vec<_> = byidx.into_values().collect();
                Ok(Action::Ok(encode_payload(&all)?))
            }
        }
    }

    fn if_set(&mut self, args: &[Arg]) -> Result<Action> {
        let index = index_of(int(args, 0)?)?;
        let pairs = args.get(1..).unwrap_or_default();
        if pairs.len() % 2 != 0 {
            return Err(Error::Protocol(String::from(
                "attribute list must come in pairs",
            )));
        }
        let mut patch = iproute::LinkAttrs {
            index: Some(index),
            ..Default::default()
        };
        let mut it = pairs.iter();
        while let (Some(attr), Some(value)) = (it.next(), it.next()) {
            let attr = string_arg(attr)?;
            let value = string_arg(value)?;
            apply_attr(&mut patch, &attr, &value)?;
        }
        iproute::set_if(&patch)?;
        Ok(Action::Ok(String::from("done")))
    }

    fn if_rtrn(&mut self, ifnr: i64, pid: i64) -> Result<Action> {
        let attrs = iproute::get_if_by_index(index_of(ifnr)?)?;
        iproute::change_netns(&attrs, pid as i32)?;
        Ok(Action::Ok(String::from("done")))
    }

    fn if_del(&mut self, ifnr: i64) -> Result<Action> {
        let attrs = iproute::get_if_by_index(index_of(ifnr)?)?;
        iproute::del_if(&attrs)?;
        Ok(Action::Ok(String::from("done")))
    }

    // -----------------------------------------------------------------------
    // ADDR
    // -----------------------------------------------------------------------

    fn addr_list(&mut self, ifnr: Option<i64>) -> Result<Action> {
        let (byidx, _) = iproute::get_addr_data()?;
        match ifnr {
            Some(nr) => {
                let index = index_of(nr)?;
                // distinguish "no addresses" from "no interface"
                iproute::get_if_by_index(index)?;
                let addrs = byidx.get(&index).cloned().unwrap_or_default();
                Ok(Action::Ok(encode_payload(&addrs)?))
            }
            None => Ok(Action::Ok(encode_payload(&byidx)?)),
        }
    }

    fn addr_parse(args: &[Arg]) -> Result<(i64, String, u8, Option<String>)> {
        let ifnr = int(args, 0)?;
        let address = string_arg(arg(args, 1)?)?;
        let prefix_len = int(args, 2)?;
        if !(0..=128).contains(&prefix_len) {
            return Err(Error::Config(format!("invalid prefix_len: {prefix_len}")));
        }
        let broadcast = match args.get(3) {
            Some(a) => Some(string_arg(a)?),
            None => None,
        };
        Ok((ifnr, address, prefix_len as u8, broadcast))
    }

    fn addr_add(&mut self, args: &[Arg]) -> Result<Action> {
        let (ifnr, address, prefix_len, broadcast) = Self::addr_parse(args)?;
        let name = name_of(ifnr)?;
        let addr = iproute::Address::parse(&address, prefix_len, broadcast.as_deref())?;
        iproute::add_addr(&name, &addr)?;
        Ok(Action::Ok(String::from("done")))
    }

    fn addr_del(&mut self, args: &[Arg]) -> Result<Action> {
        let (ifnr, address, prefix_len, _) = Self::addr_parse(args)?;
        let name = name_of(ifnr)?;
        let addr = iproute::Address::parse(&address, prefix_len, None)?;
        iproute::del_addr(&name, &addr)?;
        Ok(Action::Ok(String::from("done")))
    }

    // -----------------------------------------------------------------------
    // ROUT
    // -----------------------------------------------------------------------

    fn rout_list(&mut self) -> Result<Action> {
        let routes = iproute::get_route_data()?;
        Ok(Action::Ok(encode_payload(&routes)?))
    }

    fn rout_change(&mut self, args: &[Arg], add: bool) -> Result<Action> {
        let kind: iproute::RouteKind = string_arg(arg(args, 0)?)?
            .parse()
            .map_err(Error::Kernel)?;
        let prefix = opt_ip(&string_arg(arg(args, 1)?)?)?;
        let prefix_len = int(args, 2)?;
        let nexthop = opt_ip(&string_arg(arg(args, 3)?)?)?;
        let ifnr = int(args, 4)?;
        let interface = if ifnr == 0 { None } else { Some(index_of(ifnr)?) };
        let metric = int(args, 5)?;
        if !(0..=128).contains(&prefix_len) {
            return Err(Error::Config(format!("invalid prefix_len: {prefix_len}")));
        }
        let route = iproute::Route::new(
            kind,
            prefix,
            prefix_len as u8,
            nexthop,
            interface,
            metric.max(0) as u32,
        )?;
        if add {
            iproute::add_route(&route)?;
        } else {
            iproute::del_route(&route)?;
        }
        Ok(Action::Ok(String::from("done")))
    }

    // -----------------------------------------------------------------------
    // PROC
    // -----------------------------------------------------------------------

    fn proc_crte(&mut self, args: &[Arg]) -> Result<Action> {
        let executable = os_arg(arg(args, 0)?)?;
        let mut argv: Vec<OsString> = args
            .get(1..)
            .unwrap_or_default()
            .iter()
            .map(os_arg)
            .collect::<Result<_>>()?;
        if argv.is_empty() {
            argv.push(executable.clone());
        }
        self.building = Some(PendingProc {
            executable,
            argv,
            ..Default::default()
        });
        Ok(Action::Ok(String::from("building")))
    }

    fn pending(&mut self) -> Result<&mut PendingProc> {
        self.building
            .as_mut()
            .ok_or_else(|| Error::Protocol(String::from("no process being built")))
    }

    fn proc_user(&mut self, args: &[Arg]) -> Result<Action> {
        let user = string_arg(arg(args, 0)?)?;
        spawn_engine::lookup_user(&user)?;
        self.pending()?.user = Some(user);
        Ok(Action::Ok(String::from("done")))
    }

    fn proc_cwd(&mut self, args: &[Arg]) -> Result<Action> {
        let cwd = os_arg(arg(args, 0)?)?;
        self.pending()?.cwd = Some(PathBuf::from(cwd));
        Ok(Action::Ok(String::from("done")))
    }

    fn proc_env(&mut self, args: &[Arg]) -> Result<Action> {
        if args.len() % 2 != 0 {
            return Err(Error::Protocol(String::from(
                "environment must come in pairs",
            )));
        }
        let mut env = Vec::new();
        let mut it = args.iter();
        while let (Some(k), Some(v)) = (it.next(), it.next()) {
            let k = os_arg(k)?;
            if k.is_empty() {
                continue;
            }
            env.push((k, os_arg(v)?));
        }
        self.pending()?.env = Some(env);
        Ok(Action::Ok(String::from("done")))
    }

    /// One descriptor transfer: 354, recvmsg, 200. A failed transfer
    /// aborts the whole build so the session drops back to base mode.
    fn proc_fd(&mut self, sub: &str) -> Result<Action> {
        self.pending()?;
        let payload = format!("PROC {sub}");
        self.reply(proto::SEND_FD, &format!("send fd with payload {payload:?}"))?;
        match crate::fdpass::recv_fd(&self.stream, payload.as_bytes()) {
            Ok(fd) => {
                let pending = self.pending()?;
                match sub {
                    "SIN" => pending.stdin = Some(fd),
                    "SOUT" => pending.stdout = Some(fd),
                    _ => pending.stderr = Some(fd),
                }
                self.reply(proto::OK, "got it")?;
            }
            Err(e) => {
                self.building = None;
                self.reply(proto::PROTO_ERROR, &format!("descriptor transfer failed: {e}"))?;
            }
        }
        Ok(Action::Done)
    }

    fn proc_run(&mut self) -> Result<Action> {
        let pending = self
            .building
            .take()
            .ok_or_else(|| Error::Protocol(String::from("no process being built")))?;

        let mut env = pending.env;
        if let Some(x11) = &self.x11 {
            let owner = match &pending.user {
                Some(user) => {
                    let account = spawn_engine::lookup_user(user)?;
                    Some((account.uid.as_raw(), account.gid.as_raw()))
                }
                None => None,
            };
            let xauth =
                x11::write_xauth_file(x11.display, &x11.protoname, &x11.hexkey, owner)?;
            let mut vars = env.unwrap_or_else(|| std::env::vars_os().collect());
            vars.retain(|(k, _)| k != "DISPLAY" && k != "XAUTHORITY");
            vars.push((
                OsString::from("DISPLAY"),
                OsString::from(format!("127.0.0.1:{}", x11.display)),
            ));
            vars.push((OsString::from("XAUTHORITY"), xauth.clone().into_os_string()));
            env = Some(vars);
            self.xauth_files.push(xauth);
        }

        let cfg = SpawnConfig {
            executable: Some(pending.executable),
            argv: pending.argv,
            cwd: pending.cwd,
            env,
            user: pending.user,
            stdin: pending.stdin.as_ref().map(|fd| fd.as_raw_fd()),
            stdout: pending.stdout.as_ref().map(|fd| fd.as_raw_fd()),
            stderr: pending.stderr.as_ref().map(|fd| fd.as_raw_fd()),
        };
        let pid = spawn_engine::spawn(&cfg)?;
        self.children.insert(pid);
        Ok(Action::Ok(pid.to_string()))
    }

    fn known_child(&self, pid: i64) -> Result<i32> {
        let pid = pid as i32;
        if self.children.contains(&pid) {
            Ok(pid)
        } else {
            Err(Error::Remote(RemoteError::new(
                RemoteErrorKind::Key,
                format!("no such process: {pid}"),
            )))
        }
    }

    fn proc_poll(&mut self, pid: i64) -> Result<Action> {
        let pid = self.known_child(pid)?;
        match spawn_engine::poll(pid)? {
            Some(status) => {
                self.children.remove(&pid);
                Ok(Action::Ok(status.to_string()))
            }
            None => Ok(Action::NotFinished),
        }
    }

    fn proc_wait(&mut self, pid: i64) -> Result<Action> {
        let pid = self.known_child(pid)?;
        let status = spawn_engine::wait(pid)?;
        self.children.remove(&pid);
        Ok(Action::Ok(status.to_string()))
    }

    fn proc_kill(&mut self, pid: i64, signal: Option<i64>) -> Result<Action> {
        let pid = self.known_child(pid)?;
        let signal = signal.unwrap_or(i64::from(libc::SIGTERM));
        spawn_engine::send_signal(pid, signal as i32)?;
        Ok(Action::Ok(String::from("done")))
    }

    // -----------------------------------------------------------------------
    // X11
    // -----------------------------------------------------------------------

    fn x11_set(&mut self, args: &[Arg]) -> Result<Action> {
        let protoname = string_arg(arg(args, 0)?)?;
        let hexkey = string_arg(arg(args, 1)?)?;
        let (listener, display) = x11::find_display_port()?;
        self.x11 = Some(X11Session {
            listener: Some(listener),
            display,
            protoname,
            hexkey,
        });
        Ok(Action::Ok(display.to_string()))
    }

    fn x11_sock(&mut self) -> Result<Action> {
        let listener = self
            .x11
            .as_mut()
            .and_then(|s| s.listener.take())
            .ok_or_else(|| Error::Protocol(String::from("no X11 socket pending")))?;
        self.reply(proto::SEND_FD, "sending fd with payload \"X11 SOCK\"")?;
        match crate::fdpass::send_fd(&self.stream, listener.as_fd(), b"X11 SOCK") {
            Ok(()) => {
                self.reply(proto::OK, "sent")?;
            }
            Err(e) => {
                self.reply(proto::PROTO_ERROR, &format!("descriptor transfer failed: {e}"))?;
            }
        }
        Ok(Action::Done)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Kill and reap every tracked child, remove authority files.
    fn cleanup(&mut self) {
        for pid in std::mem::take(&mut self.children) {
            if let Err(e) = spawn_engine::terminate(pid) {
                warn!(pid, error = %e, "cannot reap child");
            }
        }
        for path in std::mem::take(&mut self.xauth_files) {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "authority file already gone");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Whether a raw line names a proc-build command, for the mode rules
/// around unparsable input.
fn is_build_command(line: &str) -> bool {
    let mut tokens = line.split_ascii_whitespace();
    let (Some(name), Some(sub)) = (tokens.next(), tokens.next()) else {
        return false;
    };
    ns0_proto::lookup(&name.to_uppercase(), Some(sub))
        .is_some_and(|def| def.mode == Mode::Build)
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn arg<'a>(args: &'a [Arg], at: usize) -> Result<&'a Arg> {
    args.get(at)
        .ok_or_else(|| Error::Protocol(format!("missing argument {at}")))
}

fn int(args: &[Arg], at: usize) -> Result<i64> {
    arg(args, at)?
        .as_int()
        .ok_or_else(|| Error::Protocol(format!("argument {at} is not an integer")))
}

fn opt_int(args: &[Arg], at: usize) -> Result<Option<i64>> {
    match args.get(at) {
        Some(a) => a
            .as_int()
            .map(Some)
            .ok_or_else(|| Error::Protocol(format!("argument {at} is not an integer"))),
        None => Ok(None),
    }
}

fn string_arg(a: &Arg) -> Result<String> {
    let bytes = a
        .as_bytes()
        .ok_or_else(|| Error::Protocol(String::from("expected a string argument")))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Config(String::from("argument is not valid UTF-8")))
}

fn os_arg(a: &Arg) -> Result<OsString> {
    let bytes = a
        .as_bytes()
        .ok_or_else(|| Error::Protocol(String::from("expected a byte argument")))?;
    Ok(OsString::from_vec(bytes.to_vec()))
}

fn index_of(nr: i64) -> Result<u32> {
    u32::try_from(nr).map_err(|_| Error::Config(format!("invalid ifindex: {nr}")))
}

fn name_of(ifnr: i64) -> Result<String> {
    iproute::get_if_by_index(index_of(ifnr)?)?
        .name
        .ok_or_else(|| Error::Config(format!("interface #{ifnr} has no name")))
}

fn opt_ip(s: &str) -> Result<Option<std::net::IpAddr>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|_| Error::Config(format!("invalid address: {s}")))
}

fn apply_attr(patch: &mut iproute::LinkAttrs, attr: &str, value: &str) -> Result<()> {
    match attr {
        "name" => patch.name = Some(value.to_owned()),
        "up" => patch.up = Some(parse_bool(value)?),
        "mtu" => {
            let mtu: i64 = value
                .parse()
                .map_err(|_| Error::Config(format!("invalid mtu: {value}")))?;
            patch.mtu = Some(iproute::validate_mtu(mtu)?);
        }
        "lladdr" => patch.lladdr = Some(iproute::parse_lladdr(value)?),
        "broadcast" => patch.broadcast = Some(value.to_owned()),
        "multicast" => patch.multicast = Some(parse_bool(value)?),
        "arp" => patch.arp = Some(parse_bool(value)?),
        other => {
            return Err(Error::Config(format!("unknown attribute: {other}")));
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(Error::Config(format!("invalid boolean: {other}"))),
    }
}

fn encode_payload<T: serde::Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)
        .map_err(|e| Error::Protocol(format!("cannot serialise payload: {e}")))?;
    Ok(STANDARD.encode(json))
}

/// Map a handler failure onto the wire error union.
fn to_remote(err: Error) -> RemoteError {
    match err {
        Error::Remote(remote) => remote,
        Error::Config(msg) => RemoteError::new(RemoteErrorKind::Value, msg),
        Error::Protocol(msg) => RemoteError::new(RemoteErrorKind::Protocol, msg),
        Error::Dead => RemoteError::new(RemoteErrorKind::Runtime, "peer is gone"),
        Error::Kernel(k) => match k {
            iproute::Error::Command { .. } => {
                RemoteError::new(RemoteErrorKind::Command, k.to_string())
            }
            iproute::Error::Invalid { .. } => {
                RemoteError::new(RemoteErrorKind::Value, k.to_string())
            }
            iproute::Error::NoSuchInterface(_) => {
                RemoteError::new(RemoteErrorKind::Key, k.to_string())
            }
            iproute::Error::Io(ref io) => {
                let mut remote = RemoteError::new(RemoteErrorKind::Os, k.to_string());
                if let Some(errno) = io.raw_os_error() {
                    remote = remote.with_errno(errno);
                }
                remote
            }
            _ => RemoteError::new(RemoteErrorKind::Runtime, k.to_string()),
        },
        Error::Spawn(s) => match s {
            ns0_spawn::SpawnError::PreExec(remote) => remote,
            ns0_spawn::SpawnError::UnknownUser(_) => {
                RemoteError::new(RemoteErrorKind::Key, s.to_string())
            }
            ns0_spawn::SpawnError::Os(errno) => {
                RemoteError::new(RemoteErrorKind::Os, s.to_string()).with_errno(errno as i32)
            }
            ns0_spawn::SpawnError::Io(ref io) => {
                let mut remote = RemoteError::new(RemoteErrorKind::Os, s.to_string());
                if let Some(errno) = io.raw_os_error() {
                    remote = remote.with_errno(errno);
                }
                remote
            }
        },
        Error::Os(errno) => {
            RemoteError::new(RemoteErrorKind::Os, errno.to_string()).with_errno(errno as i32)
        }
        Error::Io(io) => {
            let mut remote = RemoteError::new(RemoteErrorKind::Os, io.to_string());
            if let Some(errno) = io.raw_os_error() {
                remote = remote.with_errno(errno);
            }
            remote
        }
    }
}
