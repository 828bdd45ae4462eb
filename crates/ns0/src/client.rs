//! Master-side RPC driver.
//!
//! One [`Client`] owns one socketpair end and speaks the line protocol to
//! the slave living inside a namespace: write a command line, read status
//! lines until the final one, decode the payload. Calls block until the
//! reply arrives; a node is driven by exactly one client.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use ns0_iproute::{Address, LinkAttrs, Route};
use ns0_proto::{self as proto, Reply, RemoteError, escape_arg, parse_reply_line};

use crate::fdpass::send_fd;
use crate::{Error, Result};

/// Remote spawn request; descriptors are borrowed for the duration of the
/// call and dup'ed on the slave side.
#[derive(Debug, Default)]
pub struct RemoteSpawn<'fd> {
    pub executable: Option<OsString>,
    pub argv: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Option<Vec<(OsString, OsString)>>,
    pub user: Option<String>,
    pub stdin: Option<BorrowedFd<'fd>>,
    pub stdout: Option<BorrowedFd<'fd>>,
    pub stderr: Option<BorrowedFd<'fd>>,
}

pub struct Client {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Client {
    /// Wrap a connected socketpair end and consume the 220 greeting.
    pub fn new(stream: UnixStream) -> Result<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        let mut client = Client { stream, reader };
        let greeting = client.read_reply()?;
        if greeting.code != proto::GREETING {
            return Err(Error::Protocol(format!(
                "unexpected greeting: {} {}",
                greeting.code,
                greeting.text()
            )));
        }
        Ok(client)
    }

    fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let mut raw = String::new();
            let n = self.reader.read_line(&mut raw)?;
            if n == 0 {
                return Err(Error::Dead);
            }
            let parsed = parse_reply_line(raw.trim_end_matches(['\r', '\n']))?;
            let is_final = parsed.is_final;
            let code = parsed.code;
            lines.push(parsed.text);
            if is_final {
                return Ok(Reply { code, lines });
            }
        }
    }

    /// Send one command line and return its reply; 5xx replies become
    /// errors (550 carrying the decoded remote failure).
    fn send_cmd(&mut self, tokens: &[String]) -> Result<Reply> {
        let line = tokens.join(" ");
        debug!(command = %line, "rpc");
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        let reply = self.read_reply()?;
        match reply.code {
            proto::REMOTE_ERROR => {
                let remote = RemoteError::from_reply_body(&reply.lines)?;
                Err(Error::Remote(remote))
            }
            500..=599 => Err(Error::Protocol(reply.text())),
            _ => Ok(reply),
        }
    }

    fn expect(&mut self, tokens: &[String], code: u16) -> Result<Reply> {
        let reply = self.send_cmd(tokens)?;
        if reply.code != code {
            return Err(Error::Protocol(format!(
                "expected {code}, got {} {}",
                reply.code,
                reply.text()
            )));
        }
        Ok(reply)
    }

    fn payload<T: serde::de::DeserializeOwned>(reply: &Reply) -> Result<T> {
        let text = reply
            .lines
            .last()
            .map(String::as_str)
            .unwrap_or_default()
            .trim();
        let raw = STANDARD
            .decode(text)
            .map_err(|e| Error::Protocol(format!("bad payload: {e}")))?;
        serde_json::from_slice(&raw).map_err(|e| Error::Protocol(format!("bad payload: {e}")))
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    pub fn get_if_data(&mut self) -> Result<Vec<LinkAttrs>> {
        let reply = self.expect(&tokens(&["IF", "LIST"]), proto::OK)?;
        Self::payload(&reply)
    }

    pub fn get_if(&mut self, ifnr: u32) -> Result<LinkAttrs> {
        let mut t = tokens(&["IF", "LIST"]);
        t.push(ifnr.to_string());
        let reply = self.expect(&t, proto::OK)?;
        Self::payload(&reply)
    }

    /// Apply an attribute patch; only the set fields travel.
    pub fn set_if(&mut self, patch: &LinkAttrs) -> Result<()> {
        let index = patch
            .index
            .ok_or_else(|| Error::Config(String::from("patch without ifindex")))?;
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(name) = &patch.name {
            pairs.push(("name", name.clone()));
        }
        if let Some(up) = patch.up {
            pairs.push(("up", String::from(if up { "1" } else { "0" })));
        }
        if let Some(mtu) = patch.mtu {
            pairs.push(("mtu", mtu.to_string()));
        }
        if let Some(lladdr) = &patch.lladdr {
            pairs.push(("lladdr", lladdr.clone()));
        }
        if let Some(broadcast) = &patch.broadcast {
            pairs.push(("broadcast", broadcast.clone()));
        }
        if let Some(multicast) = patch.multicast {
            pairs.push(("multicast", String::from(if multicast { "1" } else { "0" })));
        }
        if let Some(arp) = patch.arp {
            pairs.push(("arp", String::from(if arp { "1" } else { "0" })));
        }
        if pairs.is_empty() {
            return Ok(());
        }
        let mut t = tokens(&["IF", "SET"]);
        t.push(index.to_string());
        for (attr, value) in pairs {
            t.push(attr.to_owned());
            t.push(escape_arg(value.as_bytes()));
        }
        self.expect(&t, proto::OK).map(|_| ())
    }

    pub fn del_if(&mut self, ifnr: u32) -> Result<()> {
        let mut t = tokens(&["IF", "DEL"]);
        t.push(ifnr.to_string());
        self.expect(&t, proto::OK).map(|_| ())
    }

    /// Migrate an interface back out, into the namespace of `pid`.
    pub fn return_if(&mut self, ifnr: u32, pid: i32) -> Result<()> {
        let mut t = tokens(&["IF", "RTRN"]);
        t.push(ifnr.to_string());
        t.push(pid.to_string());
        self.expect(&t, proto::OK).map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Addresses
    // -----------------------------------------------------------------------

    pub fn get_addr_data(&mut self) -> Result<BTreeMap<u32, Vec<Address>>> {
        let reply = self.expect(&tokens(&["ADDR", "LIST"]), proto::OK)?;
        Self::payload(&reply)
    }

    pub fn get_addrs(&mut self, ifnr: u32) -> Result<Vec<Address>> {
        let mut t = tokens(&["ADDR", "LIST"]);
        t.push(ifnr.to_string());
        let reply = self.expect(&t, proto::OK)?;
        Self::payload(&reply)
    }

    pub fn add_addr(&mut self, ifnr: u32, address: &Address) -> Result<()> {
        let mut t = tokens(&["ADDR", "ADD"]);
        t.push(ifnr.to_string());
        t.push(escape_arg(address.ip().to_string().as_bytes()));
        t.push(address.prefix_len().to_string());
        if let Address::Inet {
            broadcast: Some(brd),
            ..
        } = address
        {
            t.push(escape_arg(brd.to_string().as_bytes()));
        }
        self.expect(&t, proto::OK).map(|_| ())
    }

    pub fn del_addr(&mut self, ifnr: u32, address: &Address) -> Result<()> {
        let mut t = tokens(&["ADDR", "DEL"]);
        t.push(ifnr.to_string());
        t.push(escape_arg(address.ip().to_string().as_bytes()));
        t.push(address.prefix_len().to_string());
        self.expect(&t, proto::OK).map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Routes
    // -----------------------------------------------------------------------

    pub fn get_route_data(&mut self) -> Result<Vec<Route>> {
        let reply = self.expect(&tokens(&["ROUT", "LIST"]), proto::OK)?;
        Self::payload(&reply)
    }

    fn route_tokens(verb: &str, route: &Route) -> Vec<String> {
        let mut t = tokens(&["ROUT", verb]);
        t.push(route.kind.as_str().to_owned());
        t.push(escape_arg(
            route
                .prefix
                .map(|p| p.to_string())
                .unwrap_or_default()
                .as_bytes(),
        ));
        t.push(route.prefix_len.to_string());
        t.push(escape_arg(
            route
                .nexthop
                .map(|n| n.to_string())
                .unwrap_or_default()
                .as_bytes(),
        ));
        t.push(route.interface.unwrap_or(0).to_string());
        t.push(route.metric.to_string());
        t
    }

    pub fn add_route(&mut self, route: &Route) -> Result<()> {
        self.expect(&Self::route_tokens("ADD", route), proto::OK)
            .map(|_| ())
    }

    pub fn del_route(&mut self, route: &Route) -> Result<()> {
        self.expect(&Self::route_tokens("DEL", route), proto::OK)
            .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Processes
    // -----------------------------------------------------------------------

    /// Drive the proc-build sequence: CRTE, modifiers, descriptor
    /// transfers, RUN. Returns the remote pid.
    pub fn spawn(&mut self, req: &RemoteSpawn<'_>) -> Result<i32> {
        let executable = match (&req.executable, req.argv.first()) {
            (Some(exe), _) => exe.clone(),
            (None, Some(argv0)) => argv0.clone(),
            (None, None) => return Err(Error::Config(String::from("empty argv"))),
        };
        let mut t = tokens(&["PROC", "CRTE"]);
        t.push(escape_arg(executable.as_bytes()));
        for arg in &req.argv {
            t.push(escape_arg(arg.as_bytes()));
        }
        self.expect(&t, proto::OK)?;

        match self.spawn_build(req) {
            Ok(pid) => Ok(pid),
            Err(e) => {
                // Leave proc-build mode so the session stays usable.
                let _ = self.send_cmd(&tokens(&["PROC", "ABRT"]));
                Err(e)
            }
        }
    }

    fn spawn_build(&mut self, req: &RemoteSpawn<'_>) -> Result<i32> {
        if let Some(user) = &req.user {
            let mut t = tokens(&["PROC", "USER"]);
            t.push(escape_arg(user.as_bytes()));
            self.expect(&t, proto::OK)?;
        }
        if let Some(cwd) = &req.cwd {
            let mut t = tokens(&["PROC", "CWD"]);
            t.push(escape_arg(cwd.as_os_str().as_bytes()));
            self.expect(&t, proto::OK)?;
        }
        if let Some(env) = &req.env {
            let mut t = tokens(&["PROC", "ENV"]);
            for (k, v) in env {
                t.push(escape_arg(k.as_bytes()));
                t.push(escape_arg(v.as_bytes()));
            }
            if env.is_empty() {
                t.push(escape_arg(b""));
                t.push(escape_arg(b""));
            }
            self.expect(&t, proto::OK)?;
        }

        for (fd, sub) in [
            (req.stdin, "SIN"),
            (req.stdout, "SOUT"),
            (req.stderr, "SERR"),
        ] {
            let Some(fd) = fd else { continue };
            self.expect(&tokens(&["PROC", sub]), proto::SEND_FD)?;
            let payload = format!("PROC {sub}");
            if let Err(send_err) = send_fd(&self.stream, fd, payload.as_bytes()) {
                // The server's recvmsg must still consume a payload-sized
                // chunk; feed it a placeholder, then collect its error.
                let _ = self.stream.write_all(payload.as_bytes());
                let _ = self.read_reply();
                return Err(send_err);
            }
            self.expect_after_fd()?;
        }

        let reply = self.expect(&tokens(&["PROC", "RUN"]), proto::OK)?;
        reply
            .text()
            .trim()
            .parse()
            .map_err(|_| Error::Protocol(format!("bad pid in reply: {}", reply.text())))
    }

    fn expect_after_fd(&mut self) -> Result<()> {
        let reply = self.read_reply()?;
        match reply.code {
            proto::OK => Ok(()),
            proto::REMOTE_ERROR => Err(Error::Remote(RemoteError::from_reply_body(&reply.lines)?)),
            _ => Err(Error::Protocol(reply.text())),
        }
    }

    /// Non-blocking status check; `None` while the child still runs.
    pub fn poll(&mut self, pid: i32) -> Result<Option<i32>> {
        let mut t = tokens(&["PROC", "POLL"]);
        t.push(pid.to_string());
        let reply = self.send_cmd(&t)?;
        match reply.code {
            proto::NOT_FINISHED => Ok(None),
            proto::OK => Ok(Some(parse_status(&reply)?)),
            _ => Err(Error::Protocol(reply.text())),
        }
    }

    /// Block until the child terminates; returns the raw wait status.
    pub fn wait(&mut self, pid: i32) -> Result<i32> {
        let mut t = tokens(&["PROC", "WAIT"]);
        t.push(pid.to_string());
        let reply = self.expect(&t, proto::OK)?;
        parse_status(&reply)
    }

    pub fn signal(&mut self, pid: i32, signal: Option<i32>) -> Result<()> {
        let mut t = tokens(&["PROC", "KILL"]);
        t.push(pid.to_string());
        if let Some(sig) = signal {
            t.push(sig.to_string());
        }
        self.expect(&t, proto::OK).map(|_| ())
    }

    // -----------------------------------------------------------------------
    // X11
    // -----------------------------------------------------------------------

    /// Publish the authority cookie; returns the display number the slave
    /// allocated inside the namespace.
    pub fn x11_set(&mut self, protoname: &str, hexkey: &str) -> Result<u16> {
        let mut t = tokens(&["X11", "SET"]);
        t.push(protoname.to_owned());
        t.push(escape_arg(hexkey.as_bytes()));
        let reply = self.expect(&t, proto::OK)?;
        reply
            .text()
            .trim()
            .parse()
            .map_err(|_| Error::Protocol(format!("bad display in reply: {}", reply.text())))
    }

    /// Receive the in-namespace listening socket.
    pub fn x11_socket(&mut self) -> Result<OwnedFd> {
        self.expect(&tokens(&["X11", "SOCK"]), proto::SEND_FD)?;
        let fd = crate::fdpass::recv_fd(&self.stream, b"X11 SOCK")?;
        self.expect_after_fd()?;
        Ok(fd)
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Orderly goodbye; the slave runs its cleanup and exits.
    pub fn shutdown(&mut self) -> Result<()> {
        let reply = self.send_cmd(&tokens(&["QUIT"]))?;
        if reply.code != proto::GOODBYE {
            return Err(Error::Protocol(reply.text()));
        }
        Ok(())
    }
}

fn tokens(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_owned()).collect()
}

fn parse_status(reply: &Reply) -> Result<i32> {
    reply
        .text()
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("bad status in reply: {}", reply.text())))
}
