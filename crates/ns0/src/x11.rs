//! X11 forwarding.
//!
//! The slave binds a TCP listener on a spare display port inside its
//! namespace and hands the socket to the master over SCM_RIGHTS; a forked
//! helper in the master then splices every accepted connection to the
//! real X server. Children inside the node get `DISPLAY=127.0.0.1:n` and
//! an `XAUTHORITY` file pre-loaded with the host's cookie.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use nix::unistd::ForkResult;
use tracing::{debug, warn};

use ns0_iproute::environ::{backticks, tools};

use crate::{Error, Result};

/// Display ports the slave may claim, `:10` through `:99`.
const PORT_RANGE: std::ops::RangeInclusive<u16> = 6010..=6099;

/// A parsed `$DISPLAY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    /// Empty for the local unix-socket transport.
    pub host: String,
    pub display: u16,
    pub screen: u16,
}

/// Where the real X server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XTarget {
    Unix(PathBuf),
    Tcp(String, u16),
}

/// Parse a `$DISPLAY` value: `:0`, `:0.1`, `host:2.0`, `127.0.0.1:10`.
pub fn parse_display(var: &str) -> Result<DisplayInfo> {
    let bad = || Error::Config(format!("cannot parse DISPLAY: {var}"));
    let (host, rest) = var.rsplit_once(':').ok_or_else(bad)?;
    let (display, screen) = match rest.split_once('.') {
        Some((d, s)) => (d, s),
        None => (rest, "0"),
    };
    Ok(DisplayInfo {
        host: host.to_owned(),
        display: display.parse().map_err(|_| bad())?,
        screen: screen.parse().map_err(|_| bad())?,
    })
}

/// The socket the helper must splice accepted connections to.
pub fn x_target(info: &DisplayInfo) -> XTarget {
    if info.host.is_empty() || info.host == "unix" {
        XTarget::Unix(PathBuf::from(format!("/tmp/.X11-unix/X{}", info.display)))
    } else {
        XTarget::Tcp(info.host.clone(), 6000 + info.display)
    }
}

/// Extract `(protocol, hexkey)` for a display from `xauth list` output.
pub fn parse_xauth_list(output: &str) -> Result<(String, String)> {
    for line in output.lines().rev() {
        let mut fields = line.split_whitespace();
        let (Some(_entry), Some(proto), Some(key)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        return Ok((proto.to_owned(), key.to_owned()));
    }
    Err(Error::Config(String::from("no xauth cookie for display")))
}

/// Query the authority cookie for a display via `xauth list`.
pub fn xauth_cookie(display_var: &str) -> Result<(String, String)> {
    let tools = tools().map_err(Error::Kernel)?;
    let xauth = tools
        .xauth
        .as_ref()
        .ok_or_else(|| Error::Config(String::from("xauth not found")))?;
    let out = backticks(&[
        xauth.to_string_lossy().as_ref(),
        "list",
        display_var,
    ])
    .map_err(Error::Kernel)?;
    parse_xauth_list(&out)
}

// ---------------------------------------------------------------------------
// Slave side
// ---------------------------------------------------------------------------

/// Bind a spare display port on 127.0.0.1; returns the listener and the
/// display number it maps to.
pub fn find_display_port() -> Result<(TcpListener, u16)> {
    for port in PORT_RANGE {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => return Ok((listener, port - 6000)),
            Err(_) => continue,
        }
    }
    Err(Error::Config(String::from(
        "no spare X display port in 6010-6099",
    )))
}

/// Write an authority file holding the cookie for `127.0.0.1:display`,
/// owned by `owner` when given.
pub fn write_xauth_file(
    display: u16,
    protoname: &str,
    hexkey: &str,
    owner: Option<(u32, u32)>,
) -> Result<PathBuf> {
    let tools = tools().map_err(Error::Kernel)?;
    let xauth = tools
        .xauth
        .as_ref()
        .ok_or_else(|| Error::Config(String::from("xauth not found")))?;

    let file = tempfile::Builder::new()
        .prefix("ns0-xauth-")
        .tempfile()?;
    let path = file.into_temp_path().keep().map_err(io::Error::from)?;

    let display_name = format!("127.0.0.1:{display}");
    backticks(&[
        xauth.to_string_lossy().as_ref(),
        "-f",
        path.to_string_lossy().as_ref(),
        "add",
        display_name.as_str(),
        protoname,
        hexkey,
    ])
    .map_err(Error::Kernel)?;

    if let Some((uid, gid)) = owner {
        std::os::unix::fs::chown(&path, Some(uid), Some(gid))?;
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Master side: the splice helper
// ---------------------------------------------------------------------------

/// Fork a helper that accepts connections on `listener` and splices each
/// one to the real X server. Returns the helper's pid; TERM it to stop
/// forwarding.
pub fn spawn_forwarder(listener: OwnedFd, target: XTarget) -> Result<i32> {
    match unsafe { nix::unistd::fork() }.map_err(Error::Os)? {
        ForkResult::Parent { child } => Ok(child.as_raw()),
        ForkResult::Child => {
            let listener = TcpListener::from(listener);
            let code = match forwarder_loop(&listener, &target) {
                Ok(()) => 0,
                Err(e) => {
                    warn!(error = %e, "X11 forwarder terminated");
                    1
                }
            };
            unsafe { libc::_exit(code) }
        }
    }
}

enum Upstream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

fn connect_upstream(target: &XTarget) -> io::Result<Upstream> {
    match target {
        XTarget::Unix(path) => UnixStream::connect(path).map(Upstream::Unix),
        XTarget::Tcp(host, port) => {
            TcpStream::connect((host.as_str(), *port)).map(Upstream::Tcp)
        }
    }
}

fn forwarder_loop(listener: &TcpListener, target: &XTarget) -> io::Result<()> {
    loop {
        let (conn, peer) = listener.accept()?;
        debug!(?peer, "X11 connection");
        match connect_upstream(target) {
            Ok(Upstream::Unix(upstream)) => splice_pair(conn, upstream),
            Ok(Upstream::Tcp(upstream)) => splice_pair(conn, upstream),
            Err(e) => {
                warn!(error = %e, "cannot reach X server");
            }
        }
    }
}

/// Pump bytes both ways in two detached threads, half-closing each side
/// when the other reaches EOF.
fn splice_pair<S>(conn: TcpStream, upstream: S)
where
    S: io::Read + io::Write + TryCloneShutdown + Send + 'static,
{
    let (Ok(conn2), Ok(upstream2)) = (conn.try_clone(), upstream.try_clone_stream()) else {
        return;
    };
    std::thread::spawn(move || {
        let mut from = conn;
        let mut to = upstream;
        let _ = io::copy(&mut from, &mut to);
        to.shutdown_write();
    });
    std::thread::spawn(move || {
        let mut from = upstream2;
        let mut to = conn2;
        let _ = io::copy(&mut from, &mut to);
        let _ = to.shutdown(std::net::Shutdown::Write);
    });
}

/// The two stream types used upstream, unified for the splice helper.
trait TryCloneShutdown: Sized {
    fn try_clone_stream(&self) -> io::Result<Self>;
    fn shutdown_write(&self);
}

impl TryCloneShutdown for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }
    fn shutdown_write(&self) {
        let _ = self.shutdown(std::net::Shutdown::Write);
    }
}

impl TryCloneShutdown for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }
    fn shutdown_write(&self) {
        let _ = self.shutdown(std::net::Shutdown::Write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_local_display() {
        let d = parse_display(":0").unwrap();
        assert_eq!(d, DisplayInfo { host: String::new(), display: 0, screen: 0 });
    }

    #[test]
    fn parse_display_with_screen() {
        let d = parse_display(":1.2").unwrap();
        assert_eq!(d.display, 1);
        assert_eq!(d.screen, 2);
    }

    #[test]
    fn parse_remote_display() {
        let d = parse_display("127.0.0.1:10.0").unwrap();
        assert_eq!(d.host, "127.0.0.1");
        assert_eq!(d.display, 10);
    }

    #[test]
    fn parse_display_rejects_garbage() {
        assert!(parse_display("nonsense").is_err());
        assert!(parse_display(":abc").is_err());
    }

    #[test]
    fn target_selection() {
        let local = parse_display(":0").unwrap();
        assert_eq!(
            x_target(&local),
            XTarget::Unix(PathBuf::from("/tmp/.X11-unix/X0"))
        );
        let remote = parse_display("10.0.0.1:2").unwrap();
        assert_eq!(
            x_target(&remote),
            XTarget::Tcp(String::from("10.0.0.1"), 6002)
        );
    }

    #[test]
    fn xauth_list_parsing() {
        let out = "somehost/unix:0  MIT-MAGIC-COOKIE-1  0123456789abcdef\n";
        let (proto, key) = parse_xauth_list(out).unwrap();
        assert_eq!(proto, "MIT-MAGIC-COOKIE-1");
        assert_eq!(key, "0123456789abcdef");
    }

    #[test]
    fn xauth_list_takes_last_entry() {
        let out = "h/unix:0  A  111\nh/unix:0  B  222\n";
        let (proto, key) = parse_xauth_list(out).unwrap();
        assert_eq!(proto, "B");
        assert_eq!(key, "222");
    }

    #[test]
    fn xauth_list_empty_is_error() {
        assert!(parse_xauth_list("").is_err());
    }

    #[test]
    fn display_port_allocation() {
        let (listener, display) = find_display_port().unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!((6010..=6099).contains(&port));
        assert_eq!(display, port - 6000);
    }
}
