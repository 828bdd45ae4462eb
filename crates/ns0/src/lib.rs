//! Emulated IP networks on a single Linux host.
//!
//! ns0 composes kernel network namespaces, veth pairs, software bridges,
//! TAP/TUN devices and tbf/netem qdiscs into an in-process object graph
//! mirroring a desired topology. Each emulated host is a [`Node`]: a
//! forked helper process that unshared its network namespace and serves a
//! synchronous line-oriented RPC protocol over a socketpair. Interfaces,
//! switches, addresses and routes are configured through that channel (or
//! directly, for objects living in the main namespace), and real child
//! processes can be launched inside any node.
//!
//! ```no_run
//! use ns0::{Node, Switch};
//!
//! # fn main() -> ns0::Result<()> {
//! let a = Node::new()?;
//! let b = Node::new()?;
//! let (if_a, if_b) = ns0::create_p2p_pair(&a, &b)?;
//! if_a.set_up(true)?;
//! if_b.set_up(true)?;
//! if_a.add_v4_address("10.0.0.1".parse().unwrap(), 24)?;
//! if_b.add_v4_address("10.0.0.2".parse().unwrap(), 24)?;
//! let status = a.system(&["ping", "-qc1", "10.0.0.2"])?;
//! # let _ = status; Ok(())
//! # }
//! ```
//!
//! Requires root (`CAP_SYS_ADMIN` + `CAP_NET_ADMIN`) for everything but
//! the no-namespace testing mode. All state is process-lifetime only:
//! every kernel object created here is torn down when the owning value is
//! dropped, and the slave cleans up after itself when the master goes
//! away.

pub mod client;
pub mod config;
mod fdpass;
pub mod interface;
pub mod node;
pub mod server;
pub mod subprocess;
pub mod switch;
pub mod x11;

pub use interface::{Interface, create_p2p_pair, import_host_interface};
pub use node::{Node, NodeOptions, get_nodes};
pub use ns0_iproute::{Address, LinkAttrs, Route, RouteKind, TcParams};
pub use ns0_proto::{RemoteError, RemoteErrorKind};
pub use ns0_spawn::ExitStatus;
pub use subprocess::{Popen, SpawnOpts, Stdio, Subprocess, UserSpec};
pub use switch::Switch;

/// Errors surfaced by the library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad argument values, unknown users, malformed addresses.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An `ip`/`tc`/`brctl`/sysfs operation failed.
    #[error(transparent)]
    Kernel(#[from] ns0_iproute::Error),

    /// Malformed RPC traffic or an unexpected reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A handler raised on the slave; carries the remote rendering.
    #[error(transparent)]
    Remote(#[from] ns0_proto::RemoteError),

    /// Child-process management failed.
    #[error(transparent)]
    Spawn(#[from] ns0_spawn::SpawnError),

    /// The slave process died; the node is unusable from here on.
    #[error("slave process is gone")]
    Dead,

    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ns0_proto::ProtoError> for Error {
    fn from(e: ns0_proto::ProtoError) -> Self {
        Error::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
