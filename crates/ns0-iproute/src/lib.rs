//! Kernel network configuration layer.
//!
//! Drives `ip`, `tc`, `brctl` and sysfs to create veth pairs, migrate
//! interfaces across network namespaces, program addresses and routes,
//! manage software bridges, and install tbf/netem qdisc trees. No netlink:
//! commands run as subprocesses and their textual output is parsed back
//! into typed value objects.
//!
//! The layer follows one pattern per resource kind:
//!
//! - `get_*` parses current kernel state into value objects;
//! - `add_*` / `del_*` issue a single mutating command;
//! - `set_*` diffs desired against live state, applies only the needed
//!   commands in kernel-acceptable order, and rolls the applied prefix
//!   back best-effort when a later command fails.
//!
//! Nothing here caches kernel state: every operation starts from a fresh
//! read, so concurrent mutation by other processes degrades into command
//! errors instead of silent divergence.

pub mod addr;
pub mod bridge;
pub mod environ;
pub mod link;
pub mod parse;
pub mod route;
pub mod tc;
pub mod tuntap;
pub mod types;

pub use addr::{add_addr, del_addr, get_addr_data, get_addrs, set_addr};
pub use bridge::{
    add_bridge_port, create_bridge, del_bridge, del_bridge_port, get_bridge_data,
    get_bridge_ports, set_bridge,
};
pub use environ::{Tools, backticks, execute, retry_eintr, tools};
pub use link::{change_netns, create_if_pair, del_if, get_if_by_index, get_if_by_name, get_if_data, set_if};
pub use route::{add_route, del_route, get_route_data};
pub use tc::{QdiscTree, get_tc_tree, set_tc};
pub use tuntap::{TunMode, create_tuntap};
pub use types::{Address, BridgeAttrs, LinkAttrs, Route, RouteKind, TcParams, parse_lladdr, validate_mtu};

/// Errors from the configuration layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot find `{0}', impossible to continue")]
    MissingTool(String),

    #[error("sysfs does not seem to be mounted, impossible to continue")]
    SysfsMissing,

    #[error("command failed: {command}\n{detail}")]
    Command { command: String, detail: String },

    #[error("unparsable tool output: {0}")]
    Parse(String),

    #[error("invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },

    #[error("no such interface: {0}")]
    NoSuchInterface(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid(field: &'static str, value: impl ToString) -> Self {
        Error::Invalid {
            field,
            value: value.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
