//! Nodes: one forked slave process per emulated host.

use std::collections::BTreeMap;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use nix::sched::CloneFlags;
use nix::unistd::ForkResult;
use tracing::{debug, warn};

use ns0_iproute::environ::{execute, tools};
use ns0_iproute::Route;
use ns0_proto::format_reply;

use crate::client::Client;
use crate::interface::{IfInner, Interface};
use crate::server::Server;
use crate::subprocess::SubprocessInner;
use crate::x11;
use crate::{Error, Result};

static NODES: Mutex<Vec<Weak<NodeInner>>> = Mutex::new(Vec::new());

pub(crate) fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// All live nodes, in creation order.
pub fn get_nodes() -> Vec<Node> {
    let mut registry = lock(&NODES);
    registry.retain(|w| w.strong_count() > 0);
    registry
        .iter()
        .filter_map(Weak::upgrade)
        .map(|inner| Node { inner })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeOptions {
    /// Skip the namespace unshare (and the forwarding sysctls); useful
    /// for driving the protocol without privileges.
    pub nonetns: bool,
    /// Forward X11 into the node via a proxied TCP display.
    pub forward_x11: bool,
}

pub(crate) struct NodeInner {
    pid: i32,
    client: Mutex<Option<Client>>,
    dead: AtomicBool,
    destroyed: AtomicBool,
    pub(crate) interfaces: Mutex<BTreeMap<u32, Weak<IfInner>>>,
    /// Keep-alive handles for interfaces we adopted rather than created.
    pub(crate) auto_interfaces: Mutex<Vec<Arc<IfInner>>>,
    pub(crate) processes: Mutex<Vec<Weak<SubprocessInner>>>,
    x11_forwarder: Mutex<Option<i32>>,
}

/// One emulated host: a separate process in its own network namespace,
/// driven over a private RPC channel. Cloning shares the same node.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node in a fresh network namespace. Needs root.
    pub fn new() -> Result<Node> {
        Node::with_options(NodeOptions::default())
    }

    pub fn with_options(options: NodeOptions) -> Result<Node> {
        let (parent_end, child_end) = UnixStream::pair()?;

        let pid = match unsafe { nix::unistd::fork() }.map_err(Error::Os)? {
            ForkResult::Child => {
                drop(parent_end);
                run_slave(child_end, options.nonetns)
            }
            ForkResult::Parent { child } => child.as_raw(),
        };
        drop(child_end);
        debug!(pid, "slave forked");

        let client = match Client::new(parent_end) {
            Ok(client) => client,
            Err(e) => {
                let _ = ns0_spawn::wait(pid);
                return Err(e);
            }
        };

        let inner = Arc::new(NodeInner {
            pid,
            client: Mutex::new(Some(client)),
            dead: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            interfaces: Mutex::new(BTreeMap::new()),
            auto_interfaces: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
            x11_forwarder: Mutex::new(None),
        });
        lock(&NODES).push(Arc::downgrade(&inner));
        let node = Node { inner };

        if options.forward_x11 {
            node.enable_x11_forwarding()?;
        }
        if !options.nonetns {
            node.get_interface("lo")?.set_up(true)?;
        }
        Ok(node)
    }

    /// Kernel pid of the slave process.
    pub fn pid(&self) -> i32 {
        self.inner.pid
    }

    fn enable_x11_forwarding(&self) -> Result<()> {
        let display_var = std::env::var("DISPLAY")
            .map_err(|_| Error::Config(String::from("DISPLAY is not set")))?;
        let display = x11::parse_display(&display_var)?;
        let (protoname, hexkey) = x11::xauth_cookie(&display_var)?;
        let listener = self.inner.rpc(|c| {
            c.x11_set(&protoname, &hexkey)?;
            c.x11_socket()
        })?;
        let helper = x11::spawn_forwarder(listener, x11::x_target(&display))?;
        *lock(&self.inner.x11_forwarder) = Some(helper);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Interfaces
    // -----------------------------------------------------------------------

    /// Create a veth pair with one end inside the node and the control
    /// end kept in the main namespace.
    pub fn add_if(&self) -> Result<Interface> {
        crate::interface::new_node_interface(&self.inner)
    }

    /// Create a TAP device inside the node; the frame descriptor stays
    /// with the caller.
    pub fn add_tap(&self, use_pi: bool) -> Result<Interface> {
        crate::interface::new_tuntap_interface(&self.inner, ns0_iproute::TunMode::Tap, use_pi)
    }

    /// Create a TUN device inside the node.
    pub fn add_tun(&self, use_pi: bool) -> Result<Interface> {
        crate::interface::new_tuntap_interface(&self.inner, ns0_iproute::TunMode::Tun, use_pi)
    }

    /// Migrate an existing main-namespace device into the node; it is
    /// restored and migrated back when the handle is destroyed.
    pub fn import_if(&self, name: &str) -> Result<Interface> {
        crate::interface::import_interface(&self.inner, name)
    }

    /// Destroy an interface and drop it from the node's registry.
    pub fn del_if(&self, iface: &Interface) -> Result<()> {
        lock(&self.inner.interfaces).remove(&iface.index());
        iface.destroy()
    }

    /// Every interface currently present in the namespace, adopting ones
    /// created behind our back and discarding ones that went away.
    pub fn get_interfaces(&self) -> Result<Vec<Interface>> {
        crate::interface::scan_interfaces(&self.inner)
    }

    /// Look up one interface by its current kernel name.
    pub fn get_interface(&self, name: &str) -> Result<Interface> {
        for iface in self.get_interfaces()? {
            if iface.name()? == name {
                return Ok(iface);
            }
        }
        Err(Error::Config(format!("no such interface: {name}")))
    }

    // -----------------------------------------------------------------------
    // Routes
    // -----------------------------------------------------------------------

    pub fn add_route(&self, route: &Route) -> Result<()> {
        self.inner.rpc(|c| c.add_route(route))
    }

    pub fn del_route(&self, route: &Route) -> Result<()> {
        self.inner.rpc(|c| c.del_route(route))
    }

    pub fn get_routes(&self) -> Result<Vec<Route>> {
        self.inner.rpc(|c| c.get_route_data())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Tear everything down: children, interfaces, slave. Idempotent;
    /// later calls and later operations report the node as dead.
    pub fn destroy(&self) -> Result<()> {
        self.inner.destroy()
    }
}

impl NodeInner {
    /// Run one RPC against the slave; once the channel reports the slave
    /// gone, every later call short-circuits.
    pub(crate) fn rpc<T>(&self, f: impl FnOnce(&mut Client) -> Result<T>) -> Result<T> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::Dead);
        }
        let mut guard = lock(&self.client);
        let client = guard.as_mut().ok_or(Error::Dead)?;
        let result = f(client);
        if matches!(result, Err(Error::Dead)) {
            self.dead.store(true, Ordering::SeqCst);
        }
        result
    }

    #[allow(dead_code)]
    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub(crate) fn pid(&self) -> i32 {
        self.pid
    }

    pub(crate) fn register_interface(&self, index: u32, iface: &Arc<IfInner>) {
        lock(&self.interfaces).insert(index, Arc::downgrade(iface));
    }

    pub(crate) fn register_process(&self, process: &Arc<SubprocessInner>) {
        let mut processes = lock(&self.processes);
        processes.retain(|w| w.strong_count() > 0);
        processes.push(Arc::downgrade(process));
    }

    fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(pid = self.pid, "destroying node");

        let processes: Vec<_> = lock(&self.processes)
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        for process in processes {
            process.destroy();
        }

        let interfaces: Vec<_> = lock(&self.interfaces)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        lock(&self.interfaces).clear();
        lock(&self.auto_interfaces).clear();
        for iface in interfaces {
            if let Err(e) = iface.destroy() {
                warn!(error = %e, "interface teardown failed");
            }
        }

        if let Some(helper) = lock(&self.x11_forwarder).take() {
            let _ = ns0_spawn::send_signal(helper, libc::SIGTERM);
            let _ = ns0_spawn::wait(helper);
        }

        self.dead.store(true, Ordering::SeqCst);
        if let Some(mut client) = lock(&self.client).take() {
            if let Err(e) = client.shutdown() {
                warn!(error = %e, "slave shutdown failed");
            }
        }
        match ns0_spawn::wait(self.pid) {
            Ok(status) => {
                if status != 0 {
                    warn!(pid = self.pid, status, "slave exited with non-zero status");
                }
            }
            Err(e) => warn!(pid = self.pid, error = %e, "cannot reap slave"),
        }
        Ok(())
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

/// Child-side bootstrap; never returns into the caller's world.
fn run_slave(stream: UnixStream, nonetns: bool) -> ! {
    let fallback = stream.try_clone();
    let outcome = (|| -> Result<()> {
        let server = Server::new(stream)?;
        if !nonetns {
            nix::sched::unshare(CloneFlags::CLONE_NEWNET).map_err(Error::Os)?;
            let tools = tools().map_err(Error::Kernel)?;
            let sysctl = tools.sysctl.to_string_lossy().into_owned();
            execute(&[sysctl.as_str(), "-w", "net.ipv4.ip_forward=1"]).map_err(Error::Kernel)?;
            execute(&[sysctl.as_str(), "-w", "net.ipv6.conf.default.forwarding=1"])
                .map_err(Error::Kernel)?;
        }
        server.run()
    })();

    let code = match outcome {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("slave node aborting: {e}");
            if let Ok(mut stream) = fallback {
                use std::io::Write;
                let _ = stream
                    .write_all(format_reply(500, &format!("slave aborting: {e}")).as_bytes());
            }
            1
        }
    };
    unsafe { libc::_exit(code) }
}
