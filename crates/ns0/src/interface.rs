//! The interface family.
//!
//! One public handle type covers every variant; the variant decides where
//! operations go (through the owning node's RPC channel or straight at
//! the main namespace) and what destruction means:
//!
//! - a node interface is a veth pair whose *control end* stays in the
//!   main namespace for switches to plug into; destroying it deletes the
//!   pair;
//! - a point-to-point half lives entirely inside a node;
//! - an imported device is returned to the main namespace with its
//!   original attributes on destroy (the namespace's own `lo`, and any
//!   interface adopted during a rescan, is imported without migration
//!   and left alone);
//! - a TAP/TUN device disappears when its descriptor closes;
//! - an external main-namespace device used as a bridge port only has
//!   its previous attributes restored.
//!
//! Attributes are never cached: every getter re-reads the kernel, every
//! setter is a read-modify-write through the diff/apply path.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use ns0_iproute::{self as iproute, Address, LinkAttrs, TunMode};

use crate::node::{NodeInner, lock};
use crate::{Error, Result};

const IF_PREFIX: &str = "NETNSif-";
const BR_PREFIX: &str = "NETNSbr-";

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a fresh device name: prefix + 4 hex pid digits + 3 hex
/// counter digits. The result is exactly 15 bytes, the kernel's limit;
/// the pid is folded to 16 bits to keep it that way.
fn fresh_name(prefix: &str) -> String {
    let pid = std::process::id() & 0xffff;
    let n = NAME_COUNTER.fetch_add(1, Ordering::SeqCst) & 0xfff;
    let name = format!("{prefix}{pid:04x}{n:03x}");
    assert!(name.len() <= 15, "generated device name too long: {name}");
    name
}

pub(crate) fn fresh_if_name() -> String {
    fresh_name(IF_PREFIX)
}

pub(crate) fn fresh_bridge_name() -> String {
    fresh_name(BR_PREFIX)
}

pub(crate) enum IfKind {
    /// veth end inside a node, control end in the main namespace.
    Veth { control: String },
    /// veth end inside a node, peer inside another node.
    P2p,
    /// Pre-existing device; `original` present means restore and migrate
    /// back to the main namespace on destroy.
    Imported { original: Option<LinkAttrs> },
    /// TAP/TUN; the descriptor owns the device.
    Tap { fd: Mutex<Option<Arc<OwnedFd>>> },
    /// Main-namespace device used directly (bridge ports).
    External { original: LinkAttrs },
}

pub(crate) struct IfInner {
    /// `None` for main-namespace devices. Weak: a vanished node makes
    /// every operation report [`Error::Dead`] instead of keeping the
    /// slave alive forever.
    node: Option<Weak<NodeInner>>,
    index: u32,
    kind: IfKind,
    destroyed: AtomicBool,
}

/// Handle to one interface; clones refer to the same device.
#[derive(Clone)]
pub struct Interface {
    pub(crate) inner: Arc<IfInner>,
}

impl Interface {
    /// Kernel ifindex; stable for the lifetime of the device.
    pub fn index(&self) -> u32 {
        self.inner.index
    }

    /// Live attribute snapshot.
    pub fn get(&self) -> Result<LinkAttrs> {
        self.inner.get()
    }

    /// Current kernel name.
    pub fn name(&self) -> Result<String> {
        self.get()?
            .name
            .ok_or_else(|| Error::Config(String::from("interface has no name")))
    }

    pub fn up(&self) -> Result<bool> {
        Ok(self.get()?.up.unwrap_or(false))
    }

    pub fn mtu(&self) -> Result<u32> {
        self.get()?
            .mtu
            .ok_or_else(|| Error::Config(String::from("interface has no mtu")))
    }

    pub fn lladdr(&self) -> Result<Option<String>> {
        Ok(self.get()?.lladdr)
    }

    fn set(&self, patch: LinkAttrs) -> Result<()> {
        self.inner.set(patch)
    }

    fn patch(&self) -> LinkAttrs {
        LinkAttrs {
            index: Some(self.inner.index),
            ..Default::default()
        }
    }

    pub fn set_up(&self, up: bool) -> Result<()> {
        let mut p = self.patch();
        p.up = Some(up);
        self.set(p)
    }

    /// Renaming transparently bounces the interface down and back up.
    pub fn set_name(&self, name: &str) -> Result<()> {
        let mut p = self.patch();
        p.name = Some(name.to_owned());
        self.set(p)
    }

    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        iproute::validate_mtu(i64::from(mtu)).map_err(Error::Kernel)?;
        let mut p = self.patch();
        p.mtu = Some(mtu);
        self.set(p)
    }

    /// Accepts any recognised link-layer address form; stored
    /// canonicalised.
    pub fn set_lladdr(&self, lladdr: &str) -> Result<()> {
        let mut p = self.patch();
        p.lladdr = Some(iproute::parse_lladdr(lladdr).map_err(Error::Kernel)?);
        self.set(p)
    }

    pub fn set_broadcast(&self, broadcast: &str) -> Result<()> {
        let mut p = self.patch();
        p.broadcast = Some(broadcast.to_owned());
        self.set(p)
    }

    pub fn set_multicast(&self, multicast: bool) -> Result<()> {
        let mut p = self.patch();
        p.multicast = Some(multicast);
        self.set(p)
    }

    pub fn set_arp(&self, arp: bool) -> Result<()> {
        let mut p = self.patch();
        p.arp = Some(arp);
        self.set(p)
    }

    // -----------------------------------------------------------------------
    // Addresses
    // -----------------------------------------------------------------------

    pub fn add_v4_address(&self, address: Ipv4Addr, prefix_len: u8) -> Result<()> {
        self.add_address(&Address::v4(address, prefix_len, None).map_err(Error::Kernel)?)
    }

    pub fn add_v4_address_with_broadcast(
        &self,
        address: Ipv4Addr,
        prefix_len: u8,
        broadcast: Ipv4Addr,
    ) -> Result<()> {
        self.add_address(&Address::v4(address, prefix_len, Some(broadcast)).map_err(Error::Kernel)?)
    }

    pub fn add_v6_address(&self, address: Ipv6Addr, prefix_len: u8) -> Result<()> {
        self.add_address(&Address::v6(address, prefix_len).map_err(Error::Kernel)?)
    }

    pub fn del_v4_address(&self, address: Ipv4Addr, prefix_len: u8) -> Result<()> {
        self.del_address(&Address::v4(address, prefix_len, None).map_err(Error::Kernel)?)
    }

    pub fn del_v6_address(&self, address: Ipv6Addr, prefix_len: u8) -> Result<()> {
        self.del_address(&Address::v6(address, prefix_len).map_err(Error::Kernel)?)
    }

    pub fn add_address(&self, address: &Address) -> Result<()> {
        match self.inner.owner()? {
            Some(node) => node.rpc(|c| c.add_addr(self.inner.index, address)),
            None => {
                let name = self.name()?;
                iproute::add_addr(&name, address).map_err(Error::Kernel)
            }
        }
    }

    pub fn del_address(&self, address: &Address) -> Result<()> {
        match self.inner.owner()? {
            Some(node) => node.rpc(|c| c.del_addr(self.inner.index, address)),
            None => {
                let name = self.name()?;
                iproute::del_addr(&name, address).map_err(Error::Kernel)
            }
        }
    }

    pub fn get_addresses(&self) -> Result<Vec<Address>> {
        match self.inner.owner()? {
            Some(node) => node.rpc(|c| c.get_addrs(self.inner.index)),
            None => {
                let name = self.name()?;
                iproute::get_addrs(&name).map_err(Error::Kernel)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Variant-specific accessors
    // -----------------------------------------------------------------------

    /// The frame descriptor of a TAP/TUN interface.
    pub fn fd(&self) -> Option<Arc<OwnedFd>> {
        match &self.inner.kind {
            IfKind::Tap { fd } => lock(fd).clone(),
            _ => None,
        }
    }

    /// Name of the main-namespace control end backing this interface,
    /// for the switch layer.
    pub(crate) fn control_name(&self) -> Option<String> {
        match &self.inner.kind {
            IfKind::Veth { control } => Some(control.clone()),
            IfKind::External { original } => original.name.clone(),
            _ => None,
        }
    }

    /// Remove the kernel state behind this handle. Idempotent, and a
    /// no-op when the owning slave already died.
    pub fn destroy(&self) -> Result<()> {
        self.inner.destroy()
    }
}

impl IfInner {
    /// The owning node, when there is one and it is still alive.
    fn owner(&self) -> Result<Option<Arc<NodeInner>>> {
        match &self.node {
            None => Ok(None),
            Some(weak) => weak.upgrade().map(Some).ok_or(Error::Dead),
        }
    }

    fn get(&self) -> Result<LinkAttrs> {
        match self.owner()? {
            Some(node) => node.rpc(|c| c.get_if(self.index)),
            None => iproute::get_if_by_index(self.index).map_err(Error::Kernel),
        }
    }

    fn set(&self, patch: LinkAttrs) -> Result<()> {
        match self.owner()? {
            Some(node) => node.rpc(|c| c.set_if(&patch)),
            None => iproute::set_if(&patch).map_err(Error::Kernel),
        }
    }

    /// Mark destroyed without touching the kernel (the device is already
    /// gone).
    pub(crate) fn forget(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let dead_is_fine = |r: Result<()>| match r {
            Err(Error::Dead) => Ok(()),
            other => other,
        };
        match &self.kind {
            IfKind::Veth { control } => {
                // Deleting the control end takes the whole pair with it,
                // wherever the other end lives.
                iproute::del_if(&LinkAttrs::named(control.clone())).map_err(Error::Kernel)
            }
            IfKind::P2p => {
                let Ok(Some(node)) = self.owner() else {
                    return Ok(());
                };
                dead_is_fine(node.rpc(|c| c.del_if(self.index)))
            }
            IfKind::Imported { original } => {
                let (Ok(Some(node)), Some(original)) = (self.owner(), original) else {
                    return Ok(());
                };
                let result = node.rpc(|c| {
                    let mut restore = original.clone();
                    restore.index = Some(self.index);
                    c.set_if(&restore)?;
                    c.return_if(self.index, std::process::id() as i32)
                });
                dead_is_fine(result)
            }
            IfKind::Tap { fd } => {
                // Dropping the last descriptor clone removes the device.
                lock(fd).take();
                Ok(())
            }
            IfKind::External { original } => {
                let mut restore = original.clone();
                restore.index = Some(self.index);
                iproute::set_if(&restore).map_err(Error::Kernel)
            }
        }
    }
}

impl Drop for IfInner {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            if let Err(e) = self.destroy() {
                warn!(index = self.index, error = %e, "interface cleanup failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

fn wrap(node: &Arc<NodeInner>, index: u32, kind: IfKind) -> Interface {
    let inner = Arc::new(IfInner {
        node: Some(Arc::downgrade(node)),
        index,
        kind,
        destroyed: AtomicBool::new(false),
    });
    node.register_interface(index, &inner);
    Interface { inner }
}

/// Find a device by name inside a node.
fn index_in_node(node: &Arc<NodeInner>, name: &str) -> Result<u32> {
    node.rpc(|c| c.get_if_data())?
        .into_iter()
        .find(|i| i.name.as_deref() == Some(name))
        .and_then(|i| i.index)
        .ok_or_else(|| Error::Config(format!("device {name} did not appear in the node")))
}

pub(crate) fn new_node_interface(node: &Arc<NodeInner>) -> Result<Interface> {
    let inside_name = fresh_if_name();
    let control_name = fresh_if_name();
    let (inside, _control) = iproute::create_if_pair(
        &LinkAttrs::named(inside_name.clone()),
        &LinkAttrs::named(control_name.clone()),
    )
    .map_err(Error::Kernel)?;

    let moved = iproute::change_netns(&inside, node.pid()).map_err(Error::Kernel);
    let index = moved.and_then(|()| index_in_node(node, &inside_name));
    match index {
        Ok(index) => {
            debug!(inside = %inside_name, control = %control_name, index, "node interface created");
            Ok(wrap(
                node,
                index,
                IfKind::Veth {
                    control: control_name,
                },
            ))
        }
        Err(e) => {
            if let Err(undo) = iproute::del_if(&LinkAttrs::named(control_name)) {
                warn!(error = %undo, "cleanup of failed veth pair failed");
            }
            Err(e)
        }
    }
}

/// Create a veth pair with the ends migrated into two distinct nodes.
pub fn create_p2p_pair(first: &crate::Node, second: &crate::Node) -> Result<(Interface, Interface)> {
    let name1 = fresh_if_name();
    let name2 = fresh_if_name();
    let (end1, end2) = iproute::create_if_pair(
        &LinkAttrs::named(name1.clone()),
        &LinkAttrs::named(name2.clone()),
    )
    .map_err(Error::Kernel)?;

    let result = (|| -> Result<(Interface, Interface)> {
        iproute::change_netns(&end1, first.pid()).map_err(Error::Kernel)?;
        iproute::change_netns(&end2, second.pid()).map_err(Error::Kernel)?;
        let index1 = index_in_node(&first.inner, &name1)?;
        let index2 = index_in_node(&second.inner, &name2)?;
        Ok((
            wrap(&first.inner, index1, IfKind::P2p),
            wrap(&second.inner, index2, IfKind::P2p),
        ))
    })();
    if result.is_err() {
        // Deleting whichever end is still reachable removes the pair.
        for name in [&name1, &name2] {
            if iproute::del_if(&LinkAttrs::named(name.clone())).is_ok() {
                break;
            }
        }
    }
    result
}

pub(crate) fn new_tuntap_interface(
    node: &Arc<NodeInner>,
    mode: TunMode,
    use_pi: bool,
) -> Result<Interface> {
    let name = fresh_if_name();
    let (fd, attrs) = iproute::create_tuntap(&name, mode, use_pi).map_err(Error::Kernel)?;
    iproute::change_netns(&attrs, node.pid()).map_err(Error::Kernel)?;
    let index = index_in_node(node, &name)?;
    Ok(wrap(
        node,
        index,
        IfKind::Tap {
            fd: Mutex::new(Some(Arc::new(fd))),
        },
    ))
}

pub(crate) fn import_interface(node: &Arc<NodeInner>, name: &str) -> Result<Interface> {
    let original = iproute::get_if_by_name(name).map_err(Error::Kernel)?;
    iproute::change_netns(&original, node.pid()).map_err(Error::Kernel)?;
    let index = index_in_node(node, name)?;
    Ok(wrap(
        node,
        index,
        IfKind::Imported {
            original: Some(original),
        },
    ))
}

/// Use a pre-existing main-namespace device (typically as a bridge
/// port); its prior state is restored when the handle is destroyed.
pub fn import_host_interface(name: &str) -> Result<Interface> {
    let original = iproute::get_if_by_name(name).map_err(Error::Kernel)?;
    let index = original
        .index
        .ok_or_else(|| Error::Config(format!("no ifindex for {name}")))?;
    Ok(Interface {
        inner: Arc::new(IfInner {
            node: None,
            index,
            kind: IfKind::External { original },
            destroyed: AtomicBool::new(false),
        }),
    })
}

/// Rescan a node: adopt unknown devices, drop vanished ones, return
/// everything sorted by ifindex.
pub(crate) fn scan_interfaces(node: &Arc<NodeInner>) -> Result<Vec<Interface>> {
    let live = node.rpc(|c| c.get_if_data())?;
    let live_indexes: Vec<u32> = live.iter().filter_map(|i| i.index).collect();

    let mut handles: Vec<Interface> = Vec::new();
    {
        let mut registry = lock(&node.interfaces);

        let stale: Vec<u32> = registry
            .iter()
            .filter(|(idx, _)| !live_indexes.contains(idx))
            .map(|(idx, _)| *idx)
            .collect();
        for idx in stale {
            warn!(index = idx, "interface went away");
            if let Some(inner) = registry.remove(&idx).and_then(|w| w.upgrade()) {
                inner.forget();
            }
        }

        for index in &live_indexes {
            let existing = registry.get(index).and_then(Weak::upgrade);
            match existing {
                Some(inner) => handles.push(Interface { inner }),
                None => {
                    let inner = Arc::new(IfInner {
                        node: Some(Arc::downgrade(node)),
                        index: *index,
                        kind: IfKind::Imported { original: None },
                        destroyed: AtomicBool::new(false),
                    });
                    registry.insert(*index, Arc::downgrade(&inner));
                    lock(&node.auto_interfaces).push(inner.clone());
                    handles.push(Interface { inner });
                }
            }
        }
    }
    handles.sort_by_key(|i| i.index());
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_fit_the_kernel_limit() {
        for _ in 0..20 {
            let name = fresh_if_name();
            assert!(name.len() <= 15, "{name}");
            assert!(name.starts_with(IF_PREFIX));
        }
        let bridge = fresh_bridge_name();
        assert!(bridge.len() <= 15);
        assert!(bridge.starts_with(BR_PREFIX));
    }

    #[test]
    fn generated_names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(fresh_if_name()));
        }
    }

    #[test]
    fn counter_wraps_within_three_hex_digits() {
        let name = fresh_if_name();
        let tail = name.strip_prefix(IF_PREFIX).unwrap();
        assert_eq!(tail.len(), 7);
        assert!(tail.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
