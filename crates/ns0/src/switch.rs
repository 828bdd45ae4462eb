//! Switches: kernel bridges with per-port link emulation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use ns0_iproute::{self as iproute, BridgeAttrs, LinkAttrs, TcParams};

use crate::interface::{IfInner, Interface, fresh_bridge_name};
use crate::node::lock;
use crate::{Error, Result};

struct SwitchInner {
    name: String,
    index: u32,
    /// Connected interfaces, held weakly: a vanished peer is logged and
    /// dropped, never kept alive by the switch.
    ports: Mutex<Vec<Weak<IfInner>>>,
    params: Mutex<TcParams>,
    destroyed: AtomicBool,
}

/// A software switch in the main namespace. Ports are the control ends
/// of node interfaces (or imported external devices); emulation
/// parameters apply to every port's egress.
#[derive(Clone)]
pub struct Switch {
    inner: Arc<SwitchInner>,
}

impl Switch {
    /// Create a bridge. STP is forced off and the forward delay zeroed:
    /// fast start-up matters more here than loop protection.
    pub fn new() -> Result<Switch> {
        let name = fresh_bridge_name();
        let base = iproute::create_bridge(&name).map_err(Error::Kernel)?;
        let index = base
            .index
            .ok_or_else(|| Error::Config(format!("no ifindex for bridge {name}")))?;
        let setup = BridgeAttrs {
            base: LinkAttrs {
                index: Some(index),
                name: Some(name.clone()),
                ..Default::default()
            },
            stp: Some(false),
            forward_delay: Some(0.0),
            ..Default::default()
        };
        if let Err(e) = iproute::set_bridge(&setup) {
            let _ = iproute::del_bridge(&name);
            return Err(Error::Kernel(e));
        }
        debug!(bridge = %name, index, "switch created");
        Ok(Switch {
            inner: Arc::new(SwitchInner {
                name,
                index,
                ports: Mutex::new(Vec::new()),
                params: Mutex::new(TcParams::default()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn index(&self) -> u32 {
        self.inner.index
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn up(&self) -> Result<bool> {
        let attrs = iproute::get_if_by_name(&self.inner.name).map_err(Error::Kernel)?;
        Ok(attrs.up.unwrap_or(false))
    }

    pub fn mtu(&self) -> Result<u32> {
        let attrs = iproute::get_if_by_name(&self.inner.name).map_err(Error::Kernel)?;
        attrs
            .mtu
            .ok_or_else(|| Error::Config(String::from("bridge has no mtu")))
    }

    /// Live bridge attributes (timers in seconds).
    pub fn bridge_attrs(&self) -> Result<BridgeAttrs> {
        iproute::get_bridge_data(&self.inner.name).map_err(Error::Kernel)
    }

    fn set_bridge_attr(&self, fill: impl FnOnce(&mut BridgeAttrs)) -> Result<()> {
        let mut patch = BridgeAttrs {
            base: LinkAttrs {
                index: Some(self.inner.index),
                name: Some(self.inner.name.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        fill(&mut patch);
        iproute::set_bridge(&patch).map_err(Error::Kernel)
    }

    pub fn set_stp(&self, stp: bool) -> Result<()> {
        self.set_bridge_attr(|b| b.stp = Some(stp))
    }

    pub fn set_forward_delay(&self, seconds: f32) -> Result<()> {
        self.set_bridge_attr(|b| b.forward_delay = Some(seconds))
    }

    pub fn set_hello_time(&self, seconds: f32) -> Result<()> {
        self.set_bridge_attr(|b| b.hello_time = Some(seconds))
    }

    pub fn set_ageing_time(&self, seconds: f32) -> Result<()> {
        self.set_bridge_attr(|b| b.ageing_time = Some(seconds))
    }

    pub fn set_max_age(&self, seconds: f32) -> Result<()> {
        self.set_bridge_attr(|b| b.max_age = Some(seconds))
    }

    /// Bring the switch up or down, propagating to every port.
    pub fn set_up(&self, up: bool) -> Result<()> {
        self.set_link_attr(|p| p.up = Some(up))
    }

    /// Change the switch MTU, propagating to every port.
    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        iproute::validate_mtu(i64::from(mtu)).map_err(Error::Kernel)?;
        self.set_link_attr(|p| p.mtu = Some(mtu))
    }

    fn set_link_attr(&self, fill: impl Fn(&mut LinkAttrs)) -> Result<()> {
        let mut patch = LinkAttrs {
            index: Some(self.inner.index),
            name: Some(self.inner.name.clone()),
            ..Default::default()
        };
        fill(&mut patch);
        iproute::set_if(&patch).map_err(Error::Kernel)?;
        for (_, control) in self.live_ports() {
            let mut port_patch = LinkAttrs::named(control);
            fill(&mut port_patch);
            iproute::set_if(&port_patch).map_err(Error::Kernel)?;
        }
        Ok(())
    }

    /// Plug an interface's control end into the switch. The port inherits
    /// the switch's up state and MTU, and the current emulation
    /// parameters are installed on it.
    pub fn connect(&self, iface: &Interface) -> Result<()> {
        let control = iface.control_name().ok_or_else(|| {
            Error::Config(String::from(
                "interface has no main-namespace control end to connect",
            ))
        })?;

        let bridge = iproute::get_if_by_name(&self.inner.name).map_err(Error::Kernel)?;
        let mut patch = LinkAttrs::named(control.clone());
        patch.up = Some(bridge.up.unwrap_or(false));
        patch.mtu = bridge.mtu;
        iproute::set_if(&patch).map_err(Error::Kernel)?;

        iproute::add_bridge_port(&self.inner.name, &control).map_err(Error::Kernel)?;

        let params = lock(&self.inner.params).clone();
        if let Err(e) = iproute::set_tc(&control, &params) {
            let _ = iproute::del_bridge_port(&self.inner.name, &control);
            return Err(Error::Kernel(e));
        }

        lock(&self.inner.ports).push(Arc::downgrade(&iface.inner));
        Ok(())
    }

    /// Unplug a port and restore it to an unshaped state.
    pub fn disconnect(&self, iface: &Interface) -> Result<()> {
        let control = iface.control_name().ok_or_else(|| {
            Error::Config(String::from("interface has no control end"))
        })?;
        iproute::del_bridge_port(&self.inner.name, &control).map_err(Error::Kernel)?;
        iproute::set_tc(&control, &TcParams::default()).map_err(Error::Kernel)?;
        lock(&self.inner.ports).retain(|w| {
            w.upgrade()
                .is_some_and(|p| !Arc::ptr_eq(&p, &iface.inner))
        });
        Ok(())
    }

    /// Replace the emulation parameter set on every port. An empty set
    /// removes the qdisc trees entirely.
    pub fn set_parameters(&self, params: TcParams) -> Result<()> {
        params.validate().map_err(Error::Kernel)?;
        for (_, control) in self.live_ports() {
            iproute::set_tc(&control, &params).map_err(Error::Kernel)?;
        }
        *lock(&self.inner.params) = params;
        Ok(())
    }

    /// Current parameter set (as last applied).
    pub fn parameters(&self) -> TcParams {
        lock(&self.inner.params).clone()
    }

    /// Ports that are both still referenced and still enslaved in the
    /// kernel; everything else is pruned with a warning.
    fn live_ports(&self) -> Vec<(Arc<IfInner>, String)> {
        let kernel_ports = iproute::get_bridge_ports(&self.inner.name).unwrap_or_default();
        let mut out = Vec::new();
        let mut ports = lock(&self.inner.ports);
        ports.retain(|weak| {
            let Some(inner) = weak.upgrade() else {
                warn!(bridge = %self.inner.name, "port handle went away, dropping");
                return false;
            };
            let iface = Interface { inner };
            let Some(control) = iface.control_name() else {
                return false;
            };
            if !kernel_ports.contains(&control) {
                warn!(bridge = %self.inner.name, port = %control, "port no longer enslaved, dropping");
                return false;
            }
            out.push((iface.inner, control));
            true
        });
        out
    }

    /// Remove the bridge (and the shaping on its ports). Idempotent.
    pub fn destroy(&self) -> Result<()> {
        self.inner.destroy()
    }
}

impl SwitchInner {
    fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(bridge = %self.name, "destroying switch");
        if let Ok(ports) = iproute::get_bridge_ports(&self.name) {
            for port in ports {
                if let Err(e) = iproute::del_bridge_port(&self.name, &port) {
                    warn!(port = %port, error = %e, "cannot unplug port");
                }
                if let Err(e) = iproute::set_tc(&port, &TcParams::default()) {
                    warn!(port = %port, error = %e, "cannot unshape port");
                }
            }
        }
        iproute::del_bridge(&self.name).map_err(Error::Kernel)
    }
}

impl Drop for SwitchInner {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            if let Err(e) = self.destroy() {
                warn!(bridge = %self.name, error = %e, "switch cleanup failed");
            }
        }
    }
}
