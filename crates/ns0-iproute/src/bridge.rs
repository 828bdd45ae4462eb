//! Bridge management: `brctl` for creation and ports, sysfs for
//! attributes.
//!
//! Bridge timer values live under `/sys/class/net/<br>/bridge/*` in
//! hundredths of a second; this module converts to and from seconds.

use std::fs;
use std::path::PathBuf;

use tracing::warn;

use crate::environ::{execute, tools};
use crate::link::{get_if_by_name, set_if};
use crate::types::{BridgeAttrs, LinkAttrs};
use crate::{Error, Result};

fn bridge_sysfs(name: &str) -> PathBuf {
    PathBuf::from("/sys/class/net").join(name).join("bridge")
}

fn read_scaled(path: PathBuf) -> Result<f32> {
    let raw = fs::read_to_string(&path)?;
    let ticks: i64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("{}: {raw}", path.display())))?;
    Ok(ticks as f32 / 100.0)
}

fn write_scaled(name: &str, attr: &str, seconds: f32) -> Result<()> {
    let ticks = (seconds * 100.0).round() as i64;
    fs::write(bridge_sysfs(name).join(attr), format!("{ticks}\n"))?;
    Ok(())
}

/// Create a bridge device. Attributes are applied with [`set_bridge`].
pub fn create_bridge(name: &str) -> Result<LinkAttrs> {
    let tools = tools()?;
    execute(&[
        tools.brctl.to_string_lossy().as_ref(),
        "addbr",
        name,
    ])?;
    get_if_by_name(name)
}

/// Remove a bridge; it is brought down first, which `brctl` requires.
pub fn del_bridge(name: &str) -> Result<()> {
    let tools = tools()?;
    execute(&[
        tools.ip.to_string_lossy().as_ref(),
        "link",
        "set",
        "dev",
        name,
        "down",
    ])?;
    execute(&[tools.brctl.to_string_lossy().as_ref(), "delbr", name])
}

/// Read the live bridge attributes (base link included).
pub fn get_bridge_data(name: &str) -> Result<BridgeAttrs> {
    let base = get_if_by_name(name)?;
    let dir = bridge_sysfs(name);
    let stp_raw = fs::read_to_string(dir.join("stp_state"))?;
    let stp: i64 = stp_raw
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("stp_state: {stp_raw}")))?;
    Ok(BridgeAttrs {
        base,
        stp: Some(stp != 0),
        forward_delay: Some(read_scaled(dir.join("forward_delay"))?),
        hello_time: Some(read_scaled(dir.join("hello_time"))?),
        ageing_time: Some(read_scaled(dir.join("ageing_time"))?),
        max_age: Some(read_scaled(dir.join("max_age"))?),
    })
}

/// Apply bridge attributes, diffing against live state. Bridge-specific
/// writes go through sysfs in arbitrary order; the base link goes through
/// the usual `ip link set` path. Rollback restores both.
pub fn set_bridge(target: &BridgeAttrs) -> Result<()> {
    set_bridge_impl(target, true)
}

fn set_bridge_impl(target: &BridgeAttrs, recover: bool) -> Result<()> {
    let name = match &target.base.name {
        Some(name) => name.clone(),
        None => {
            return Err(Error::invalid("bridge", "unnamed"));
        }
    };
    let orig = get_bridge_data(&name)?;
    let diff = target.diff(&orig);

    let result = (|| -> Result<()> {
        if let Some(stp) = diff.stp {
            fs::write(
                bridge_sysfs(&name).join("stp_state"),
                if stp { "1\n" } else { "0\n" },
            )?;
        }
        if let Some(v) = diff.forward_delay {
            write_scaled(&name, "forward_delay", v)?;
        }
        if let Some(v) = diff.hello_time {
            write_scaled(&name, "hello_time", v)?;
        }
        if let Some(v) = diff.ageing_time {
            write_scaled(&name, "ageing_time", v)?;
        }
        if let Some(v) = diff.max_age {
            write_scaled(&name, "max_age", v)?;
        }
        if !diff.base.is_noop() {
            set_if(&diff.base.apply_to(&orig.base))?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        if recover {
            if let Err(undo) = set_bridge_impl(&orig, false) {
                warn!(bridge = %name, error = %undo, "bridge rollback failed");
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Names of the current bridge ports, from `/sys/class/net/<br>/brif/`.
pub fn get_bridge_ports(name: &str) -> Result<Vec<String>> {
    let dir = PathBuf::from("/sys/class/net").join(name).join("brif");
    let mut ports = Vec::new();
    for entry in fs::read_dir(dir)? {
        ports.push(entry?.file_name().to_string_lossy().into_owned());
    }
    ports.sort();
    Ok(ports)
}

pub fn add_bridge_port(bridge: &str, port: &str) -> Result<()> {
    let tools = tools()?;
    execute(&[
        tools.brctl.to_string_lossy().as_ref(),
        "addif",
        bridge,
        port,
    ])
}

pub fn del_bridge_port(bridge: &str, port: &str) -> Result<()> {
    let tools = tools()?;
    execute(&[
        tools.brctl.to_string_lossy().as_ref(),
        "delif",
        bridge,
        port,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysfs_paths() {
        assert_eq!(
            bridge_sysfs("br0"),
            PathBuf::from("/sys/class/net/br0/bridge")
        );
    }

    #[test]
    fn bridge_diff_tracks_specific_fields() {
        let a = BridgeAttrs {
            base: LinkAttrs::named("br0"),
            stp: Some(false),
            forward_delay: Some(0.0),
            hello_time: Some(2.0),
            ageing_time: Some(300.0),
            max_age: Some(20.0),
        };
        let mut b = a.clone();
        b.forward_delay = Some(15.0);
        let d = b.diff(&a);
        assert_eq!(d.forward_delay, Some(15.0));
        assert!(d.stp.is_none());
        assert!(d.hello_time.is_none());
    }
}
