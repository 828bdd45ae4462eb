//! Link CRUD: veth pairs, attribute changes, namespace migration.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::environ::{execute, tools};
use crate::parse::parse_link_line;
use crate::types::{LinkAttrs, parse_lladdr, validate_mtu};
use crate::{Error, Result};

/// Snapshot every interface, keyed by index and by name.
pub fn get_if_data() -> Result<(BTreeMap<u32, LinkAttrs>, HashMap<String, LinkAttrs>)> {
    let tools = tools()?;
    let out = crate::environ::backticks(&[
        tools.ip.to_string_lossy().as_ref(),
        "-o",
        "link",
        "list",
    ])?;
    let mut byidx = BTreeMap::new();
    let mut bynam = HashMap::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let attrs = parse_link_line(line)?;
        if let (Some(idx), Some(name)) = (attrs.index, attrs.name.clone()) {
            byidx.insert(idx, attrs.clone());
            bynam.insert(name, attrs);
        }
    }
    Ok((byidx, bynam))
}

pub fn get_if_by_index(index: u32) -> Result<LinkAttrs> {
    let (byidx, _) = get_if_data()?;
    byidx
        .get(&index)
        .cloned()
        .ok_or_else(|| Error::NoSuchInterface(format!("#{index}")))
}

pub fn get_if_by_name(name: &str) -> Result<LinkAttrs> {
    let (_, bynam) = get_if_data()?;
    bynam
        .get(name)
        .cloned()
        .ok_or_else(|| Error::NoSuchInterface(name.to_owned()))
}

/// Resolve the current kernel name of an interface handle.
fn if_name(iface: &LinkAttrs) -> Result<String> {
    if let Some(name) = &iface.name {
        return Ok(name.clone());
    }
    match iface.index {
        Some(idx) => get_if_by_index(idx)?
            .name
            .ok_or_else(|| Error::NoSuchInterface(format!("#{idx}"))),
        None => Err(Error::invalid("interface", "neither name nor index set")),
    }
}

fn live_snapshot(iface: &LinkAttrs) -> Result<LinkAttrs> {
    match iface.index {
        Some(idx) => get_if_by_index(idx),
        None => match &iface.name {
            Some(name) => get_if_by_name(name),
            None => Err(Error::invalid("interface", "neither name nor index set")),
        },
    }
}

/// Compute the ordered `ip link set` invocations turning `orig` into
/// `orig + diff`.
///
/// The kernel refuses to rename or re-address an interface that is up, so
/// those changes are bracketed by a down/up pair unless an `up` change is
/// part of the diff anyway. Commands after a rename address the device by
/// its new name.
fn plan_set_commands(ip: &str, orig: &LinkAttrs, diff: &LinkAttrs) -> Result<Vec<Vec<String>>> {
    let mut dev = orig
        .name
        .clone()
        .ok_or_else(|| Error::invalid("interface", "unnamed"))?;
    let set = |dev: &str| -> Vec<String> {
        vec![
            ip.to_owned(),
            String::from("link"),
            String::from("set"),
            String::from("dev"),
            dev.to_owned(),
        ]
    };
    let mut cmds: Vec<Vec<String>> = Vec::new();

    let needs_down = (diff.name.is_some() || diff.lladdr.is_some()) && orig.up == Some(true);
    if needs_down {
        let mut c = set(&dev);
        c.push(String::from("down"));
        cmds.push(c);
    }
    if let Some(name) = &diff.name {
        let mut c = set(&dev);
        c.push(String::from("name"));
        c.push(name.clone());
        cmds.push(c);
        dev = name.clone();
    }
    if let Some(lladdr) = &diff.lladdr {
        let mut c = set(&dev);
        c.push(String::from("address"));
        c.push(lladdr.clone());
        cmds.push(c);
    }
    if let Some(mtu) = diff.mtu {
        let mut c = set(&dev);
        c.push(String::from("mtu"));
        c.push(mtu.to_string());
        cmds.push(c);
    }
    if let Some(broadcast) = &diff.broadcast {
        let mut c = set(&dev);
        c.push(String::from("broadcast"));
        c.push(broadcast.clone());
        cmds.push(c);
    }
    if let Some(multicast) = diff.multicast {
        let mut c = set(&dev);
        c.push(String::from("multicast"));
        c.push(String::from(if multicast { "on" } else { "off" }));
        cmds.push(c);
    }
    if let Some(arp) = diff.arp {
        let mut c = set(&dev);
        c.push(String::from("arp"));
        c.push(String::from(if arp { "on" } else { "off" }));
        cmds.push(c);
    }
    if let Some(up) = diff.up {
        let mut c = set(&dev);
        c.push(String::from(if up { "up" } else { "down" }));
        cmds.push(c);
    } else if needs_down {
        let mut c = set(&dev);
        c.push(String::from("up"));
        cmds.push(c);
    }
    Ok(cmds)
}

/// Bring the live interface in line with `target`, touching only what
/// differs. On a mid-sequence failure the already-applied commands are
/// rolled back best-effort.
pub fn set_if(target: &LinkAttrs) -> Result<()> {
    set_if_impl(target, true)
}

fn set_if_impl(target: &LinkAttrs, recover: bool) -> Result<()> {
    let orig = live_snapshot(target)?;

    let mut desired = target.clone();
    if let Some(lladdr) = &desired.lladdr {
        desired.lladdr = Some(parse_lladdr(lladdr)?);
    }
    if let Some(mtu) = desired.mtu {
        validate_mtu(i64::from(mtu))?;
    }

    let diff = desired.diff(&orig);
    if diff.is_noop() {
        return Ok(());
    }

    let tools = tools()?;
    let cmds = plan_set_commands(tools.ip.to_string_lossy().as_ref(), &orig, &diff)?;
    for cmd in cmds {
        if let Err(e) = execute(&cmd) {
            if recover {
                if let Err(undo) = set_if_impl(&orig, false) {
                    warn!(error = %undo, "rollback failed");
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Create a connected veth pair; both sides configured per the given
/// attribute sets. On failure nothing is left behind.
pub fn create_if_pair(if1: &LinkAttrs, if2: &LinkAttrs) -> Result<(LinkAttrs, LinkAttrs)> {
    let tools = tools()?;
    let name1 = if1
        .name
        .clone()
        .ok_or_else(|| Error::invalid("interface", "veth side needs a name"))?;
    let name2 = if2
        .name
        .clone()
        .ok_or_else(|| Error::invalid("interface", "veth side needs a name"))?;

    let mut cmd = vec![
        tools.ip.to_string_lossy().into_owned(),
        String::from("link"),
        String::from("add"),
    ];
    for (name, side) in [(&name1, if1), (&name2, if2)] {
        cmd.push(String::from("name"));
        cmd.push(name.clone());
        if let Some(lladdr) = &side.lladdr {
            cmd.push(String::from("address"));
            cmd.push(parse_lladdr(lladdr)?);
        }
        if let Some(broadcast) = &side.broadcast {
            cmd.push(String::from("broadcast"));
            cmd.push(broadcast.clone());
        }
        if let Some(mtu) = side.mtu {
            cmd.push(String::from("mtu"));
            cmd.push(validate_mtu(i64::from(mtu))?.to_string());
        }
        if side.name == if1.name {
            cmd.push(String::from("type"));
            cmd.push(String::from("veth"));
            cmd.push(String::from("peer"));
        }
    }
    execute(&cmd)?;

    let finish = (|| -> Result<()> {
        set_if(if1)?;
        set_if(if2)
    })();
    if let Err(e) = finish {
        for name in [&name1, &name2] {
            if let Err(undo) = del_if(&LinkAttrs::named(name.clone())) {
                warn!(device = %name, error = %undo, "cleanup failed");
            }
        }
        return Err(e);
    }

    let (_, bynam) = get_if_data()?;
    let a = bynam
        .get(&name1)
        .cloned()
        .ok_or_else(|| Error::NoSuchInterface(name1))?;
    let b = bynam
        .get(&name2)
        .cloned()
        .ok_or_else(|| Error::NoSuchInterface(name2))?;
    Ok((a, b))
}

/// Remove a device (a veth deletion removes its peer too).
pub fn del_if(iface: &LinkAttrs) -> Result<()> {
    let tools = tools()?;
    let name = if_name(iface)?;
    execute(&[
        tools.ip.to_string_lossy().as_ref(),
        "link",
        "del",
        name.as_str(),
    ])
}

/// Migrate a device into the network namespace of `pid`.
pub fn change_netns(iface: &LinkAttrs, pid: i32) -> Result<()> {
    let tools = tools()?;
    let name = if_name(iface)?;
    execute(&[
        tools.ip.to_string_lossy().as_ref(),
        "link",
        "set",
        "dev",
        name.as_str(),
        "netns",
        pid.to_string().as_str(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> LinkAttrs {
        LinkAttrs {
            index: Some(3),
            name: Some(String::from("veth0")),
            up: Some(true),
            mtu: Some(1500),
            lladdr: Some(String::from("aa:bb:cc:dd:ee:ff")),
            broadcast: Some(String::from("ff:ff:ff:ff:ff:ff")),
            multicast: Some(true),
            arp: Some(true),
        }
    }

    fn words(cmds: &[Vec<String>]) -> Vec<String> {
        cmds.iter().map(|c| c.join(" ")).collect()
    }

    #[test]
    fn plan_empty_diff_is_empty() {
        let orig = base();
        let diff = orig.diff(&orig);
        assert!(plan_set_commands("ip", &orig, &diff).unwrap().is_empty());
    }

    #[test]
    fn plan_mtu_only() {
        let orig = base();
        let mut target = orig.clone();
        target.mtu = Some(9000);
        let cmds = plan_set_commands("ip", &orig, &target.diff(&orig)).unwrap();
        assert_eq!(words(&cmds), vec!["ip link set dev veth0 mtu 9000"]);
    }

    #[test]
    fn plan_rename_of_up_interface_brackets_with_down_up() {
        let orig = base();
        let mut target = orig.clone();
        target.name = Some(String::from("wan0"));
        let cmds = plan_set_commands("ip", &orig, &target.diff(&orig)).unwrap();
        assert_eq!(
            words(&cmds),
            vec![
                "ip link set dev veth0 down",
                "ip link set dev veth0 name wan0",
                "ip link set dev wan0 up",
            ]
        );
    }

    #[test]
    fn plan_rename_of_down_interface_is_bare() {
        let mut orig = base();
        orig.up = Some(false);
        let mut target = orig.clone();
        target.name = Some(String::from("wan0"));
        let cmds = plan_set_commands("ip", &orig, &target.diff(&orig)).unwrap();
        assert_eq!(words(&cmds), vec!["ip link set dev veth0 name wan0"]);
    }

    #[test]
    fn plan_lladdr_with_explicit_down_does_not_restore_up() {
        let orig = base();
        let mut target = orig.clone();
        target.lladdr = Some(String::from("00:11:22:33:44:55"));
        target.up = Some(false);
        let cmds = plan_set_commands("ip", &orig, &target.diff(&orig)).unwrap();
        assert_eq!(
            words(&cmds),
            vec![
                "ip link set dev veth0 down",
                "ip link set dev veth0 address 00:11:22:33:44:55",
                "ip link set dev veth0 down",
            ]
        );
    }

    #[test]
    fn plan_commands_after_rename_use_new_name() {
        let orig = base();
        let mut target = orig.clone();
        target.name = Some(String::from("wan0"));
        target.mtu = Some(1400);
        target.arp = Some(false);
        let cmds = plan_set_commands("ip", &orig, &target.diff(&orig)).unwrap();
        assert_eq!(
            words(&cmds),
            vec![
                "ip link set dev veth0 down",
                "ip link set dev veth0 name wan0",
                "ip link set dev wan0 mtu 1400",
                "ip link set dev wan0 arp off",
                "ip link set dev wan0 up",
            ]
        );
    }

    #[test]
    fn plan_up_change_comes_last() {
        let orig = base();
        let mut target = orig.clone();
        target.up = Some(false);
        target.mtu = Some(1400);
        target.multicast = Some(false);
        let cmds = plan_set_commands("ip", &orig, &target.diff(&orig)).unwrap();
        let rendered = words(&cmds);
        assert_eq!(rendered.last().map(String::as_str), Some("ip link set dev veth0 down"));
        assert_eq!(rendered.len(), 3);
    }
}
