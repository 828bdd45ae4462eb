//! Address CRUD on top of `ip addr`.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::warn;

use crate::environ::{backticks, execute, tools};
use crate::parse::parse_addr_line;
use crate::types::Address;
use crate::{Error, Result};

/// Snapshot every address, keyed by ifindex and by interface name.
pub fn get_addr_data() -> Result<(BTreeMap<u32, Vec<Address>>, HashMap<String, Vec<Address>>)> {
    let tools = tools()?;
    let out = backticks(&[
        tools.ip.to_string_lossy().as_ref(),
        "-o",
        "addr",
        "list",
    ])?;
    let mut byidx: BTreeMap<u32, Vec<Address>> = BTreeMap::new();
    let mut bynam: HashMap<String, Vec<Address>> = HashMap::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        if let Some((idx, name, addr)) = parse_addr_line(line)? {
            byidx.entry(idx).or_default().push(addr.clone());
            bynam.entry(name).or_default().push(addr);
        }
    }
    Ok((byidx, bynam))
}

/// Current addresses of one interface (empty when it has none).
pub fn get_addrs(name: &str) -> Result<Vec<Address>> {
    let (_, bynam) = get_addr_data()?;
    Ok(bynam.get(name).cloned().unwrap_or_default())
}

fn addr_cmd(verb: &str, dev: &str, address: &Address) -> Result<Vec<String>> {
    let tools = tools()?;
    let mut cmd = vec![
        tools.ip.to_string_lossy().into_owned(),
        String::from("addr"),
        verb.to_owned(),
        String::from("dev"),
        dev.to_owned(),
        String::from("local"),
        address.to_string(),
    ];
    if verb == "add" {
        if let Address::Inet { broadcast, .. } = address {
            cmd.push(String::from("broadcast"));
            cmd.push(match broadcast {
                Some(b) => b.to_string(),
                // "+": derive the broadcast from the prefix
                None => String::from("+"),
            });
        }
    }
    Ok(cmd)
}

/// Add one address; adding an address already present is an error.
pub fn add_addr(dev: &str, address: &Address) -> Result<()> {
    let current = get_addrs(dev)?;
    if current.contains(address) {
        return Err(Error::invalid("address", format!("{address} already present")));
    }
    execute(&addr_cmd("add", dev, address)?)
}

/// Delete one address; the address must be present.
pub fn del_addr(dev: &str, address: &Address) -> Result<()> {
    let current = get_addrs(dev)?;
    if !current.contains(address) {
        return Err(Error::invalid("address", format!("{address} not present")));
    }
    execute(&addr_cmd("del", dev, address)?)
}

/// Make the interface carry exactly `target`, with minimal changes and a
/// best-effort rollback to the pre-call set on failure.
pub fn set_addr(dev: &str, target: &[Address]) -> Result<()> {
    set_addr_impl(dev, target, true)
}

fn set_addr_impl(dev: &str, target: &[Address], recover: bool) -> Result<()> {
    let orig = get_addrs(dev)?;
    let orig_set: HashSet<&Address> = orig.iter().collect();
    let target_set: HashSet<&Address> = target.iter().collect();

    for addr in orig.iter().filter(|a| !target_set.contains(*a)) {
        if let Err(e) = execute(&addr_cmd("del", dev, addr)?) {
            return Err(roll_back(dev, &orig, recover, e));
        }
    }
    for addr in target.iter().filter(|a| !orig_set.contains(*a)) {
        if let Err(e) = execute(&addr_cmd("add", dev, addr)?) {
            return Err(roll_back(dev, &orig, recover, e));
        }
    }
    Ok(())
}

fn roll_back(dev: &str, orig: &[Address], recover: bool, e: Error) -> Error {
    if recover {
        if let Err(undo) = set_addr_impl(dev, orig, false) {
            warn!(device = %dev, error = %undo, "address rollback failed");
        }
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str, plen: u8, brd: Option<&str>) -> Address {
        Address::parse(s, plen, brd).unwrap()
    }

    #[test]
    fn add_command_with_broadcast() {
        let cmd = addr_cmd("add", "eth0", &v4("10.0.0.1", 24, Some("10.0.0.255"))).unwrap();
        let line = cmd.join(" ");
        assert!(line.ends_with("addr add dev eth0 local 10.0.0.1/24 broadcast 10.0.0.255"));
    }

    #[test]
    fn add_command_derives_broadcast() {
        let cmd = addr_cmd("add", "eth0", &v4("10.0.0.1", 24, None)).unwrap();
        assert!(cmd.join(" ").ends_with("broadcast +"));
    }

    #[test]
    fn del_command_has_no_broadcast() {
        let cmd = addr_cmd("del", "eth0", &v4("10.0.0.1", 24, Some("10.0.0.255"))).unwrap();
        let line = cmd.join(" ");
        assert!(line.ends_with("addr del dev eth0 local 10.0.0.1/24"));
    }

    #[test]
    fn v6_commands_never_mention_broadcast() {
        let addr = Address::parse("fe80::1", 64, None).unwrap();
        let cmd = addr_cmd("add", "eth0", &addr).unwrap();
        assert!(!cmd.join(" ").contains("broadcast"));
    }
}
