//! Parsers for `ip -o` and `tc qdisc show` output.
//!
//! These are coupled to the human-readable formats of iproute2. The
//! parsers scan tokens rather than fixed columns, so cosmetic additions
//! (extra keywords, trailing fields) do not break them; only the fields
//! we consume are load-bearing.

use std::net::IpAddr;

use crate::types::{Address, LinkAttrs, Route, RouteKind, TcParams};
use crate::{Error, Result};

fn parse_err(line: &str) -> Error {
    Error::Parse(line.to_owned())
}

// ---------------------------------------------------------------------------
// ip -o link list
// ---------------------------------------------------------------------------

/// Parse one `ip -o link list` line into a full snapshot.
///
/// ```text
/// 2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq state UP ... \
///     link/ether aa:bb:cc:dd:ee:ff brd ff:ff:ff:ff:ff:ff
/// ```
pub fn parse_link_line(line: &str) -> Result<LinkAttrs> {
    let bad = || parse_err(line);
    let mut tokens = line.split_whitespace();

    let index: u32 = tokens
        .next()
        .and_then(|t| t.strip_suffix(':'))
        .ok_or_else(bad)?
        .parse()
        .map_err(|_| bad())?;

    let name_tok = tokens.next().and_then(|t| t.strip_suffix(':')).ok_or_else(bad)?;
    // veth peers show as "vethX@if5"
    let name = name_tok.split('@').next().unwrap_or(name_tok).to_owned();

    let flags_tok = tokens.next().ok_or_else(bad)?;
    let flags: Vec<&str> = flags_tok
        .trim_start_matches('<')
        .trim_end_matches('>')
        .split(',')
        .collect();

    let mut attrs = LinkAttrs {
        index: Some(index),
        name: Some(name),
        up: Some(flags.iter().any(|f| *f == "UP")),
        multicast: Some(flags.iter().any(|f| *f == "MULTICAST")),
        arp: Some(!flags.iter().any(|f| *f == "NOARP")),
        ..Default::default()
    };

    while let Some(tok) = tokens.next() {
        if tok == "mtu" {
            let mtu = tokens.next().ok_or_else(bad)?;
            attrs.mtu = Some(mtu.parse().map_err(|_| bad())?);
        } else if let Some(kind) = tok.strip_prefix("link/") {
            // link/none (tun) and link/[...] carry no address
            if kind == "none" {
                continue;
            }
            if let Some(lladdr) = tokens.next() {
                attrs.lladdr = Some(lladdr.to_owned());
            }
            if let (Some("brd"), Some(brd)) = (tokens.next(), tokens.next()) {
                attrs.broadcast = Some(brd.to_owned());
            }
            break;
        }
    }

    if attrs.mtu.is_none() {
        return Err(bad());
    }
    Ok(attrs)
}

// ---------------------------------------------------------------------------
// ip -o addr list
// ---------------------------------------------------------------------------

/// Parse one `ip -o addr list` line; `None` for link headers and
/// address families we do not track.
///
/// ```text
/// 2: eth0    inet 10.0.0.1/24 brd 10.0.0.255 scope global eth0\  valid_lft ...
/// ```
pub fn parse_addr_line(line: &str) -> Result<Option<(u32, String, Address)>> {
    let bad = || parse_err(line);
    let mut tokens = line.split_whitespace();

    let index: u32 = match tokens.next().and_then(|t| t.strip_suffix(':')) {
        Some(idx) => idx.parse().map_err(|_| bad())?,
        None => return Ok(None),
    };
    let name = match tokens.next() {
        // a trailing ':' marks a link header line, not an address
        Some(t) if t.ends_with(':') => return Ok(None),
        Some(t) => t.to_owned(),
        None => return Err(bad()),
    };

    let family = tokens.next().ok_or_else(bad)?;
    if family != "inet" && family != "inet6" {
        return Ok(None);
    }

    let cidr = tokens.next().ok_or_else(bad)?;
    let (addr, plen) = cidr.split_once('/').ok_or_else(bad)?;
    let prefix_len: u8 = plen.parse().map_err(|_| bad())?;

    let mut broadcast = None;
    let mut rest = tokens.peekable();
    if rest.peek() == Some(&"brd") {
        rest.next();
        broadcast = rest.next();
    }

    let address = Address::parse(addr, prefix_len, broadcast)?;
    // a v6 token on an inet line (or vice versa) means we misread the format
    if address.is_v4() != (family == "inet") {
        return Err(bad());
    }
    Ok(Some((index, name, address)))
}

// ---------------------------------------------------------------------------
// ip -o route list
// ---------------------------------------------------------------------------

/// Parse one `ip -o route list` line; `None` for entries we do not model
/// (multipath legs, cache entries).
///
/// The output interface arrives as a name; `resolve` maps it to an
/// ifindex.
pub fn parse_route_line(
    line: &str,
    resolve: &dyn Fn(&str) -> Option<u32>,
) -> Result<Option<Route>> {
    let bad = || parse_err(line);
    let mut tokens = line.split_whitespace().peekable();

    let first = match tokens.peek() {
        Some(t) => *t,
        None => return Ok(None),
    };
    let kind = match first.parse::<RouteKind>() {
        Ok(kind) => {
            tokens.next();
            kind
        }
        Err(_) => RouteKind::Unicast,
    };

    let dest = match tokens.next() {
        Some(d) => d,
        None => return Ok(None),
    };
    let (prefix, prefix_len) = if dest == "default" {
        (None, 0)
    } else {
        let (addr, plen) = match dest.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (dest, None),
        };
        let ip: IpAddr = match addr.parse() {
            Ok(ip) => ip,
            // "nexthop" legs of multipath routes etc.
            Err(_) => return Ok(None),
        };
        let full = if ip.is_ipv4() { 32 } else { 128 };
        let prefix_len: u8 = match plen {
            Some(p) => p.parse().map_err(|_| bad())?,
            None => full,
        };
        if prefix_len == 0 {
            (None, 0)
        } else {
            (Some(ip), prefix_len)
        }
    };

    let mut nexthop = None;
    let mut interface = None;
    let mut metric = 0u32;
    while let Some(tok) = tokens.next() {
        match tok {
            "via" => {
                let gw = tokens.next().ok_or_else(bad)?;
                nexthop = Some(gw.parse::<IpAddr>().map_err(|_| bad())?);
            }
            "dev" => {
                let name = tokens.next().ok_or_else(bad)?;
                interface = Some(resolve(name).ok_or_else(|| Error::NoSuchInterface(name.to_owned()))?);
            }
            "metric" => {
                let m = tokens.next().ok_or_else(bad)?;
                metric = m.parse().map_err(|_| bad())?;
            }
            // keyword-with-value fields we do not model
            "proto" | "scope" | "src" | "table" | "pref" | "expires" | "mtu" | "advmss"
            | "hoplimit" | "error" | "weight" => {
                tokens.next();
            }
            // bare flags ("linkdown", "onlink", ...)
            _ => {}
        }
    }

    Ok(Some(Route {
        kind,
        prefix,
        prefix_len,
        nexthop,
        interface,
        metric,
    }))
}

// ---------------------------------------------------------------------------
// tc qdisc show
// ---------------------------------------------------------------------------

/// One qdisc as printed by `tc qdisc show`.
#[derive(Debug, Clone, PartialEq)]
pub struct Qdisc {
    pub kind: String,
    /// "1:", "8001:", …
    pub handle: String,
    /// `None` for root qdiscs.
    pub parent: Option<String>,
    pub dev: Option<String>,
    /// Parameters recovered from the textual dump.
    pub params: TcParams,
}

/// Parse a rate token (`13107Kbit`, `1Mbit`, `800bit`) into bit/s.
pub fn parse_rate(tok: &str) -> Result<u64> {
    let bad = || parse_err(tok);
    let lower = tok.to_ascii_lowercase();
    let (digits, mult) = if let Some(d) = lower.strip_suffix("gbit") {
        (d, 1_000_000_000f64)
    } else if let Some(d) = lower.strip_suffix("mbit") {
        (d, 1_000_000f64)
    } else if let Some(d) = lower.strip_suffix("kbit") {
        (d, 1_000f64)
    } else if let Some(d) = lower.strip_suffix("bit") {
        (d, 1f64)
    } else {
        return Err(bad());
    };
    let value: f64 = digits.parse().map_err(|_| bad())?;
    Ok((value * mult).round() as u64)
}

/// Parse a time token (`100ms`, `1.5s`, `250us`) into seconds.
pub fn parse_time(tok: &str) -> Result<f64> {
    let bad = || parse_err(tok);
    let lower = tok.to_ascii_lowercase();
    let (digits, scale) = if let Some(d) = lower.strip_suffix("usec") {
        (d, 1e-6)
    } else if let Some(d) = lower.strip_suffix("us") {
        (d, 1e-6)
    } else if let Some(d) = lower.strip_suffix("msec") {
        (d, 1e-3)
    } else if let Some(d) = lower.strip_suffix("ms") {
        (d, 1e-3)
    } else if let Some(d) = lower.strip_suffix("sec") {
        (d, 1.0)
    } else if let Some(d) = lower.strip_suffix('s') {
        (d, 1.0)
    } else {
        return Err(bad());
    };
    let value: f64 = digits.parse().map_err(|_| bad())?;
    Ok(value * scale)
}

/// Parse a percentage token (`25%`, `10.5%`) into a 0..=1 fraction.
pub fn parse_percent(tok: &str) -> Result<f64> {
    let digits = tok.strip_suffix('%').ok_or_else(|| parse_err(tok))?;
    let value: f64 = digits.parse().map_err(|_| parse_err(tok))?;
    Ok(value / 100.0)
}

fn is_percent(tok: &str) -> bool {
    tok.ends_with('%')
}

fn is_time(tok: &str) -> bool {
    parse_time(tok).is_ok()
}

/// Parse one `tc qdisc show` line.
///
/// ```text
/// qdisc tbf 1: dev NETNSif-0a4001 root refcnt 2 rate 13107Kbit burst 128000b lat 24.6ms
/// qdisc netem 10: dev NETNSif-0a4001 parent 1: limit 1000 delay 100.0ms  10.0ms 25%
/// ```
pub fn parse_qdisc_line(line: &str) -> Result<Option<Qdisc>> {
    let bad = || parse_err(line);
    let mut tokens = line.split_whitespace().peekable();
    if tokens.next() != Some("qdisc") {
        return Ok(None);
    }
    let kind = tokens.next().ok_or_else(bad)?.to_owned();
    let handle = tokens.next().ok_or_else(bad)?.to_owned();

    let mut parent = None;
    let mut dev = None;
    let mut params = TcParams::default();

    while let Some(tok) = tokens.next() {
        match tok {
            "dev" => dev = tokens.next().map(str::to_owned),
            "parent" => parent = tokens.next().map(str::to_owned),
            "root" => parent = None,
            "rate" => {
                let r = tokens.next().ok_or_else(bad)?;
                params.bandwidth = Some(parse_rate(r)?);
            }
            "delay" => {
                let d = tokens.next().ok_or_else(bad)?;
                params.delay = Some(parse_time(d)?);
                if tokens.peek().copied().is_some_and(is_time) {
                    params.delay_jitter = tokens.next().map(parse_time).transpose()?;
                    if tokens.peek().copied().is_some_and(is_percent) {
                        params.delay_correlation = tokens.next().map(parse_percent).transpose()?;
                    }
                }
            }
            "distribution" => {
                params.delay_distribution = tokens.next().map(str::to_owned);
            }
            "loss" => {
                if tokens.peek() == Some(&"random") {
                    tokens.next();
                }
                let l = tokens.next().ok_or_else(bad)?;
                params.loss = Some(parse_percent(l)?);
                if tokens.peek().copied().is_some_and(is_percent) {
                    params.loss_correlation = tokens.next().map(parse_percent).transpose()?;
                }
            }
            "duplicate" => {
                let d = tokens.next().ok_or_else(bad)?;
                params.dup = Some(parse_percent(d)?);
                if tokens.peek().copied().is_some_and(is_percent) {
                    params.dup_correlation = tokens.next().map(parse_percent).transpose()?;
                }
            }
            "corrupt" => {
                let c = tokens.next().ok_or_else(bad)?;
                params.corrupt = Some(parse_percent(c)?);
                if tokens.peek().copied().is_some_and(is_percent) {
                    params.corrupt_correlation = tokens.next().map(parse_percent).transpose()?;
                }
            }
            _ => {}
        }
    }

    Ok(Some(Qdisc {
        kind,
        handle,
        parent,
        dev,
        params,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_line_loopback() {
        let line = "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00";
        let a = parse_link_line(line).unwrap();
        assert_eq!(a.index, Some(1));
        assert_eq!(a.name.as_deref(), Some("lo"));
        assert_eq!(a.up, Some(true));
        assert_eq!(a.mtu, Some(65536));
        assert_eq!(a.lladdr.as_deref(), Some("00:00:00:00:00:00"));
        assert_eq!(a.broadcast.as_deref(), Some("00:00:00:00:00:00"));
        assert_eq!(a.multicast, Some(false));
        assert_eq!(a.arp, Some(true));
    }

    #[test]
    fn link_line_ethernet() {
        let line = "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT group default qlen 1000\\    link/ether aa:bb:cc:dd:ee:ff brd ff:ff:ff:ff:ff:ff";
        let a = parse_link_line(line).unwrap();
        assert_eq!(a.index, Some(2));
        assert_eq!(a.name.as_deref(), Some("eth0"));
        assert_eq!(a.multicast, Some(true));
        assert_eq!(a.lladdr.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn link_line_down_noarp() {
        let line = "3: dummy0: <BROADCAST,NOARP> mtu 1500 qdisc noop state DOWN mode DEFAULT group default qlen 1000\\    link/ether 12:34:56:78:9a:bc brd ff:ff:ff:ff:ff:ff";
        let a = parse_link_line(line).unwrap();
        assert_eq!(a.up, Some(false));
        assert_eq!(a.arp, Some(false));
    }

    #[test]
    fn link_line_veth_peer_suffix() {
        let line = "7: NETNSif-2a0001@if6: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DEFAULT group default qlen 1000\\    link/ether 36:5c:9c:b1:45:02 brd ff:ff:ff:ff:ff:ff link-netnsid 0";
        let a = parse_link_line(line).unwrap();
        assert_eq!(a.name.as_deref(), Some("NETNSif-2a0001"));
    }

    #[test]
    fn link_line_tun_without_lladdr() {
        let line = "9: tun0: <POINTOPOINT,MULTICAST,NOARP,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UNKNOWN mode DEFAULT group default qlen 500\\    link/none";
        let a = parse_link_line(line).unwrap();
        assert!(a.lladdr.is_none());
        assert_eq!(a.mtu, Some(1500));
    }

    #[test]
    fn link_line_garbage_rejected() {
        assert!(parse_link_line("not an ip line").is_err());
        assert!(parse_link_line("5: noflags").is_err());
    }

    #[test]
    fn addr_line_v4_with_broadcast() {
        let line = "2: eth0    inet 10.0.0.1/24 brd 10.0.0.255 scope global eth0\\       valid_lft forever preferred_lft forever";
        let (idx, name, addr) = parse_addr_line(line).unwrap().unwrap();
        assert_eq!(idx, 2);
        assert_eq!(name, "eth0");
        match addr {
            Address::Inet {
                address,
                prefix_len,
                broadcast,
            } => {
                assert_eq!(address.to_string(), "10.0.0.1");
                assert_eq!(prefix_len, 24);
                assert_eq!(broadcast.map(|b| b.to_string()).as_deref(), Some("10.0.0.255"));
            }
            Address::Inet6 { .. } => panic!("wrong family"),
        }
    }

    #[test]
    fn addr_line_v6() {
        let line = "2: eth0    inet6 fe80::222:19ff:fe22:615d/64 scope link \\       valid_lft forever preferred_lft forever";
        let (_, _, addr) = parse_addr_line(line).unwrap().unwrap();
        assert!(!addr.is_v4());
        assert_eq!(addr.prefix_len(), 64);
    }

    #[test]
    fn addr_line_skips_link_header() {
        let line = "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq state UP";
        assert!(parse_addr_line(line).unwrap().is_none());
    }

    #[test]
    fn route_line_default_via() {
        let resolve = |name: &str| (name == "eth0").then_some(2);
        let r = parse_route_line("default via 10.0.0.254 dev eth0 proto dhcp metric 100", &resolve)
            .unwrap()
            .unwrap();
        assert_eq!(r.kind, RouteKind::Unicast);
        assert!(r.prefix.is_none());
        assert_eq!(r.prefix_len, 0);
        assert_eq!(r.nexthop.map(|n| n.to_string()).as_deref(), Some("10.0.0.254"));
        assert_eq!(r.interface, Some(2));
        assert_eq!(r.metric, 100);
    }

    #[test]
    fn route_line_connected() {
        let resolve = |_: &str| Some(2);
        let r = parse_route_line(
            "10.0.0.0/24 dev eth0 proto kernel scope link src 10.0.0.9",
            &resolve,
        )
        .unwrap()
        .unwrap();
        assert_eq!(r.prefix.map(|p| p.to_string()).as_deref(), Some("10.0.0.0"));
        assert_eq!(r.prefix_len, 24);
        assert!(r.nexthop.is_none());
    }

    #[test]
    fn route_line_unreachable_without_dev() {
        let resolve = |_: &str| None;
        let r = parse_route_line("unreachable 10.9.0.0/16 metric 3", &resolve)
            .unwrap()
            .unwrap();
        assert_eq!(r.kind, RouteKind::Unreachable);
        assert!(r.interface.is_none());
        assert_eq!(r.metric, 3);
    }

    #[test]
    fn route_line_bare_host_prefix() {
        let resolve = |_: &str| Some(1);
        let r = parse_route_line(
            "broadcast 127.255.255.255 dev lo table local proto kernel scope link src 127.0.0.1",
            &resolve,
        )
        .unwrap()
        .unwrap();
        assert_eq!(r.kind, RouteKind::Broadcast);
        assert_eq!(r.prefix_len, 32);
    }

    #[test]
    fn route_line_v6() {
        let resolve = |_: &str| Some(2);
        let r = parse_route_line("fe80::/64 dev eth0 proto kernel metric 256 pref medium", &resolve)
            .unwrap()
            .unwrap();
        assert_eq!(r.prefix_len, 64);
        assert_eq!(r.metric, 256);
    }

    #[test]
    fn route_line_unknown_device_errors() {
        let resolve = |_: &str| None;
        assert!(parse_route_line("10.0.0.0/24 dev ghost0", &resolve).is_err());
    }

    #[test]
    fn route_line_multipath_leg_skipped() {
        let resolve = |_: &str| Some(2);
        assert!(
            parse_route_line("nexthop via 10.0.0.1 dev eth0 weight 1", &resolve)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn rate_tokens() {
        assert_eq!(parse_rate("800bit").unwrap(), 800);
        assert_eq!(parse_rate("13107Kbit").unwrap(), 13_107_000);
        assert_eq!(parse_rate("1Mbit").unwrap(), 1_000_000);
        assert_eq!(parse_rate("2Gbit").unwrap(), 2_000_000_000);
        assert!(parse_rate("13107").is_err());
    }

    #[test]
    fn time_tokens() {
        assert!((parse_time("100ms").unwrap() - 0.1).abs() < 1e-9);
        assert!((parse_time("100.0ms").unwrap() - 0.1).abs() < 1e-9);
        assert!((parse_time("250us").unwrap() - 0.00025).abs() < 1e-12);
        assert!((parse_time("1.5s").unwrap() - 1.5).abs() < 1e-9);
        assert!(parse_time("fast").is_err());
    }

    #[test]
    fn percent_tokens() {
        assert!((parse_percent("25%").unwrap() - 0.25).abs() < 1e-9);
        assert!((parse_percent("10.5%").unwrap() - 0.105).abs() < 1e-9);
        assert!(parse_percent("25").is_err());
    }

    #[test]
    fn qdisc_line_tbf() {
        let line = "qdisc tbf 1: dev NETNSif-2a0001 root refcnt 2 rate 13107Kbit burst 128000b lat 24.6ms";
        let q = parse_qdisc_line(line).unwrap().unwrap();
        assert_eq!(q.kind, "tbf");
        assert_eq!(q.handle, "1:");
        assert!(q.parent.is_none());
        assert_eq!(q.dev.as_deref(), Some("NETNSif-2a0001"));
        assert_eq!(q.params.bandwidth, Some(13_107_000));
    }

    #[test]
    fn qdisc_line_netem_child() {
        let line = "qdisc netem 10: dev NETNSif-2a0001 parent 1: limit 1000 delay 100.0ms  10.0ms 25% loss 10% duplicate 5% corrupt 1%";
        let q = parse_qdisc_line(line).unwrap().unwrap();
        assert_eq!(q.kind, "netem");
        assert_eq!(q.parent.as_deref(), Some("1:"));
        assert!((q.params.delay.unwrap() - 0.1).abs() < 1e-9);
        assert!((q.params.delay_jitter.unwrap() - 0.01).abs() < 1e-9);
        assert!((q.params.delay_correlation.unwrap() - 0.25).abs() < 1e-9);
        assert!((q.params.loss.unwrap() - 0.10).abs() < 1e-9);
        assert!((q.params.dup.unwrap() - 0.05).abs() < 1e-9);
        assert!((q.params.corrupt.unwrap() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn qdisc_line_netem_delay_only() {
        let line = "qdisc netem 1: dev X root refcnt 2 limit 1000 delay 50ms";
        let q = parse_qdisc_line(line).unwrap().unwrap();
        assert!((q.params.delay.unwrap() - 0.05).abs() < 1e-9);
        assert!(q.params.delay_jitter.is_none());
    }

    #[test]
    fn qdisc_line_loss_random_form() {
        let line = "qdisc netem 1: root refcnt 2 limit 1000 loss random 7% 25%";
        let q = parse_qdisc_line(line).unwrap().unwrap();
        assert!((q.params.loss.unwrap() - 0.07).abs() < 1e-9);
        assert!((q.params.loss_correlation.unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn qdisc_line_distribution() {
        let line = "qdisc netem 1: root refcnt 2 limit 1000 delay 100ms 10ms distribution normal";
        let q = parse_qdisc_line(line).unwrap().unwrap();
        assert_eq!(q.params.delay_distribution.as_deref(), Some("normal"));
    }

    #[test]
    fn qdisc_line_foreign_kind() {
        let line = "qdisc prio 8001: dev eth0 root refcnt 2 bands 3 priomap 1 2 2 2 1 2 0 0 1 1 1 1 1 1 1 1";
        let q = parse_qdisc_line(line).unwrap().unwrap();
        assert_eq!(q.kind, "prio");
        assert_eq!(q.handle, "8001:");
    }

    #[test]
    fn non_qdisc_line_skipped() {
        assert!(parse_qdisc_line("class htb 1:1 root").unwrap().is_none());
    }
}
