//! Typed value objects for kernel network state.
//!
//! Mutable attributes are `Option`s: `None` means unknown (when parsed)
//! or unchanged (when used as a patch). Subtracting two snapshots yields
//! a patch with only the differing fields set, so `set_*` operations can
//! emit minimal command sequences.

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// One network interface as seen by `ip link`, or a patch against one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAttrs {
    /// Kernel ifindex. Immutable for the lifetime of the device.
    pub index: Option<u32>,
    pub name: Option<String>,
    pub up: Option<bool>,
    pub mtu: Option<u32>,
    /// Canonical `aa:bb:cc:dd:ee:ff`.
    pub lladdr: Option<String>,
    pub broadcast: Option<String>,
    pub multicast: Option<bool>,
    pub arp: Option<bool>,
}

impl LinkAttrs {
    pub fn named(name: impl Into<String>) -> Self {
        LinkAttrs {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// `self - base`: the fields of `self` that differ from `base`, with
    /// the values they have in `self`. The index is carried over from
    /// `self` untouched.
    pub fn diff(&self, base: &LinkAttrs) -> LinkAttrs {
        fn keep<T: PartialEq + Clone>(a: &Option<T>, b: &Option<T>) -> Option<T> {
            if a == b { None } else { a.clone() }
        }
        LinkAttrs {
            index: self.index,
            name: keep(&self.name, &base.name),
            up: keep(&self.up, &base.up),
            mtu: keep(&self.mtu, &base.mtu),
            lladdr: keep(&self.lladdr, &base.lladdr),
            broadcast: keep(&self.broadcast, &base.broadcast),
            multicast: keep(&self.multicast, &base.multicast),
            arp: keep(&self.arp, &base.arp),
        }
    }

    /// True when the patch changes nothing.
    pub fn is_noop(&self) -> bool {
        self.name.is_none()
            && self.up.is_none()
            && self.mtu.is_none()
            && self.lladdr.is_none()
            && self.broadcast.is_none()
            && self.multicast.is_none()
            && self.arp.is_none()
    }

    /// `base` with this patch applied on top.
    pub fn apply_to(&self, base: &LinkAttrs) -> LinkAttrs {
        LinkAttrs {
            index: base.index,
            name: self.name.clone().or_else(|| base.name.clone()),
            up: self.up.or(base.up),
            mtu: self.mtu.or(base.mtu),
            lladdr: self.lladdr.clone().or_else(|| base.lladdr.clone()),
            broadcast: self.broadcast.clone().or_else(|| base.broadcast.clone()),
            multicast: self.multicast.or(base.multicast),
            arp: self.arp.or(base.arp),
        }
    }
}

/// Check an MTU before it ever reaches the kernel.
pub fn validate_mtu(mtu: i64) -> Result<u32> {
    if (1..=65536).contains(&mtu) {
        Ok(mtu as u32)
    } else {
        Err(Error::invalid("mtu", mtu))
    }
}

/// Canonicalise a link-layer address to `aa:bb:cc:dd:ee:ff`.
///
/// Accepts colon-separated groups of one or two hex digits and the bare
/// 12-digit form; anything else (wrong digit count, non-hex) is rejected.
pub fn parse_lladdr(s: &str) -> Result<String> {
    let bad = || Error::invalid("lladdr", s);
    let groups: Vec<u8> = if s.contains(':') {
        s.split(':')
            .map(|g| {
                if g.is_empty() || g.len() > 2 {
                    return Err(bad());
                }
                u8::from_str_radix(g, 16).map_err(|_| bad())
            })
            .collect::<Result<_>>()?
    } else {
        if s.len() != 12 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(bad());
        }
        let bytes = s.as_bytes();
        (0..6)
            .map(|i| {
                let pair = bytes.get(i * 2..i * 2 + 2).ok_or_else(bad)?;
                let pair = std::str::from_utf8(pair).map_err(|_| bad())?;
                u8::from_str_radix(pair, 16).map_err(|_| bad())
            })
            .collect::<Result<_>>()?
    };
    if groups.len() != 6 {
        return Err(bad());
    }
    Ok(groups
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// An interface address. Equality and hashing ignore the broadcast, which
/// is how the kernel distinguishes addresses too.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Address {
    Inet {
        address: Ipv4Addr,
        prefix_len: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        broadcast: Option<Ipv4Addr>,
    },
    Inet6 {
        address: Ipv6Addr,
        prefix_len: u8,
    },
}

impl Address {
    pub fn v4(address: Ipv4Addr, prefix_len: u8, broadcast: Option<Ipv4Addr>) -> Result<Self> {
        if prefix_len > 32 {
            return Err(Error::invalid("prefix_len", prefix_len));
        }
        Ok(Address::Inet {
            address,
            prefix_len,
            broadcast,
        })
    }

    pub fn v6(address: Ipv6Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 128 {
            return Err(Error::invalid("prefix_len", prefix_len));
        }
        Ok(Address::Inet6 {
            address,
            prefix_len,
        })
    }

    /// Parse from textual address + prefix length, guessing the family.
    pub fn parse(address: &str, prefix_len: u8, broadcast: Option<&str>) -> Result<Self> {
        match address.parse::<IpAddr>() {
            Ok(IpAddr::V4(a)) => {
                let brd = broadcast
                    .map(|b| b.parse().map_err(|_| Error::invalid("broadcast", b)))
                    .transpose()?;
                Address::v4(a, prefix_len, brd)
            }
            Ok(IpAddr::V6(a)) => Address::v6(a, prefix_len),
            Err(_) => Err(Error::invalid("address", address)),
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            Address::Inet { address, .. } => IpAddr::V4(*address),
            Address::Inet6 { address, .. } => IpAddr::V6(*address),
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            Address::Inet { prefix_len, .. } | Address::Inet6 { prefix_len, .. } => *prefix_len,
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, Address::Inet { .. })
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.ip() == other.ip() && self.prefix_len() == other.prefix_len()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip().hash(state);
        self.prefix_len().hash(state);
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip(), self.prefix_len())
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    Unicast,
    Local,
    Broadcast,
    Multicast,
    Throw,
    Unreachable,
    Prohibit,
    Blackhole,
    Nat,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Unicast => "unicast",
            RouteKind::Local => "local",
            RouteKind::Broadcast => "broadcast",
            RouteKind::Multicast => "multicast",
            RouteKind::Throw => "throw",
            RouteKind::Unreachable => "unreachable",
            RouteKind::Prohibit => "prohibit",
            RouteKind::Blackhole => "blackhole",
            RouteKind::Nat => "nat",
        }
    }
}

impl std::str::FromStr for RouteKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "unicast" => RouteKind::Unicast,
            "local" => RouteKind::Local,
            "broadcast" => RouteKind::Broadcast,
            "multicast" => RouteKind::Multicast,
            "throw" => RouteKind::Throw,
            "unreachable" => RouteKind::Unreachable,
            "prohibit" => RouteKind::Prohibit,
            "blackhole" => RouteKind::Blackhole,
            "nat" => RouteKind::Nat,
            other => return Err(Error::invalid("route type", other)),
        })
    }
}

/// One routing-table entry. Default routes carry a `None` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub kind: RouteKind,
    pub prefix: Option<IpAddr>,
    pub prefix_len: u8,
    pub nexthop: Option<IpAddr>,
    /// Kernel ifindex of the output device.
    pub interface: Option<u32>,
    pub metric: u32,
}

impl Route {
    /// Validating constructor for user-supplied routes: a unicast route
    /// must name a nexthop or an output interface.
    pub fn new(
        kind: RouteKind,
        prefix: Option<IpAddr>,
        prefix_len: u8,
        nexthop: Option<IpAddr>,
        interface: Option<u32>,
        metric: u32,
    ) -> Result<Self> {
        if matches!(kind, RouteKind::Unicast | RouteKind::Nat)
            && nexthop.is_none()
            && interface.is_none()
        {
            return Err(Error::invalid("route", "needs a nexthop or an interface"));
        }
        let max = match prefix {
            Some(IpAddr::V4(_)) => 32,
            Some(IpAddr::V6(_)) => 128,
            None => 0,
        };
        if prefix_len > max {
            return Err(Error::invalid("prefix_len", prefix_len));
        }
        // "0.0.0.0/0" is just a default route
        let prefix = if prefix_len == 0 { None } else { prefix };
        Ok(Route {
            kind,
            prefix,
            prefix_len,
            nexthop,
            interface,
            metric,
        })
    }
}

// ---------------------------------------------------------------------------
// Bridges
// ---------------------------------------------------------------------------

/// Bridge-specific attributes on top of the base link. Times are seconds;
/// sysfs stores hundredths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeAttrs {
    pub base: LinkAttrs,
    pub stp: Option<bool>,
    pub forward_delay: Option<f32>,
    pub hello_time: Option<f32>,
    pub ageing_time: Option<f32>,
    pub max_age: Option<f32>,
}

impl BridgeAttrs {
    pub fn diff(&self, other: &BridgeAttrs) -> BridgeAttrs {
        fn keep<T: PartialEq + Copy>(a: &Option<T>, b: &Option<T>) -> Option<T> {
            if a == b { None } else { *a }
        }
        BridgeAttrs {
            base: self.base.diff(&other.base),
            stp: keep(&self.stp, &other.stp),
            forward_delay: keep(&self.forward_delay, &other.forward_delay),
            hello_time: keep(&self.hello_time, &other.hello_time),
            ageing_time: keep(&self.ageing_time, &other.ageing_time),
            max_age: keep(&self.max_age, &other.max_age),
        }
    }
}

// ---------------------------------------------------------------------------
// Traffic control
// ---------------------------------------------------------------------------

/// Link-emulation parameters applied to a port: a token bucket for rate
/// limiting and netem for delay/loss/duplication/corruption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcParams {
    /// bit/s.
    pub bandwidth: Option<u64>,
    /// Seconds.
    pub delay: Option<f64>,
    /// Seconds.
    pub delay_jitter: Option<f64>,
    /// 0..=1.
    pub delay_correlation: Option<f64>,
    /// Name of an installed netem distribution table (e.g. "normal").
    pub delay_distribution: Option<String>,
    pub loss: Option<f64>,
    pub loss_correlation: Option<f64>,
    pub dup: Option<f64>,
    pub dup_correlation: Option<f64>,
    pub corrupt: Option<f64>,
    pub corrupt_correlation: Option<f64>,
}

impl TcParams {
    pub fn wants_tbf(&self) -> bool {
        self.bandwidth.is_some()
    }

    pub fn wants_netem(&self) -> bool {
        self.delay.is_some()
            || self.delay_jitter.is_some()
            || self.delay_correlation.is_some()
            || self.delay_distribution.is_some()
            || self.loss.is_some()
            || self.loss_correlation.is_some()
            || self.dup.is_some()
            || self.dup_correlation.is_some()
            || self.corrupt.is_some()
            || self.corrupt_correlation.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.wants_tbf() && !self.wants_netem()
    }

    /// Check internal consistency before any command is emitted.
    pub fn validate(&self) -> Result<()> {
        if (self.delay_correlation.is_some() || self.delay_distribution.is_some())
            && self.delay_jitter.is_none()
        {
            return Err(Error::invalid(
                "delay_correlation",
                "requires delay_jitter",
            ));
        }
        if self.delay_jitter.is_some() && self.delay.is_none() {
            return Err(Error::invalid("delay_jitter", "requires delay"));
        }
        for (field, value) in [
            ("delay_correlation", self.delay_correlation),
            ("loss", self.loss),
            ("loss_correlation", self.loss_correlation),
            ("dup", self.dup),
            ("dup_correlation", self.dup_correlation),
            ("corrupt", self.corrupt),
            ("corrupt_correlation", self.corrupt_correlation),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(Error::invalid(field, v));
                }
            }
        }
        for (field, value) in [("delay", self.delay), ("delay_jitter", self.delay_jitter)] {
            if let Some(v) = value {
                if v < 0.0 {
                    return Err(Error::invalid(field, v));
                }
            }
        }
        if self.bandwidth == Some(0) {
            return Err(Error::invalid("bandwidth", 0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(a: &Address) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        a.hash(&mut h);
        h.finish()
    }

    fn snapshot() -> LinkAttrs {
        LinkAttrs {
            index: Some(2),
            name: Some(String::from("eth0")),
            up: Some(true),
            mtu: Some(1500),
            lladdr: Some(String::from("aa:bb:cc:dd:ee:ff")),
            broadcast: Some(String::from("ff:ff:ff:ff:ff:ff")),
            multicast: Some(true),
            arp: Some(true),
        }
    }

    #[test]
    fn diff_of_identical_is_noop() {
        let a = snapshot();
        assert!(a.diff(&a).is_noop());
    }

    #[test]
    fn diff_keeps_only_changes() {
        let a = snapshot();
        let mut b = a.clone();
        b.mtu = Some(9000);
        b.up = Some(false);
        let d = b.diff(&a);
        assert_eq!(d.mtu, Some(9000));
        assert_eq!(d.up, Some(false));
        assert!(d.name.is_none());
        assert!(d.lladdr.is_none());
        assert_eq!(d.index, Some(2));
    }

    #[test]
    fn diff_applied_restores_target() {
        let a = snapshot();
        let mut b = a.clone();
        b.name = Some(String::from("wan0"));
        b.mtu = Some(1400);
        let d = b.diff(&a);
        assert_eq!(d.apply_to(&a), b);
    }

    #[test]
    fn mtu_bounds() {
        assert!(validate_mtu(0).is_err());
        assert!(validate_mtu(-5).is_err());
        assert!(validate_mtu(65537).is_err());
        assert_eq!(validate_mtu(1).unwrap(), 1);
        assert_eq!(validate_mtu(65536).unwrap(), 65536);
    }

    #[test]
    fn lladdr_canonical_form() {
        assert_eq!(
            parse_lladdr("aa:bb:cc:dd:ee:ff").unwrap(),
            "aa:bb:cc:dd:ee:ff"
        );
    }

    #[test]
    fn lladdr_bare_digits() {
        assert_eq!(parse_lladdr("aabbccddeeff").unwrap(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn lladdr_short_groups_are_zero_padded() {
        assert_eq!(parse_lladdr("a:b:c:d:e:f").unwrap(), "0a:0b:0c:0d:0e:0f");
        assert_eq!(parse_lladdr("0:1:2:3:4:5").unwrap(), "00:01:02:03:04:05");
    }

    #[test]
    fn lladdr_uppercase_folds() {
        assert_eq!(parse_lladdr("AA:BB:CC:DD:EE:0F").unwrap(), "aa:bb:cc:dd:ee:0f");
    }

    #[test]
    fn lladdr_rejects_wrong_lengths() {
        assert!(parse_lladdr("aabbccddeef").is_err()); // 11 digits
        assert!(parse_lladdr("aa:bb:cc:dd:ee").is_err()); // 5 groups
        assert!(parse_lladdr("aa:bb:cc:dd:ee:ff:00").is_err()); // 7 groups
        assert!(parse_lladdr("").is_err());
    }

    #[test]
    fn lladdr_rejects_non_hex() {
        assert!(parse_lladdr("gg:bb:cc:dd:ee:ff").is_err());
        assert!(parse_lladdr("aabbccddeefg").is_err());
    }

    #[test]
    fn address_equality_ignores_broadcast() {
        let a = Address::parse("10.0.0.1", 24, Some("10.0.0.255")).unwrap();
        let b = Address::parse("10.0.0.1", 24, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn address_differs_on_prefix_len() {
        let a = Address::parse("10.0.0.1", 24, None).unwrap();
        let b = Address::parse("10.0.0.1", 26, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn address_families_never_equal() {
        let a = Address::parse("10.0.0.1", 24, None).unwrap();
        let b = Address::parse("::1", 24, None).unwrap();
        assert_ne!(a, b);
        assert!(a.is_v4());
        assert!(!b.is_v4());
    }

    #[test]
    fn address_rejects_bad_prefix() {
        assert!(Address::parse("10.0.0.1", 33, None).is_err());
        assert!(Address::parse("::1", 129, None).is_err());
    }

    #[test]
    fn address_rejects_garbage() {
        assert!(Address::parse("10.0.0.256", 24, None).is_err());
        assert!(Address::parse("not-an-ip", 24, None).is_err());
    }

    #[test]
    fn address_serde_roundtrip() {
        let a = Address::parse("fe80::222:19ff:fe22:615d", 64, None).unwrap();
        let json = serde_json::to_string(&a).unwrap();
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }

    #[test]
    fn unicast_route_needs_target() {
        assert!(Route::new(RouteKind::Unicast, None, 0, None, None, 0).is_err());
        assert!(
            Route::new(
                RouteKind::Unicast,
                None,
                0,
                Some("10.0.0.1".parse().unwrap()),
                None,
                0
            )
            .is_ok()
        );
        assert!(Route::new(RouteKind::Unicast, None, 0, None, Some(2), 0).is_ok());
    }

    #[test]
    fn blackhole_route_needs_no_target() {
        let r = Route::new(
            RouteKind::Blackhole,
            Some("10.1.0.0".parse().unwrap()),
            16,
            None,
            None,
            0,
        )
        .unwrap();
        assert_eq!(r.kind, RouteKind::Blackhole);
    }

    #[test]
    fn zero_prefix_len_normalises_prefix() {
        let r = Route::new(
            RouteKind::Unicast,
            Some("0.0.0.0".parse().unwrap()),
            0,
            Some("10.0.0.1".parse().unwrap()),
            None,
            0,
        )
        .unwrap();
        assert!(r.prefix.is_none());
    }

    #[test]
    fn route_kind_roundtrip() {
        for kind in [
            RouteKind::Unicast,
            RouteKind::Local,
            RouteKind::Broadcast,
            RouteKind::Multicast,
            RouteKind::Throw,
            RouteKind::Unreachable,
            RouteKind::Prohibit,
            RouteKind::Blackhole,
            RouteKind::Nat,
        ] {
            assert_eq!(kind.as_str().parse::<RouteKind>().unwrap(), kind);
        }
    }

    #[test]
    fn tc_params_empty() {
        assert!(TcParams::default().is_empty());
    }

    #[test]
    fn tc_params_shapes() {
        let tbf = TcParams {
            bandwidth: Some(13107200),
            ..Default::default()
        };
        assert!(tbf.wants_tbf() && !tbf.wants_netem());
        let netem = TcParams {
            delay: Some(0.1),
            ..Default::default()
        };
        assert!(!netem.wants_tbf() && netem.wants_netem());
    }

    #[test]
    fn tc_correlation_requires_jitter() {
        let p = TcParams {
            delay: Some(0.1),
            delay_correlation: Some(0.25),
            ..Default::default()
        };
        assert!(p.validate().is_err());
        let p = TcParams {
            delay: Some(0.1),
            delay_jitter: Some(0.01),
            delay_correlation: Some(0.25),
            ..Default::default()
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn tc_distribution_requires_jitter() {
        let p = TcParams {
            delay: Some(0.1),
            delay_distribution: Some(String::from("normal")),
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn tc_jitter_requires_delay() {
        let p = TcParams {
            delay_jitter: Some(0.01),
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn tc_percentages_bounded() {
        let p = TcParams {
            loss: Some(1.5),
            ..Default::default()
        };
        assert!(p.validate().is_err());
        let p = TcParams {
            loss: Some(0.1),
            ..Default::default()
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn tc_zero_bandwidth_rejected() {
        let p = TcParams {
            bandwidth: Some(0),
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }
}
