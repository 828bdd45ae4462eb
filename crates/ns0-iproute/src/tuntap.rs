//! TAP/TUN device creation via `/dev/net/tun`.
//!
//! The creating process keeps the returned descriptor: frames written to
//! it appear on the interface and vice versa, and closing it removes the
//! device. The interface itself is configured through the regular
//! [`set_if`](crate::link::set_if) path afterwards.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};

use crate::link::get_if_by_name;
use crate::types::LinkAttrs;
use crate::{Error, Result};

/// Which device flavour `TUNSETIFF` should create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunMode {
    /// Ethernet frames.
    Tap,
    /// IP packets.
    Tun,
}

#[repr(C)]
struct IfreqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    // pad to the full ifreq union size
    _pad: [u8; 22],
}

/// Create a TAP or TUN device named `name`.
///
/// `use_pi` keeps the kernel's packet-information header on each frame;
/// most callers want it off.
pub fn create_tuntap(name: &str, mode: TunMode, use_pi: bool) -> Result<(OwnedFd, LinkAttrs)> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
        return Err(Error::invalid("interface name", name));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")?;

    let mut ifr = IfreqFlags {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: 0,
        _pad: [0; 22],
    };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_flags = match mode {
        TunMode::Tap => libc::IFF_TAP as libc::c_short,
        TunMode::Tun => libc::IFF_TUN as libc::c_short,
    };
    if !use_pi {
        ifr.ifr_flags |= libc::IFF_NO_PI as libc::c_short;
    }

    // TUNSETIFF: 16-byte name + 2-byte flags
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &ifr) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let attrs = get_if_by_name(name)?;
    Ok((OwnedFd::from(file), attrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_length_is_checked() {
        let long = "x".repeat(libc::IFNAMSIZ);
        assert!(matches!(
            create_tuntap(&long, TunMode::Tap, false),
            Err(Error::Invalid { .. })
        ));
        assert!(matches!(
            create_tuntap("", TunMode::Tun, false),
            Err(Error::Invalid { .. })
        ));
    }

    #[test]
    fn ifreq_layout_matches_kernel_contract() {
        // TUNSETIFF reads 16 bytes of name followed by 2 bytes of flags.
        assert_eq!(std::mem::offset_of!(IfreqFlags, ifr_flags), libc::IFNAMSIZ);
    }
}
