// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast target enumeration.
//!
//! Every non-loopback IPv4 interface contributes its directed broadcast
//! address (`address | !netmask`); the limited broadcast `255.255.255.255`
//! is always included.

use std::io;
use std::net::Ipv4Addr;

/// An IPv4 interface address with its netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceV4 {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl InterfaceV4 {
    pub fn broadcast(&self) -> Ipv4Addr {
        broadcast_address(self.addr, self.netmask)
    }
}

/// Directed broadcast address of `addr` within `netmask`.
pub fn broadcast_address(addr: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(netmask))
}

/// Deduplicated broadcast targets, limited broadcast first.
pub fn broadcast_targets_for(interfaces: &[InterfaceV4]) -> Vec<Ipv4Addr> {
    let mut targets = vec![Ipv4Addr::BROADCAST];
    for iface in interfaces {
        if iface.addr.is_loopback() {
            continue;
        }
        let target = iface.broadcast();
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}

/// Broadcast targets for the interfaces of this machine.
///
/// Interface enumeration failures are logged and degrade to the limited
/// broadcast address alone.
pub fn broadcast_targets() -> Vec<Ipv4Addr> {
    let interfaces = match list_ipv4_interfaces() {
        Ok(ifs) => ifs,
        Err(e) => {
            tracing::debug!("Failed to list network interfaces: {}", e);
            Vec::new()
        }
    };
    let targets = broadcast_targets_for(&interfaces);
    tracing::debug!("Broadcast targets: {:?}", targets);
    targets
}

/// Non-loopback IPv4 interfaces via `getifaddrs`.
#[cfg(unix)]
pub fn list_ipv4_interfaces() -> io::Result<Vec<InterfaceV4>> {
    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs writes a valid list head into `ifaddrs` on success.
    if unsafe { libc::getifaddrs(&mut ifaddrs) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut interfaces = Vec::new();
    let mut ifa = ifaddrs;
    while !ifa.is_null() {
        // SAFETY: `ifa` is a non-null node of the list returned by getifaddrs,
        // valid until freeifaddrs below.
        let entry = unsafe { &*ifa };
        ifa = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_netmask.is_null() {
            continue;
        }
        if entry.ifa_flags & (libc::IFF_LOOPBACK as libc::c_uint) != 0 {
            continue;
        }
        // SAFETY: ifa_addr checked non-null; only sa_family is read here.
        let family = unsafe { (*entry.ifa_addr).sa_family } as i32;
        if family != libc::AF_INET {
            continue;
        }

        // SAFETY: AF_INET guarantees both sockaddrs are sockaddr_in, and both
        // pointers were checked non-null above.
        let (addr, mask) = unsafe {
            let addr = (*(entry.ifa_addr as *const libc::sockaddr_in)).sin_addr.s_addr;
            let mask = (*(entry.ifa_netmask as *const libc::sockaddr_in))
                .sin_addr
                .s_addr;
            (addr, mask)
        };

        let iface = InterfaceV4 {
            addr: Ipv4Addr::from(u32::from_be(addr)),
            netmask: Ipv4Addr::from(u32::from_be(mask)),
        };
        if !iface.addr.is_loopback() {
            interfaces.push(iface);
        }
    }

    // SAFETY: `ifaddrs` is the untouched head returned by getifaddrs.
    unsafe { libc::freeifaddrs(ifaddrs) };

    Ok(interfaces)
}

/// Portable fallback: addresses only, no netmask, so nothing beyond the
/// limited broadcast can be derived.
#[cfg(not(unix))]
pub fn list_ipv4_interfaces() -> io::Result<Vec<InterfaceV4>> {
    Ok(Vec::new())
}

/// Best-effort primary LAN address, for display.
pub fn primary_ipv4() -> Option<Ipv4Addr> {
    match local_ip_address::local_ip() {
        Ok(std::net::IpAddr::V4(ip)) => Some(ip),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Failed to determine local IP: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_address() {
        assert_eq!(
            broadcast_address(Ipv4Addr::new(192, 168, 1, 37), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 4, 7, 1), Ipv4Addr::new(255, 255, 240, 0)),
            Ipv4Addr::new(10, 4, 15, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 255)),
            Ipv4Addr::new(10, 0, 0, 1)
        );
    }

    #[test]
    fn test_targets_dedup_and_skip_loopback() {
        let ifs = [
            InterfaceV4 {
                addr: Ipv4Addr::new(192, 168, 1, 10),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
            },
            InterfaceV4 {
                addr: Ipv4Addr::new(192, 168, 1, 11),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
            },
            InterfaceV4 {
                addr: Ipv4Addr::LOCALHOST,
                netmask: Ipv4Addr::new(255, 0, 0, 0),
            },
        ];
        let targets = broadcast_targets_for(&ifs);
        assert_eq!(
            targets,
            vec![Ipv4Addr::BROADCAST, Ipv4Addr::new(192, 168, 1, 255)]
        );
    }

    #[test]
    fn test_targets_always_include_limited_broadcast() {
        assert_eq!(broadcast_targets_for(&[]), vec![Ipv4Addr::BROADCAST]);
        assert!(broadcast_targets().contains(&Ipv4Addr::BROADCAST));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_interfaces_excludes_loopback() {
        let ifs = list_ipv4_interfaces().unwrap();
        assert!(ifs.iter().all(|i| !i.addr.is_loopback()));
    }
}
