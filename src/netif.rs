//! Obtaining a snapshot of the host's IPv4 interface addresses
//!
//! The engine re-samples this list every few seconds and keeps one
//! bound socket per address, so all that is needed here is a flat
//! listing: no link flags, no change notifications. Wildcard
//! (0.0.0.0) entries are discarded; everything else, loopback
//! included, is reported.

use std::net::Ipv4Addr;

/// One address assigned to one host interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfAddr {
    /// The IPv4 address
    pub address: Ipv4Addr,

    /// Kernel interface name, e.g. "eth0"
    pub name: String,
}

/// List every non-wildcard IPv4 address currently assigned to a host
/// interface
///
/// The order is whatever the kernel reports; callers wanting a stable
/// order must sort.
///
/// # Errors
///
/// Passes on failures of the underlying `getifaddrs` call.
pub fn local_addresses() -> std::io::Result<Vec<IfAddr>> {
    let mut out = Vec::new();
    for ifa in nix::ifaddrs::getifaddrs()? {
        let Some(address) = ifa.address else {
            continue;
        };
        let Some(sin) = address.as_sockaddr_in() else {
            continue;
        };
        let address = Ipv4Addr::from(sin.ip());
        if !address.is_unspecified() {
            out.push(IfAddr {
                address,
                name: ifa.interface_name,
            });
        }
    }
    Ok(out)
}
