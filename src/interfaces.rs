//! The per-interface socket set, kept aligned with the host's
//! current address list by a sorted merge.

use crate::netif::IfAddr;
use std::net::Ipv4Addr;
use tracing::info;

pub(crate) const MAX_INTERFACES: usize = 32;

/// One non-wildcard local address and the socket bound to it
///
/// `socket` is `None` when binding failed. The slot is retained so the
/// sequence stays aligned with the address list; no rebind happens
/// until the address leaves the host and comes back.
pub(crate) struct LocalInterface<S> {
    pub(crate) address: Ipv4Addr,
    pub(crate) name: String,
    pub(crate) socket: Option<S>,
}

/// Merge `old` (the current slots) with `target` (a freshly-sampled
/// address list), both sorted ascending by address
///
/// Addresses only in `old` have their slot dropped, addresses in both
/// keep their slot verbatim, and addresses only in `target` get a new
/// socket from `make` (`None` on failure). Duplicate addresses pair
/// up one-to-one.
pub(crate) fn reconcile<S>(
    old: Vec<LocalInterface<S>>,
    target: Vec<IfAddr>,
    mut make: impl FnMut(Ipv4Addr) -> Option<S>,
) -> Vec<LocalInterface<S>> {
    let mut next = Vec::with_capacity(target.len());
    let mut old = old.into_iter().peekable();
    for ifa in target {
        while old.peek().is_some_and(|slot| slot.address < ifa.address) {
            retire(&old.next().unwrap());
        }
        let socket = if old
            .peek()
            .is_some_and(|slot| slot.address == ifa.address)
        {
            old.next().unwrap().socket
        } else {
            let socket = make(ifa.address);
            if socket.is_some() {
                info!("listening on {}", ifa.address);
            }
            socket
        };
        next.push(LocalInterface {
            address: ifa.address,
            name: ifa.name,
            socket,
        });
    }
    for slot in old {
        retire(&slot);
    }
    next
}

fn retire<S>(slot: &LocalInterface<S>) {
    if slot.socket.is_some() {
        info!("done on {}", slot.address);
    }
}
