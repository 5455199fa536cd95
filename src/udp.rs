//! Socket plumbing: the datagram trait, socket construction, and the
//! stack seam that lets tests substitute both.

use crate::netif::{self, IfAddr};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

/// The SSDP multicast group
pub const GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// The SSDP port
pub const PORT: u16 = 1900;

const TTL: u32 = 4;

/// A non-blocking datagram endpoint
///
/// As much of `std::net::UdpSocket` as the engine needs; the
/// indirection exists so tests can script traffic.
pub trait Datagram {
    /// Send one datagram to `to`
    ///
    /// # Errors
    ///
    /// Passes on send failures from the underlying socket.
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, with its source address
    ///
    /// # Errors
    ///
    /// `WouldBlock` when nothing is queued; other failures passed on.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl Datagram for UdpSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, to)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }
}

/// Socket construction and interface enumeration
///
/// [`SystemStack`] is the real implementation; engine tests provide a
/// scripted one.
pub trait Stack {
    /// The socket type this stack produces
    type Socket: Datagram;

    /// The multicast receive socket: bound to `*:1900`, joined to the
    /// SSDP group
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be created or bound. A failed
    /// group join is not fatal (the socket still carries unicast
    /// traffic, and some hosts have no multicast route at all).
    fn multicast_socket(&self) -> io::Result<Self::Socket>;

    /// A per-interface socket: bound to `(addr, ephemeral)` with
    /// `addr` as its multicast egress interface
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be created, configured, or bound.
    fn interface_socket(&self, addr: Ipv4Addr) -> io::Result<Self::Socket>;

    /// A snapshot of the host's interface addresses
    ///
    /// # Errors
    ///
    /// Passes on enumeration failures.
    fn interfaces(&self) -> io::Result<Vec<IfAddr>>;
}

/// The real network stack: socket2-built UDP sockets, getifaddrs
/// enumeration
pub struct SystemStack;

fn new_socket() -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        None,
    )?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

impl Stack for SystemStack {
    type Socket = UdpSocket;

    fn multicast_socket(&self) -> io::Result<UdpSocket> {
        let socket = new_socket()?;
        socket.set_multicast_ttl_v4(TTL)?;
        socket.bind(&socket2::SockAddr::from(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            PORT,
        )))?;
        if let Err(e) =
            socket.join_multicast_v4(&GROUP, &Ipv4Addr::UNSPECIFIED)
        {
            tracing::error!(
                "unable to join {GROUP}: {e} (no network connection?)"
            );
        }
        Ok(socket.into())
    }

    fn interface_socket(&self, addr: Ipv4Addr) -> io::Result<UdpSocket> {
        let socket = new_socket()?;
        socket.set_multicast_if_v4(&addr)?;
        socket.set_multicast_ttl_v4(TTL)?;
        socket.bind(&socket2::SockAddr::from(SocketAddrV4::new(addr, 0)))?;
        Ok(socket.into())
    }

    fn interfaces(&self) -> io::Result<Vec<IfAddr>> {
        netif::local_addresses()
    }
}
