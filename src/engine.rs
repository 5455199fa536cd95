//! The discovery engine: one multicast receive socket, one socket per
//! local interface address, a registry of local devices, and a cache
//! of remote ones.
//!
//! Everything happens inside [`Engine::tick`]; there are no threads
//! and no blocking calls. The scratch buffer is one Ethernet MTU, so
//! no message -- inbound or outbound -- can exceed a single datagram.

use crate::header;
use crate::httpd::DescriptionServer;
use crate::interfaces::{self, LocalInterface, MAX_INTERFACES};
use crate::message::{self, EngineVars};
use crate::udp::{Datagram, Stack, SystemStack, GROUP, PORT};
use crate::{Config, DeviceDescriptor, Error};
use std::collections::HashMap;
use std::hash::Hasher;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[cfg(test)]
use mock_instant::Instant;

#[cfg(not(test))]
use std::time::Instant;

const BUFFER_SIZE: usize = 1500;
const REGISTRY_CAPACITY: usize = 32;
const DISCOVERED_CAPACITY: usize = 1024;
const INTERFACE_REFRESH: Duration = Duration::from_secs(4);
const DEFAULT_MAX_AGE: u32 = 1800;

pub(crate) fn hash64(s: &str) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(s.as_bytes());
    hasher.finish()
}

/// A remote device learned from the wire
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// The USN header value naming the service instance
    pub usn: String,

    /// The LOCATION header from the first sighting, if it carried one
    pub location: Option<String>,

    /// When the advertisement lapses; the entry is dropped on the
    /// first tick at or past this point
    pub expires_at: Instant,
}

struct InterfaceLease {
    address: Ipv4Addr,
    next_announce_at: Instant,
}

/// A locally-registered device: the caller's descriptor plus the
/// per-interface announcement deadlines
pub(crate) struct RegisteredDevice {
    pub(crate) desc: Arc<DeviceDescriptor>,
    leases: Vec<InterfaceLease>,
}

impl RegisteredDevice {
    pub(crate) fn new(desc: Arc<DeviceDescriptor>) -> Self {
        Self {
            desc,
            leases: Vec::new(),
        }
    }
}

/// The core of the SSDP implementation
///
/// Owns every socket and both device tables. The owner drives it by
/// calling [`Engine::tick`] at a regular cadence (a few times per
/// second is plenty); each tick performs at most a bounded amount of
/// socket work and never blocks.
pub struct Engine<S: Stack> {
    stack: S,
    multicast: Option<S::Socket>,
    interfaces: Vec<LocalInterface<S::Socket>>,
    registered: HashMap<u64, RegisteredDevice>,
    discovered: HashMap<u64, DiscoveredDevice>,
    buffer: Box<[u8; BUFFER_SIZE]>,
    max_age_text: String,
    announce: bool,
    announce_interval: Duration,
    refresh_at: Instant,
    reconnect: bool,
    http: DescriptionServer,
    http_port_text: String,
}

#[derive(PartialEq)]
enum Drained {
    Data,
    Empty,
    Dead,
}

enum Source {
    Multicast,
    Interface(usize),
}

#[derive(Clone, Copy, PartialEq)]
enum RequestKind {
    Unknown,
    Notify,
    Search,
}

/// The headers a dispatch decision depends on, copied out of the
/// scratch buffer so it can be reused for any reply
struct ParsedHeaders {
    max_age: u32,
    usn: Option<String>,
    st: Option<String>,
    nts: Option<String>,
    location: Option<String>,
}

impl Default for ParsedHeaders {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            usn: None,
            st: None,
            nts: None,
            location: None,
        }
    }
}

fn on_header(state: &mut ParsedHeaders, key: &str, value: &str) {
    match key.to_ascii_uppercase().as_str() {
        "CACHE-CONTROL" => {
            if let Some(index) = value.find("max-age=") {
                let rest = &value[index + "max-age=".len()..];
                let end = rest
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(rest.len());
                if let Ok(age) = rest[..end].parse() {
                    state.max_age = age;
                }
            }
        }
        "USN" => state.usn = Some(value.to_string()),
        "ST" => state.st = Some(value.to_string()),
        "NTS" => state.nts = Some(value.to_string()),
        "LOCATION" => state.location = Some(value.to_string()),
        _ => {}
    }
}

fn multicast_target() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(GROUP, PORT))
}

fn send_datagram<D: Datagram>(socket: &D, buf: &[u8], to: SocketAddr) {
    if let Err(e) = socket.send_to(buf, to) {
        warn!("send to {to} failed: {e}");
    }
}

/// The slot whose address is numerically closest (by XOR) to `from`
///
/// An approximation of same-subnet, used because the netmask is not
/// portably available; replace with a prefix match if it ever is.
/// Ties go to the earlier slot. Slots without a socket are not
/// considered.
fn closest_interface<S>(
    slots: &[LocalInterface<S>],
    from: Ipv4Addr,
) -> Option<&LocalInterface<S>> {
    let from = u32::from(from);
    let mut best: Option<(&LocalInterface<S>, u32)> = None;
    for slot in slots {
        if slot.socket.is_none() {
            continue;
        }
        let distance = u32::from(slot.address) ^ from;
        if best.as_ref().map_or(true, |(_, d)| distance < *d) {
            best = Some((slot, distance));
        }
    }
    best.map(|(slot, _)| slot)
}

impl Engine<SystemStack> {
    /// Create an engine on the system network stack
    ///
    /// # Errors
    ///
    /// [`Error::Network`] when the multicast socket or the description
    /// endpoint cannot be created, or when `announce_interval` exceeds
    /// `max_age`.
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_stack(SystemStack, config)
    }
}

impl<S: Stack> Engine<S> {
    /// Create an engine on a caller-supplied stack
    ///
    /// # Errors
    ///
    /// As [`Engine::new`].
    pub fn with_stack(stack: S, config: Config) -> Result<Self, Error> {
        if config.announce_interval > config.max_age {
            error!(
                "announce interval {}s exceeds max-age {}s",
                config.announce_interval, config.max_age
            );
            return Err(Error::Network(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "announce interval exceeds max-age",
            )));
        }
        let multicast = stack.multicast_socket().map_err(Error::Network)?;
        let http = DescriptionServer::new().map_err(Error::Network)?;
        let http_port_text = http.port().to_string();
        Ok(Self {
            stack,
            multicast: Some(multicast),
            interfaces: Vec::new(),
            registered: HashMap::new(),
            discovered: HashMap::new(),
            buffer: Box::new([0u8; BUFFER_SIZE]),
            max_age_text: config.max_age.to_string(),
            announce: config.announce,
            announce_interval: Duration::from_secs(u64::from(
                config.announce_interval,
            )),
            refresh_at: Instant::now(),
            reconnect: false,
            http,
            http_port_text,
        })
    }

    /// TCP port of the description-document endpoint
    #[must_use]
    pub fn http_port(&self) -> u16 {
        self.http.port()
    }

    /// Register a device for advertisement
    ///
    /// The descriptor is shared with the engine for as long as the
    /// registration lasts. Announcements (if enabled) start on the
    /// next tick.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRegistered`] for a duplicate id,
    /// [`Error::OutOfResources`] when the table is full.
    pub fn register_device(
        &mut self,
        desc: Arc<DeviceDescriptor>,
    ) -> Result<(), Error> {
        let key = hash64(&desc.id);
        if self.registered.contains_key(&key) {
            return Err(Error::AlreadyRegistered);
        }
        if self.registered.len() >= REGISTRY_CAPACITY {
            return Err(Error::OutOfResources);
        }
        debug!("device '{}' registered", desc.id);
        self.registered.insert(key, RegisteredDevice::new(desc));
        Ok(())
    }

    /// Withdraw a registration, saying byebye on every usable
    /// interface first
    ///
    /// # Errors
    ///
    /// [`Error::NotRegistered`] for an unknown id.
    pub fn deregister_device(&mut self, id: &str) -> Result<(), Error> {
        let device = self
            .registered
            .remove(&hash64(id))
            .ok_or(Error::NotRegistered)?;
        match message::build_byebye(&mut self.buffer[..], &device.desc) {
            Ok(n) => {
                for slot in &self.interfaces {
                    if let Some(socket) = &slot.socket {
                        send_datagram(
                            socket,
                            &self.buffer[..n],
                            multicast_target(),
                        );
                    }
                }
            }
            Err(e) => error!("cannot format byebye message: {e}"),
        }
        debug!("device '{id}' deregistered");
        Ok(())
    }

    /// Forget every discovered device
    pub fn clear_discovered(&mut self) {
        self.discovered.clear();
    }

    /// Visit every currently-known remote device
    pub fn iterate_discovered(&self, mut f: impl FnMut(&DiscoveredDevice)) {
        for device in self.discovered.values() {
            f(device);
        }
    }

    /// Drive the engine
    ///
    /// One tick reconciles the socket set against the host's interface
    /// list (at most every four seconds), expires lapsed discoveries,
    /// re-announces due devices, services the description endpoint,
    /// and drains every readable socket. When `search` is set, one
    /// M-SEARCH probe additionally goes out on every usable interface.
    pub fn tick(&mut self, search: bool) {
        if self.reconnect {
            warn!("reconnecting multicast socket");
            self.multicast = None;
            match self.stack.multicast_socket() {
                Ok(socket) => {
                    self.multicast = Some(socket);
                    self.reconnect = false;
                }
                Err(e) => warn!("multicast socket rebuild failed: {e}"),
            }
        }

        let now = Instant::now();
        if now >= self.refresh_at {
            self.refresh_at = now + INTERFACE_REFRESH;
            self.refresh_interfaces();
        }

        self.expire_discovered(now);

        if self.announce {
            self.announce_registered(now);
        }

        self.http.service(&self.registered);

        self.drain();

        if search {
            self.send_search();
        }
    }

    fn refresh_interfaces(&mut self) {
        let mut target = match self.stack.interfaces() {
            Ok(target) => target,
            Err(e) => {
                warn!("interface enumeration failed: {e}");
                return;
            }
        };
        target.sort_by_key(|ifa| u32::from(ifa.address));
        target.truncate(MAX_INTERFACES);

        let old = std::mem::take(&mut self.interfaces);
        let stack = &self.stack;
        self.interfaces = interfaces::reconcile(old, target, |addr| {
            match stack.interface_socket(addr) {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!("cannot bind {addr}: {e}");
                    None
                }
            }
        });
    }

    fn expire_discovered(&mut self, now: Instant) {
        let mut lapsed = Vec::new();
        for (key, device) in &self.discovered {
            if device.expires_at <= now {
                lapsed.push(*key);
            }
        }
        for key in lapsed {
            if let Some(device) = self.discovered.remove(&key) {
                debug!("expired {}", device.usn);
            }
        }
    }

    fn announce_registered(&mut self, now: Instant) {
        let next = now + self.announce_interval;
        let globals = EngineVars {
            http_port: &self.http_port_text,
            max_age: &self.max_age_text,
        };
        for device in self.registered.values_mut() {
            // Both the lease list and the interface list are sorted by
            // address: one side-by-side walk matches them up. A lease
            // whose address is new starts due immediately.
            let mut leases = Vec::with_capacity(self.interfaces.len());
            let mut old = device.leases.drain(..).peekable();
            for slot in &self.interfaces {
                while old
                    .peek()
                    .is_some_and(|lease| lease.address < slot.address)
                {
                    old.next();
                }
                let next_announce_at = if old
                    .peek()
                    .is_some_and(|lease| lease.address == slot.address)
                {
                    old.next().unwrap().next_announce_at
                } else {
                    now
                };
                leases.push(InterfaceLease {
                    address: slot.address,
                    next_announce_at,
                });
            }
            drop(old);

            for (lease, slot) in leases.iter_mut().zip(&self.interfaces) {
                if lease.next_announce_at > now {
                    continue;
                }
                if let Some(socket) = &slot.socket {
                    debug!(
                        "announcing '{}' on {}",
                        device.desc.id, slot.name
                    );
                    match message::build_alive(
                        &mut self.buffer[..],
                        &device.desc,
                        slot.address,
                        &globals,
                    ) {
                        Ok(n) => send_datagram(
                            socket,
                            &self.buffer[..n],
                            multicast_target(),
                        ),
                        Err(e) => {
                            error!("cannot format announce message: {e}");
                        }
                    }
                }
                lease.next_announce_at = next;
            }
            device.leases = leases;
        }
    }

    /// Process readable sockets until a full pass finds nothing:
    /// multicast first, then the per-interface sockets in address
    /// order, one datagram per socket per pass
    fn drain(&mut self) {
        loop {
            let mut any = false;
            if !self.reconnect && self.multicast.is_some() {
                match self.dispatch(&Source::Multicast) {
                    Drained::Data => any = true,
                    Drained::Dead => self.reconnect = true,
                    Drained::Empty => {}
                }
            }
            for index in 0..self.interfaces.len() {
                if self.interfaces[index].socket.is_some()
                    && self.dispatch(&Source::Interface(index))
                        == Drained::Data
                {
                    any = true;
                }
            }
            if !any {
                return;
            }
        }
    }

    fn dispatch(&mut self, source: &Source) -> Drained {
        let socket = match source {
            Source::Multicast => self.multicast.as_ref(),
            Source::Interface(index) => {
                self.interfaces[*index].socket.as_ref()
            }
        };
        let Some(socket) = socket else {
            return Drained::Empty;
        };
        let (n, from) = match socket.recv_from(&mut self.buffer[..]) {
            Ok(received) => received,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Drained::Empty;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::NotConnected
                ) =>
            {
                // Seen e.g. on iOS when waking from sleep; the socket
                // never recovers
                debug!("permanent receive error: {e}");
                return Drained::Dead;
            }
            Err(e) => {
                debug!("transient receive error: {e}");
                return Drained::Empty;
            }
        };
        let from = match from {
            SocketAddr::V4(from) => from,
            SocketAddr::V6(_) => return Drained::Data,
        };
        debug!("{n} bytes from {from}");

        let mut state = ParsedHeaders::default();
        let mut kind = RequestKind::Unknown;
        let mut status = 0u16;
        let response_mode = matches!(source, Source::Interface(_));
        let buf = &self.buffer[..n];
        let ok = if response_mode {
            header::parse_response(
                buf,
                |_, _, s| status = s,
                |key, value| on_header(&mut state, key, value),
            )
            .is_ok()
        } else {
            header::parse_request(
                buf,
                |method, _, _, _| {
                    kind = match method {
                        "NOTIFY" => RequestKind::Notify,
                        "M-SEARCH" => RequestKind::Search,
                        _ => RequestKind::Unknown,
                    };
                },
                |key, value| on_header(&mut state, key, value),
            )
            .is_ok()
        };
        if !ok {
            warn!("malformed message from {from}");
            return Drained::Data;
        }

        if response_mode {
            if status == 200 {
                match state.usn.take() {
                    Some(usn) => self.handle_alive(
                        usn,
                        state.max_age,
                        state.location.take(),
                    ),
                    None => warn!(
                        "malformed message from {from}: missing USN header"
                    ),
                }
            }
        } else {
            match kind {
                RequestKind::Notify => match state.usn.take() {
                    Some(usn) => match state.nts.as_deref() {
                        Some("ssdp:alive") => self.handle_alive(
                            usn,
                            state.max_age,
                            state.location.take(),
                        ),
                        Some("ssdp:byebye") => self.handle_byebye(&usn),
                        _ => {}
                    },
                    None => warn!(
                        "malformed message from {from}: missing USN header"
                    ),
                },
                RequestKind::Search => match state.st.as_deref() {
                    Some(st) => self.handle_search(st, from),
                    None => {
                        warn!("malformed search message: missing ST header");
                    }
                },
                RequestKind::Unknown => {}
            }
        }
        Drained::Data
    }

    fn handle_alive(
        &mut self,
        usn: String,
        max_age: u32,
        location: Option<String>,
    ) {
        let key = hash64(&usn);
        let expires_at =
            Instant::now() + Duration::from_secs(u64::from(max_age));
        if let Some(existing) = self.discovered.get_mut(&key) {
            debug!("renew {usn}");
            existing.expires_at = expires_at;
            return;
        }
        if self.discovered.len() >= DISCOVERED_CAPACITY {
            warn!("discovered-device table full, ignoring {usn}");
            return;
        }
        debug!("new {} ({})", usn, location.as_deref().unwrap_or("UNKNOWN"));
        self.discovered.insert(
            key,
            DiscoveredDevice {
                usn,
                location,
                expires_at,
            },
        );
    }

    fn handle_byebye(&mut self, usn: &str) {
        if self.discovered.remove(&hash64(usn)).is_some() {
            debug!("byebye {usn}");
        }
    }

    fn handle_search(&mut self, st: &str, from: SocketAddrV4) {
        let globals = EngineVars {
            http_port: &self.http_port_text,
            max_age: &self.max_age_text,
        };
        for device in self.registered.values() {
            if device.desc.device_type != st {
                continue;
            }
            let Some(slot) = closest_interface(&self.interfaces, *from.ip())
            else {
                error!("no usable interface for search response");
                continue;
            };
            debug!("search response for {}", device.desc.udn);
            match message::build_search_result(
                &mut self.buffer[..],
                &device.desc,
                st,
                slot.address,
                &globals,
            ) {
                Ok(n) => {
                    if let Some(socket) = &slot.socket {
                        send_datagram(
                            socket,
                            &self.buffer[..n],
                            SocketAddr::V4(from),
                        );
                    }
                }
                Err(e) => error!("cannot format search response: {e}"),
            }
        }
    }

    fn send_search(&mut self) {
        for slot in &self.interfaces {
            if let Some(socket) = &slot.socket {
                debug!("M-SEARCH on {}", slot.name);
                send_datagram(
                    socket,
                    message::M_SEARCH.as_bytes(),
                    multicast_target(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netif::IfAddr;
    use mock_instant::MockClock;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    #[derive(Default)]
    struct FakeSocket {
        inbound: RefCell<VecDeque<(Vec<u8>, SocketAddr)>>,
        sent: RefCell<Vec<(Vec<u8>, SocketAddr)>>,
        recv_error: RefCell<Option<io::ErrorKind>>,
    }

    impl FakeSocket {
        fn push(&self, data: &[u8], from: SocketAddr) {
            self.inbound
                .borrow_mut()
                .push_back((data.to_vec(), from));
        }

        fn fail_next_recv(&self, kind: io::ErrorKind) {
            *self.recv_error.borrow_mut() = Some(kind);
        }

        fn sent_count(&self) -> usize {
            self.sent.borrow().len()
        }

        fn no_sends(&self) -> bool {
            self.sent.borrow().is_empty()
        }

        fn contains_sent<F>(&self, to: SocketAddr, f: F) -> bool
        where
            F: Fn(&str) -> bool,
        {
            self.sent.borrow().iter().any(|(data, addr)| {
                *addr == to && f(&String::from_utf8_lossy(data))
            })
        }
    }

    impl Datagram for Rc<FakeSocket> {
        fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
            assert!(buf.len() <= BUFFER_SIZE);
            self.sent.borrow_mut().push((buf.to_vec(), to));
            Ok(buf.len())
        }

        fn recv_from(
            &self,
            buf: &mut [u8],
        ) -> io::Result<(usize, SocketAddr)> {
            if let Some(kind) = self.recv_error.borrow_mut().take() {
                return Err(io::Error::from(kind));
            }
            match self.inbound.borrow_mut().pop_front() {
                Some((data, from)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), from))
                }
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    #[derive(Default)]
    struct FakeStack {
        addresses: RefCell<Vec<IfAddr>>,
        multicast: RefCell<Vec<Rc<FakeSocket>>>,
        sockets: RefCell<HashMap<Ipv4Addr, Rc<FakeSocket>>>,
        unbindable: RefCell<Vec<Ipv4Addr>>,
    }

    impl FakeStack {
        fn set_addresses(&self, addrs: &[Ipv4Addr]) {
            *self.addresses.borrow_mut() = addrs
                .iter()
                .enumerate()
                .map(|(i, a)| IfAddr {
                    address: *a,
                    name: format!("eth{i}"),
                })
                .collect();
        }

        fn refuse_bind(&self, addr: Ipv4Addr) {
            self.unbindable.borrow_mut().push(addr);
        }

        /// The socket bound to `addr` (must exist)
        fn socket(&self, addr: Ipv4Addr) -> Rc<FakeSocket> {
            self.sockets.borrow()[&addr].clone()
        }

        /// The currently-active multicast socket
        fn mcast(&self) -> Rc<FakeSocket> {
            self.multicast.borrow().last().unwrap().clone()
        }

        fn multicast_sockets_created(&self) -> usize {
            self.multicast.borrow().len()
        }
    }

    impl Stack for Rc<FakeStack> {
        type Socket = Rc<FakeSocket>;

        fn multicast_socket(&self) -> io::Result<Rc<FakeSocket>> {
            let socket = Rc::new(FakeSocket::default());
            self.multicast.borrow_mut().push(socket.clone());
            Ok(socket)
        }

        fn interface_socket(
            &self,
            addr: Ipv4Addr,
        ) -> io::Result<Rc<FakeSocket>> {
            if self.unbindable.borrow().contains(&addr) {
                return Err(io::Error::from(io::ErrorKind::AddrNotAvailable));
            }
            let socket = Rc::new(FakeSocket::default());
            self.sockets.borrow_mut().insert(addr, socket.clone());
            Ok(socket)
        }

        fn interfaces(&self) -> io::Result<Vec<IfAddr>> {
            Ok(self.addresses.borrow().clone())
        }
    }

    const IF_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const IF_B: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    fn remote(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(192, 168, 1, 50),
            port,
        ))
    }

    fn quiet_config() -> Config {
        Config {
            max_age: 1800,
            announce: false,
            announce_interval: 900,
        }
    }

    fn test_device() -> Arc<DeviceDescriptor> {
        Arc::new(DeviceDescriptor {
            id: "dev1".to_string(),
            udn: "uuid:xyz".to_string(),
            device_type: "urn:foo:bar".to_string(),
            description_template: "<root/>".to_string(),
        })
    }

    struct Fixture {
        stack: Rc<FakeStack>,
        engine: Engine<Rc<FakeStack>>,
    }

    impl Fixture {
        fn new(config: Config) -> Self {
            MockClock::set_time(Duration::ZERO);
            let stack = Rc::new(FakeStack::default());
            let engine = Engine::with_stack(stack.clone(), config).unwrap();
            Fixture { stack, engine }
        }

        /// An engine already ticked once with these interfaces bound
        fn with_interfaces(config: Config, addrs: &[Ipv4Addr]) -> Self {
            let mut f = Self::new(config);
            f.stack.set_addresses(addrs);
            f.engine.tick(false);
            f
        }

        fn discovered(&self) -> Vec<DiscoveredDevice> {
            let mut out = Vec::new();
            self.engine.iterate_discovered(|d| out.push(d.clone()));
            out
        }
    }

    fn alive_datagram(usn: &str, max_age: u32) -> Vec<u8> {
        format!(
            "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
CACHE-CONTROL: max-age={max_age}\r\n\
NT: upnp:rootdevice\r\n\
NTS: ssdp:alive\r\n\
USN: {usn}\r\n\
\r\n"
        )
        .into_bytes()
    }

    /* ==== Discovery cache ==== */

    #[test]
    fn alive_inserts_discovered() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[]);

        f.stack
            .mcast()
            .push(&alive_datagram("uuid:abc::upnp:rootdevice", 100),
                  remote(5000));
        f.engine.tick(false);

        let devices = f.discovered();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].usn, "uuid:abc::upnp:rootdevice");
        assert_eq!(
            devices[0].expires_at,
            Instant::now() + Duration::from_secs(100)
        );
    }

    #[test]
    fn alive_records_location_once() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[]);

        f.stack.mcast().push(
            b"NOTIFY * HTTP/1.1\r\n\
NTS: ssdp:alive\r\n\
USN: uuid:abc::upnp:rootdevice\r\n\
LOCATION: http://192.168.1.50:80/desc\r\n\
\r\n",
            remote(5000),
        );
        f.engine.tick(false);

        let devices = f.discovered();
        assert_eq!(
            devices[0].location.as_deref(),
            Some("http://192.168.1.50:80/desc")
        );
        // Default lease when no CACHE-CONTROL is present
        assert_eq!(
            devices[0].expires_at,
            Instant::now() + Duration::from_secs(1800)
        );
    }

    #[test]
    fn renewal_updates_expiry_in_place() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[]);

        f.stack
            .mcast()
            .push(&alive_datagram("uuid:abc::upnp:rootdevice", 100),
                  remote(5000));
        f.engine.tick(false);

        MockClock::advance(Duration::from_secs(50));
        f.stack
            .mcast()
            .push(&alive_datagram("uuid:abc::upnp:rootdevice", 200),
                  remote(5000));
        f.engine.tick(false);

        let devices = f.discovered();
        assert_eq!(devices.len(), 1);
        assert_eq!(
            devices[0].expires_at,
            Instant::now() + Duration::from_secs(200)
        );
    }

    #[test]
    fn byebye_removes_entry() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[]);

        f.stack
            .mcast()
            .push(&alive_datagram("uuid:abc::upnp:rootdevice", 100),
                  remote(5000));
        f.engine.tick(false);
        assert_eq!(f.discovered().len(), 1);

        f.stack.mcast().push(
            b"NOTIFY * HTTP/1.1\r\n\
NT: upnp:rootdevice\r\n\
NTS: ssdp:byebye\r\n\
USN: uuid:abc::upnp:rootdevice\r\n\
\r\n",
            remote(5000),
        );
        f.engine.tick(false);
        assert!(f.discovered().is_empty());
    }

    #[test]
    fn lapsed_entry_expires_on_next_tick() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[]);

        f.stack
            .mcast()
            .push(&alive_datagram("uuid:abc::upnp:rootdevice", 100),
                  remote(5000));
        f.engine.tick(false);

        MockClock::advance(Duration::from_secs(99));
        f.engine.tick(false);
        assert_eq!(f.discovered().len(), 1);

        MockClock::advance(Duration::from_secs(1));
        f.engine.tick(false);
        assert!(f.discovered().is_empty());
    }

    #[test]
    fn clear_discovered_empties_cache() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[]);

        f.stack
            .mcast()
            .push(&alive_datagram("uuid:abc::upnp:rootdevice", 100),
                  remote(5000));
        f.engine.tick(false);

        f.engine.clear_discovered();
        assert!(f.discovered().is_empty());
    }

    #[test]
    fn cache_full_drops_newcomer() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[]);

        for i in 0..DISCOVERED_CAPACITY {
            f.stack.mcast().push(
                &alive_datagram(&format!("uuid:{i}::t"), 1800),
                remote(5000),
            );
        }
        f.engine.tick(false);
        assert_eq!(f.discovered().len(), DISCOVERED_CAPACITY);

        f.stack
            .mcast()
            .push(&alive_datagram("uuid:late::t", 1800), remote(5000));
        f.engine.tick(false);

        let devices = f.discovered();
        assert_eq!(devices.len(), DISCOVERED_CAPACITY);
        assert!(!devices.iter().any(|d| d.usn == "uuid:late::t"));
    }

    /* ==== Search handling ==== */

    const M_SEARCH_FOO: &[u8] = b"M-SEARCH * HTTP/1.1\r\n\
HOST:239.255.255.250:1900\r\n\
MAN:\"ssdp:discover\"\r\n\
MX:3\r\n\
ST: urn:foo:bar\r\n\
\r\n";

    #[test]
    fn search_match_answers_from_closest_interface() {
        let mut f =
            Fixture::with_interfaces(quiet_config(), &[IF_A, IF_B]);
        f.engine.register_device(test_device()).unwrap();

        f.stack.mcast().push(M_SEARCH_FOO, remote(5000));
        f.engine.tick(false);

        let port = f.engine.http_port();
        assert!(f.stack.socket(IF_A).no_sends());
        assert!(f.stack.socket(IF_B).contains_sent(remote(5000), |m| {
            m.starts_with("HTTP/1.1 200 OK\r\n")
                && m.contains("ST: urn:foo:bar\r\n")
                && m.contains("USN: uuid:xyz::urn:foo:bar\r\n")
                && m.contains(&format!(
                    "LOCATION: http://192.168.1.10:{port}/dev1\r\n"
                ))
        }));
    }

    #[test]
    fn search_miss_sends_nothing() {
        let mut f =
            Fixture::with_interfaces(quiet_config(), &[IF_A, IF_B]);
        f.engine.register_device(test_device()).unwrap();

        f.stack.mcast().push(
            b"M-SEARCH * HTTP/1.1\r\n\
HOST:239.255.255.250:1900\r\n\
MAN:\"ssdp:discover\"\r\n\
MX:3\r\n\
ST: urn:other:baz\r\n\
\r\n",
            remote(5000),
        );
        f.engine.tick(false);

        assert!(f.stack.socket(IF_A).no_sends());
        assert!(f.stack.socket(IF_B).no_sends());
    }

    #[test]
    fn search_without_st_is_dropped() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[IF_A]);
        f.engine.register_device(test_device()).unwrap();

        f.stack.mcast().push(
            b"M-SEARCH * HTTP/1.1\r\nMX: 3\r\n\r\n",
            remote(5000),
        );
        f.engine.tick(false);

        assert!(f.stack.socket(IF_A).no_sends());
    }

    #[test]
    fn search_answered_via_valid_interface_only() {
        let config = quiet_config();
        MockClock::set_time(Duration::ZERO);
        let stack = Rc::new(FakeStack::default());
        stack.refuse_bind(IF_B);
        stack.set_addresses(&[IF_A, IF_B]);
        let mut engine =
            Engine::with_stack(stack.clone(), config).unwrap();
        engine.register_device(test_device()).unwrap();
        engine.tick(false);

        // IF_B would be closer to the requester, but it never bound
        stack.mcast().push(M_SEARCH_FOO, remote(5000));
        engine.tick(false);

        assert!(stack
            .socket(IF_A)
            .contains_sent(remote(5000), |m| m.contains("ST: urn:foo:bar")));
    }

    /* ==== Response handling ==== */

    #[test]
    fn search_response_inserts_discovered() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[IF_A]);

        f.stack.socket(IF_A).push(
            b"HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age=60\r\n\
ST: upnp:rootdevice\r\n\
USN: uuid:peer::upnp:rootdevice\r\n\
LOCATION: http://192.168.1.50:80/desc\r\n\
\r\n",
            remote(1900),
        );
        f.engine.tick(false);

        let devices = f.discovered();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].usn, "uuid:peer::upnp:rootdevice");
        assert_eq!(
            devices[0].expires_at,
            Instant::now() + Duration::from_secs(60)
        );
    }

    #[test]
    fn response_without_usn_is_dropped() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[IF_A]);

        f.stack.socket(IF_A).push(
            b"HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n\r\n",
            remote(1900),
        );
        f.engine.tick(false);

        assert!(f.discovered().is_empty());
    }

    #[test]
    fn non_200_response_is_ignored() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[IF_A]);

        f.stack.socket(IF_A).push(
            b"HTTP/1.1 404 Not Found\r\nUSN: uuid:peer::t\r\n\r\n",
            remote(1900),
        );
        f.engine.tick(false);

        assert!(f.discovered().is_empty());
    }

    #[test]
    fn stray_notify_on_interface_socket_is_dropped() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[IF_A]);

        f.stack
            .socket(IF_A)
            .push(&alive_datagram("uuid:abc::t", 100), remote(1900));
        f.engine.tick(false);

        assert!(f.discovered().is_empty());
    }

    #[test]
    fn garbage_datagram_is_dropped() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[IF_A]);

        f.stack.mcast().push(&[0, 1, 2, 254, 255], remote(5000));
        f.stack.socket(IF_A).push(&[0x80, 0x80], remote(1900));
        f.engine.tick(false);

        assert!(f.discovered().is_empty());
        assert!(f.stack.socket(IF_A).no_sends());
    }

    /* ==== Announcements ==== */

    fn announcing_config() -> Config {
        Config {
            max_age: 1800,
            announce: true,
            announce_interval: 30,
        }
    }

    fn is_alive_notify(m: &str) -> bool {
        m.starts_with("NOTIFY * HTTP/1.1\r\n")
            && m.contains("NTS: ssdp:alive\r\n")
    }

    #[test]
    fn periodic_announcements_per_interface() {
        let mut f = Fixture::new(announcing_config());
        f.stack.set_addresses(&[IF_A, IF_B]);
        f.engine.register_device(test_device()).unwrap();

        // 65 simulated seconds: announcements due at 0, 30 and 60
        for _ in 0..=65 {
            f.engine.tick(false);
            MockClock::advance(Duration::from_secs(1));
        }

        for addr in [IF_A, IF_B] {
            let socket = f.stack.socket(addr);
            assert_eq!(socket.sent_count(), 3);
            assert!(socket.contains_sent(multicast_target(), |m| {
                is_alive_notify(m)
                    && m.contains("USN: uuid:xyz::urn:foo:bar\r\n")
            }));
        }
    }

    #[test]
    fn fresh_registration_announces_on_next_tick() {
        let mut f =
            Fixture::with_interfaces(announcing_config(), &[IF_A]);
        assert!(f.stack.socket(IF_A).no_sends());

        f.engine.register_device(test_device()).unwrap();
        f.engine.tick(false);

        assert_eq!(f.stack.socket(IF_A).sent_count(), 1);
        assert!(f
            .stack
            .socket(IF_A)
            .contains_sent(multicast_target(), is_alive_notify));
    }

    #[test]
    fn new_interface_announces_immediately() {
        let mut f =
            Fixture::with_interfaces(announcing_config(), &[IF_A]);
        f.engine.register_device(test_device()).unwrap();
        f.engine.tick(false);

        // A new address appears; its lease starts due right away even
        // though IF_A's next announcement is still pending
        f.stack.set_addresses(&[IF_A, IF_B]);
        MockClock::advance(Duration::from_secs(4));
        f.engine.tick(false);

        assert_eq!(f.stack.socket(IF_A).sent_count(), 1);
        assert_eq!(f.stack.socket(IF_B).sent_count(), 1);
    }

    #[test]
    fn leases_track_interface_list() {
        let mut f =
            Fixture::with_interfaces(announcing_config(), &[IF_A]);
        f.engine.register_device(test_device()).unwrap();
        f.engine.tick(false);

        let lease_addresses = |engine: &Engine<Rc<FakeStack>>| {
            engine
                .registered
                .values()
                .next()
                .unwrap()
                .leases
                .iter()
                .map(|l| l.address)
                .collect::<Vec<_>>()
        };
        assert_eq!(lease_addresses(&f.engine), vec![IF_A]);

        f.stack.set_addresses(&[IF_A, IF_B]);
        MockClock::advance(Duration::from_secs(4));
        f.engine.tick(false);
        assert_eq!(lease_addresses(&f.engine), vec![IF_A, IF_B]);

        f.stack.set_addresses(&[IF_B]);
        MockClock::advance(Duration::from_secs(4));
        f.engine.tick(false);
        assert_eq!(lease_addresses(&f.engine), vec![IF_B]);
    }

    #[test]
    fn no_announcements_when_disabled() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[IF_A]);
        f.engine.register_device(test_device()).unwrap();

        for _ in 0..10 {
            f.engine.tick(false);
            MockClock::advance(Duration::from_secs(10));
        }

        assert!(f.stack.socket(IF_A).no_sends());
    }

    /* ==== Registry ==== */

    #[test]
    fn duplicate_registration_rejected() {
        let mut f = Fixture::new(quiet_config());
        f.engine.register_device(test_device()).unwrap();

        assert!(matches!(
            f.engine.register_device(test_device()),
            Err(Error::AlreadyRegistered)
        ));
    }

    #[test]
    fn registry_full_rejected() {
        let mut f = Fixture::new(quiet_config());
        for i in 0..REGISTRY_CAPACITY {
            f.engine
                .register_device(Arc::new(DeviceDescriptor {
                    id: format!("dev{i}"),
                    udn: format!("uuid:{i}"),
                    device_type: "urn:foo:bar".to_string(),
                    description_template: "<root/>".to_string(),
                }))
                .unwrap();
        }

        assert!(matches!(
            f.engine.register_device(Arc::new(DeviceDescriptor {
                id: "one-too-many".to_string(),
                udn: "uuid:33".to_string(),
                device_type: "urn:foo:bar".to_string(),
                description_template: "<root/>".to_string(),
            })),
            Err(Error::OutOfResources)
        ));
    }

    #[test]
    fn deregister_says_byebye_everywhere() {
        let mut f =
            Fixture::with_interfaces(quiet_config(), &[IF_A, IF_B]);
        f.engine.register_device(test_device()).unwrap();

        f.engine.deregister_device("dev1").unwrap();

        for addr in [IF_A, IF_B] {
            assert!(f.stack.socket(addr).contains_sent(
                multicast_target(),
                |m| {
                    m.contains("NTS: ssdp:byebye\r\n")
                        && m.contains("USN: uuid:xyz::urn:foo:bar\r\n")
                }
            ));
        }
        assert!(f.engine.registered.is_empty());
    }

    #[test]
    fn deregister_unknown_rejected() {
        let mut f = Fixture::new(quiet_config());
        assert!(matches!(
            f.engine.deregister_device("nobody"),
            Err(Error::NotRegistered)
        ));
    }

    #[test]
    fn register_deregister_restores_state() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[IF_A]);

        f.engine.register_device(test_device()).unwrap();
        f.engine.deregister_device("dev1").unwrap();
        f.engine.tick(false);

        assert!(f.engine.registered.is_empty());
        // Only the byebye went out
        assert_eq!(f.stack.socket(IF_A).sent_count(), 1);
    }

    /* ==== Searching ==== */

    #[test]
    fn search_probe_sent_on_every_interface() {
        let mut f =
            Fixture::with_interfaces(quiet_config(), &[IF_A, IF_B]);

        f.engine.tick(true);

        for addr in [IF_A, IF_B] {
            assert!(f.stack.socket(addr).contains_sent(
                multicast_target(),
                |m| {
                    m.starts_with("M-SEARCH * HTTP/1.1\r\n")
                        && m.contains("ST: upnp:rootdevice\r\n")
                }
            ));
        }
    }

    /* ==== Interface churn and errors ==== */

    #[test]
    fn interface_refresh_respects_holdoff() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[IF_A]);

        // Address list changes, but the refresh deadline has not come
        f.stack.set_addresses(&[IF_A, IF_B]);
        MockClock::advance(Duration::from_secs(1));
        f.engine.tick(false);
        assert_eq!(f.engine.interfaces.len(), 1);

        MockClock::advance(Duration::from_secs(3));
        f.engine.tick(false);
        assert_eq!(f.engine.interfaces.len(), 2);
    }

    #[test]
    fn failed_bind_leaves_hole() {
        MockClock::set_time(Duration::ZERO);
        let stack = Rc::new(FakeStack::default());
        stack.refuse_bind(IF_A);
        stack.set_addresses(&[IF_A, IF_B]);
        let mut engine =
            Engine::with_stack(stack.clone(), quiet_config()).unwrap();

        engine.tick(false);

        assert_eq!(engine.interfaces.len(), 2);
        assert!(engine.interfaces[0].socket.is_none());
        assert!(engine.interfaces[1].socket.is_some());
    }

    #[test]
    fn permanent_receive_error_reconnects() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[]);
        assert_eq!(f.stack.multicast_sockets_created(), 1);

        f.stack
            .mcast()
            .fail_next_recv(io::ErrorKind::ConnectionAborted);
        f.engine.tick(false);
        assert_eq!(f.stack.multicast_sockets_created(), 1);

        f.engine.tick(false);
        assert_eq!(f.stack.multicast_sockets_created(), 2);
    }

    #[test]
    fn transient_receive_error_tolerated() {
        let mut f = Fixture::with_interfaces(quiet_config(), &[]);

        f.stack
            .mcast()
            .fail_next_recv(io::ErrorKind::Interrupted);
        f.engine.tick(false);
        f.engine.tick(false);

        assert_eq!(f.stack.multicast_sockets_created(), 1);
    }

    #[test]
    fn invalid_config_rejected() {
        MockClock::set_time(Duration::ZERO);
        let stack = Rc::new(FakeStack::default());
        let result = Engine::with_stack(
            stack,
            Config {
                max_age: 100,
                announce: true,
                announce_interval: 200,
            },
        );
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
