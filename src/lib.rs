//! An engine for SSDP, the Simple Service Discovery Protocol
//!
//! The ssdp-engine crate implements the discovery side of a UPnP-style
//! device: it advertises locally-registered _devices_ to peers on the
//! local network, learns about remote devices from their own
//! advertisements, answers directed search queries, and serves each
//! local device's description document over a small auxiliary HTTP
//! endpoint. The protocol itself is HTTP-over-UDP, addressed at the
//! link-local multicast group 239.255.255.250:1900.
//!
//! There is no Internet RFC for SSDP -- merely some expired drafts; the
//! protocol is documented in the UPnP Device Architecture documents.
//! This crate speaks the subset of it that device discovery needs:
//! `NOTIFY` with `ssdp:alive`/`ssdp:byebye`, `M-SEARCH`, and the
//! unicast `200 OK` search response.
//!
//! The central type is [`engine::Engine`]. It has no thread of its own:
//! the owner calls [`engine::Engine::tick`] periodically, and one tick
//! reconciles the per-interface socket set against the host's current
//! addresses, expires stale remote devices, re-announces local devices
//! whose per-interface deadline has elapsed, services the description
//! endpoint, and drains every readable socket. All sockets are
//! non-blocking; a tick never waits.
//!
//! ```no_run
//! use ssdp_engine::{Config, DeviceDescriptor, Engine};
//! use std::sync::Arc;
//!
//! let mut engine = Engine::new(Config::default())?;
//! engine.register_device(Arc::new(DeviceDescriptor {
//!     id: "fridge".to_string(),
//!     udn: "uuid:b2ba1d32-79b2-4bd7-94e4-b7c7d8a3f3f9".to_string(),
//!     device_type: "upnp:rootdevice".to_string(),
//!     description_template: "<root>${HTTP-HOST}</root>".to_string(),
//! }))?;
//! loop {
//!     engine.tick(false);
//!     std::thread::sleep(std::time::Duration::from_millis(250));
//! }
//! # Ok::<(), ssdp_engine::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// The engine itself: socket set, registry, cache, and dispatch
pub mod engine;

mod header;
mod httpd;
mod interfaces;
mod message;

/// Enumerating the host's IPv4 interface addresses
pub mod netif;

/// `${KEY}` template expansion with chained variable lookup
pub mod template;

/// Traits used to abstract over sockets and their construction
pub mod udp;

pub use engine::{DiscoveredDevice, Engine};

/// Description of a local device, supplied by the caller
///
/// Registration shares the descriptor with the engine (see
/// [`Engine::register_device`]); the caller may keep its own handle and
/// the descriptor outlives the registration either way. The engine
/// never mutates it.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Short ASCII identifier, unique per registration; forms the tail
    /// of the advertised LOCATION URL and selects the description
    /// document
    pub id: String,

    /// Globally-unique device name, e.g. "uuid:..."
    pub udn: String,

    /// Device type URI, matched against the ST header of incoming
    /// searches
    pub device_type: String,

    /// Description document body; `${HTTP-HOST}` expands to the Host
    /// header of the client fetching it
    pub description_template: String,
}

/// Engine lifecycle configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Advertised lease duration in seconds (the max-age of outgoing
    /// CACHE-CONTROL headers)
    pub max_age: u32,

    /// Whether registered devices are re-announced periodically
    pub announce: bool,

    /// Seconds between announcements, per device per interface; must
    /// not exceed `max_age`
    pub announce_interval: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_age: 1800,
            announce: true,
            announce_interval: 900,
        }
    }
}

/// The errors returned from engine operations
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// A device with this id is already registered
    AlreadyRegistered,

    /// No device with this id is registered
    NotRegistered,

    /// The registration table is full
    OutOfResources,

    /// Socket or HTTP endpoint setup failed, or the configuration is
    /// inconsistent
    Network(std::io::Error),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyRegistered => {
                f.write_str("device id already registered")
            }
            Self::NotRegistered => f.write_str("device id not registered"),
            Self::OutOfResources => f.write_str("registration table full"),
            Self::Network(_) => f.write_str("network setup failed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Network(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn default_config_is_consistent() {
        let c = Config::default();
        assert!(c.announce_interval <= c.max_age);
        assert!(c.announce);
    }

    #[test]
    fn can_debug() {
        let e = format!("{:?}", Error::AlreadyRegistered);
        assert_eq!(e, "AlreadyRegistered");
    }

    #[test]
    fn display_simple_errors() {
        assert_eq!(
            format!("{}", Error::AlreadyRegistered),
            "device id already registered"
        );
        assert_eq!(
            format!("{}", Error::NotRegistered),
            "device id not registered"
        );
        assert_eq!(
            format!("{}", Error::OutOfResources),
            "registration table full"
        );
        assert!(Error::OutOfResources.source().is_none());
    }

    #[test]
    fn network_error_has_source() {
        let e = Error::Network(std::io::Error::new(
            std::io::ErrorKind::Other,
            "injected",
        ));
        assert_eq!(format!("{e}"), "network setup failed");
        assert_eq!(format!("{}", e.source().unwrap()), "injected");
    }
}
