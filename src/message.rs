use crate::template::{self, Vars};
use crate::DeviceDescriptor;
use std::borrow::Cow;
use std::net::Ipv4Addr;

pub(crate) const ALIVE: &str = concat!(
    "NOTIFY * HTTP/1.1\r\n",
    "SERVER: UPnP/1.0 ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "\r\n",
    "CACHE-CONTROL: max-age=${MAX_AGE}\r\n",
    "HOST: 239.255.255.250:1900\r\n",
    "LOCATION: http://${HOSTNAME}:${HTTPPORT}/${ID}\r\n",
    "NTS: ssdp:alive\r\n",
    "NT: ${NT}\r\n",
    "USN: ${UDN}::${DEVICE_TYPE}\r\n",
    "\r\n",
);

pub(crate) const BYEBYE: &str = concat!(
    "NOTIFY * HTTP/1.1\r\n",
    "SERVER: UPnP/1.0 ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "\r\n",
    "HOST: 239.255.255.250:1900\r\n",
    "NTS: ssdp:byebye\r\n",
    "NT: ${NT}\r\n",
    "USN: ${UDN}::${DEVICE_TYPE}\r\n",
    "\r\n",
);

pub(crate) const SEARCH_RESULT: &str = concat!(
    "HTTP/1.1 200 OK\r\n",
    "SERVER: UPnP/1.0 ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "\r\n",
    "CACHE-CONTROL: max-age=${MAX_AGE}\r\n",
    "LOCATION: http://${HOSTNAME}:${HTTPPORT}/${ID}\r\n",
    "ST: ${ST}\r\n",
    "EXT:\r\n",
    "USN: ${UDN}::${DEVICE_TYPE}\r\n",
    "Content-Length: 0\r\n",
    "\r\n",
);

pub(crate) const M_SEARCH: &str = concat!(
    "M-SEARCH * HTTP/1.1\r\n",
    "SERVER: UPnP/1.0 ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "\r\n",
    "HOST: 239.255.255.250:1900\r\n",
    "MAN: \"ssdp:discover\"\r\n",
    "MX: 3\r\n",
    "ST: upnp:rootdevice\r\n",
    "\r\n",
);

/// `HOSTNAME` = the dotted-quad form of one local interface address
pub(crate) struct IfAddrVars(pub Ipv4Addr);

impl Vars for IfAddrVars {
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        (key == "HOSTNAME").then(|| Cow::Owned(self.0.to_string()))
    }
}

/// `HTTPPORT` and `MAX_AGE`, pre-rendered by the engine
pub(crate) struct EngineVars<'a> {
    pub http_port: &'a str,
    pub max_age: &'a str,
}

impl Vars for EngineVars<'_> {
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        match key {
            "HTTPPORT" => Some(Cow::Borrowed(self.http_port)),
            "MAX_AGE" => Some(Cow::Borrowed(self.max_age)),
            _ => None,
        }
    }
}

/// The registered device being spoken about
pub(crate) struct DeviceVars<'a>(pub &'a DeviceDescriptor);

impl Vars for DeviceVars<'_> {
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        match key {
            "UDN" => Some(Cow::Borrowed(self.0.udn.as_str())),
            "NT" | "DEVICE_TYPE" => {
                Some(Cow::Borrowed(self.0.device_type.as_str()))
            }
            "ID" => Some(Cow::Borrowed(self.0.id.as_str())),
            _ => None,
        }
    }
}

/// `ST` echoed from the search being answered
pub(crate) struct SearchVars<'a> {
    pub st: &'a str,
}

impl Vars for SearchVars<'_> {
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        (key == "ST").then_some(Cow::Borrowed(self.st))
    }
}

/// `HTTP-HOST` captured from the current description request
pub(crate) struct HttpHostVars<'a>(pub &'a str);

impl Vars for HttpHostVars<'_> {
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        (key == "HTTP-HOST").then_some(Cow::Borrowed(self.0))
    }
}

pub(crate) fn build_alive(
    buf: &mut [u8],
    device: &DeviceDescriptor,
    addr: Ipv4Addr,
    globals: &EngineVars,
) -> Result<usize, template::Error> {
    template::expand(
        buf,
        ALIVE,
        &[&IfAddrVars(addr), globals, &DeviceVars(device)],
    )
}

pub(crate) fn build_byebye(
    buf: &mut [u8],
    device: &DeviceDescriptor,
) -> Result<usize, template::Error> {
    template::expand(buf, BYEBYE, &[&DeviceVars(device)])
}

pub(crate) fn build_search_result(
    buf: &mut [u8],
    device: &DeviceDescriptor,
    st: &str,
    addr: Ipv4Addr,
    globals: &EngineVars,
) -> Result<usize, template::Error> {
    template::expand(
        buf,
        SEARCH_RESULT,
        &[
            &IfAddrVars(addr),
            globals,
            &SearchVars { st },
            &DeviceVars(device),
        ],
    )
}
