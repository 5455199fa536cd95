//! The description-document endpoint: a minimal cooperative HTTP
//! server, serviced once per engine tick.
//!
//! `GET /<anything>/<id>` returns the description document of the
//! registered device `<id>`, with `${HTTP-HOST}` replaced by the Host
//! header the client connected with. One response per connection,
//! then close.

use crate::engine::{hash64, RegisteredDevice};
use crate::header;
use crate::message::HttpHostVars;
use crate::template;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const MAX_CONNECTIONS: usize = 8;
const MAX_REQUEST: usize = 2048;
const MAX_HOST: usize = 64;
const DESCRIPTION_BUFFER: usize = 1024;
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    stream: TcpStream,
    data: Vec<u8>,
    opened_at: Instant,
}

pub(crate) struct DescriptionServer {
    listener: TcpListener,
    port: u16,
    http_host: String,
    connections: Vec<Connection>,
}

impl DescriptionServer {
    pub(crate) fn new() -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            0,
        ))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            http_host: String::new(),
            connections: Vec::new(),
        })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// One cooperative pass: accept, read, and answer whatever is
    /// ready. Never blocks.
    pub(crate) fn service(
        &mut self,
        devices: &HashMap<u64, RegisteredDevice>,
    ) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= MAX_CONNECTIONS {
                        warn!("description endpoint busy, dropping {peer}");
                        continue;
                    }
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    debug!("description connection from {peer}");
                    self.connections.push(Connection {
                        stream,
                        data: Vec::new(),
                        opened_at: Instant::now(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }

        let now = Instant::now();
        let mut index = 0;
        while index < self.connections.len() {
            if self.pump(index, devices, now) {
                self.connections.remove(index);
            } else {
                index += 1;
            }
        }
    }

    /// Returns true once the connection is finished with
    fn pump(
        &mut self,
        index: usize,
        devices: &HashMap<u64, RegisteredDevice>,
        now: Instant,
    ) -> bool {
        let conn = &mut self.connections[index];
        if now.duration_since(conn.opened_at) > IDLE_TIMEOUT {
            debug!("description connection timed out");
            return true;
        }

        let mut chunk = [0u8; 512];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => return true,
                Ok(n) => {
                    conn.data.extend_from_slice(&chunk[..n]);
                    if conn.data.len() > MAX_REQUEST {
                        warn!("oversized description request");
                        return true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return true,
            }
        }
        let Some(end) = header_end(&conn.data) else {
            return false;
        };

        let mut target = String::new();
        let mut host = None;
        let parsed = header::parse_request(
            &conn.data[..end],
            |_, path, _, _| target = path.to_string(),
            |key, value| {
                if key.eq_ignore_ascii_case("Host") {
                    host = Some(value.to_string());
                }
            },
        );

        if let Some(host) = host {
            set_http_host(&mut self.http_host, &host);
        }
        let (status, body) = match parsed {
            Ok(()) => respond(devices, &self.http_host, &target),
            Err(_) => (400, String::from("Bad request")),
        };
        write_response(&mut self.connections[index].stream, status, &body);
        true
    }
}

/// Copy the Host header value, minus any `:port` suffix
fn set_http_host(field: &mut String, value: &str) {
    let host = value.split(':').next().unwrap_or("");
    field.clear();
    field.extend(host.chars().take(MAX_HOST));
}

fn respond(
    devices: &HashMap<u64, RegisteredDevice>,
    http_host: &str,
    target: &str,
) -> (u16, String) {
    let Some((_, id)) = target.rsplit_once('/') else {
        return (400, String::from("Bad URL"));
    };
    let Some(device) = devices.get(&hash64(id)) else {
        return (404, String::from("Device not found"));
    };

    let mut buffer = [0u8; DESCRIPTION_BUFFER];
    match template::expand(
        &mut buffer,
        &device.desc.description_template,
        &[&HttpHostVars(http_host)],
    ) {
        Ok(n) => (200, String::from_utf8_lossy(&buffer[..n]).into_owned()),
        Err(e) => {
            error!("cannot format description document: {e}");
            (500, String::from("Internal error"))
        }
    }
}

fn write_response(stream: &mut TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let content_type = if status == 200 {
        "text/xml; charset=\"utf-8\""
    } else {
        "text/plain"
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\n\
Content-Type: {content_type}\r\n\
Content-Length: {}\r\n\
Connection: close\r\n\
\r\n",
        body.len()
    );
    let sent = stream
        .write_all(head.as_bytes())
        .and_then(|()| stream.write_all(body.as_bytes()));
    if sent.is_err() {
        debug!("description client went away");
    }
}

fn header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}
