//! Advertise one demo device and print what else is on the network.
//!
//! Run with `cargo run --example advertise`, then watch it answer
//! searches from any UPnP control point on the LAN.

use ssdp_engine::{Config, DeviceDescriptor, Engine};
use std::sync::Arc;
use std::time::Duration;

const DESCRIPTION: &str = "<?xml version=\"1.0\"?>\
<root xmlns=\"urn:schemas-upnp-org:device-1-0\">\
<device>\
<deviceType>upnp:rootdevice</deviceType>\
<friendlyName>ssdp-engine demo</friendlyName>\
<UDN>uuid:f402cb68-04cb-4c77-a061-886da4eee8a1</UDN>\
<presentationURL>http://${HTTP-HOST}/</presentationURL>\
</device>\
</root>";

fn main() {
    tracing_subscriber::fmt::init();

    let mut engine = Engine::new(Config {
        max_age: 1800,
        announce: true,
        announce_interval: 30,
    })
    .expect("engine setup");
    engine
        .register_device(Arc::new(DeviceDescriptor {
            id: "demo".to_string(),
            udn: "uuid:f402cb68-04cb-4c77-a061-886da4eee8a1".to_string(),
            device_type: "upnp:rootdevice".to_string(),
            description_template: DESCRIPTION.to_string(),
        }))
        .expect("register");
    println!("description documents on port {}", engine.http_port());

    let mut ticks = 0u32;
    loop {
        engine.tick(ticks % 40 == 0);
        if ticks % 40 == 0 {
            let mut seen = Vec::new();
            engine.iterate_discovered(|d| seen.push(d.usn.clone()));
            seen.sort();
            println!("{} devices known", seen.len());
            for usn in seen {
                println!("  {usn}");
            }
        }
        ticks += 1;
        std::thread::sleep(Duration::from_millis(250));
    }
}
