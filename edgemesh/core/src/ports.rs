use crate::service::{PortDescriptor, ProtocolTag, ServiceKey, TargetPort};
use std::fmt;

/// The canonical textual encoding of a service's ports.
///
/// Each port is encoded as `tag,port,targetPort` and terminated by `|`; the owning service key
/// (`namespace.name`) follows the last port:
///
/// ```text
/// tcp,80,8080|http,81,8081|default.web
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EncodedPorts(String);

impl EncodedPorts {
    pub fn encode(key: &ServiceKey, ports: &[PortDescriptor]) -> Self {
        let mut s = String::new();
        for p in ports {
            s.push_str(&format!("{},{},{}|", p.tag, p.port, p.target_port));
        }
        s.push_str(&key.to_string());
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the owning service key.
    pub fn service(&self) -> Option<ServiceKey> {
        self.0.rsplit('|').next()?.parse().ok()
    }

    /// Decodes every port descriptor. Malformed entries are skipped.
    pub fn ports(&self) -> Vec<PortDescriptor> {
        let mut entries = self.0.split('|').collect::<Vec<_>>();
        // The last entry is the service key.
        entries.pop();
        entries.into_iter().filter_map(decode_entry).collect()
    }

    /// Finds the port descriptor whose listen port is exactly `port`, together with the owning
    /// service. Entries are searched in registry order.
    pub fn find(&self, port: u16) -> Option<(ServiceKey, PortDescriptor)> {
        let key = self.service()?;
        let desc = self.ports().into_iter().find(|p| p.port == port)?;
        Some((key, desc))
    }
}

impl fmt::Display for EncodedPorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EncodedPorts {
    fn from(s: String) -> Self {
        Self(s)
    }
}

fn decode_entry(entry: &str) -> Option<PortDescriptor> {
    let mut parts = entry.split(',');
    let tag = parts.next()?.parse::<ProtocolTag>().ok()?;
    let port = parts.next()?.parse::<u16>().ok()?;
    let target = TargetPort::from(parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    Some(PortDescriptor::new(tag, port, target))
}
