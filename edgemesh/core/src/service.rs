use k8s_openapi::{
    api::core::v1::{Service, ServicePort},
    apimachinery::pkg::util::intstr::IntOrString,
};
use std::{fmt, str::FromStr};

/// Identifies a service by namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

/// The tag taken from a service port's name.
///
/// Only `http` (and `udp`, which is never proxied at L4) select the HTTP engine; every other tag
/// is proxied as raw TCP.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolTag {
    Http,
    Tcp,
    Websocket,
    Grpc,
    Https,
    Udp,
    Other(String),
}

/// The proxy engine that handles a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Engine {
    Http,
    Tcp,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetPort {
    Number(u16),
    Name(String),
}

/// A service port as seen by the data plane.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortDescriptor {
    pub tag: ProtocolTag,
    pub port: u16,
    pub target_port: TargetPort,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid service key {0:?}: expected <namespace>.<name>")]
pub struct InvalidServiceKey(String);

// === impl ServiceKey ===

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the key of a Kubernetes service, if it is named.
    pub fn from_service(svc: &Service) -> Option<Self> {
        let name = svc.metadata.name.clone()?;
        let namespace = svc
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        Some(Self { namespace, name })
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

impl FromStr for ServiceKey {
    type Err = InvalidServiceKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('.') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidServiceKey(s.to_string())),
        }
    }
}

// === impl ProtocolTag ===

impl ProtocolTag {
    /// Derives the tag from a port name: the text before the first `-`, so that `http-web` is
    /// tagged `http`. Unnamed ports are tagged `tcp`.
    pub fn from_port_name(name: Option<&str>) -> Self {
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => return Self::Tcp,
        };
        let prefix = name.split('-').next().unwrap_or(name);
        prefix.parse().unwrap_or_else(|never| match never {})
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Websocket => "websocket",
            Self::Grpc => "grpc",
            Self::Https => "https",
            Self::Udp => "udp",
            Self::Other(s) => s,
        }
    }

    pub fn engine(&self) -> Engine {
        match self {
            Self::Http | Self::Udp => Engine::Http,
            _ => Engine::Tcp,
        }
    }
}

impl FromStr for ProtocolTag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "http" => Self::Http,
            "tcp" => Self::Tcp,
            "websocket" => Self::Websocket,
            "grpc" => Self::Grpc,
            "https" => Self::Https,
            "udp" => Self::Udp,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl TargetPort ===

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(p) => write!(f, "{p}"),
            Self::Name(n) => f.write_str(n),
        }
    }
}

impl From<&str> for TargetPort {
    fn from(s: &str) -> Self {
        match s.parse::<u16>() {
            Ok(p) => Self::Number(p),
            Err(_) => Self::Name(s.to_string()),
        }
    }
}

// === impl PortDescriptor ===

impl PortDescriptor {
    pub fn new(tag: ProtocolTag, port: u16, target_port: TargetPort) -> Self {
        Self {
            tag,
            port,
            target_port,
        }
    }

    /// Converts a Kubernetes service port. Ports outside the `u16` range are rejected; a missing
    /// target port defaults to the service port.
    pub fn from_service_port(sp: &ServicePort) -> Option<Self> {
        let port = u16::try_from(sp.port).ok().filter(|p| *p != 0)?;
        let target_port = match &sp.target_port {
            None => TargetPort::Number(port),
            Some(IntOrString::Int(0)) => TargetPort::Number(port),
            Some(IntOrString::Int(p)) => TargetPort::Number(u16::try_from(*p).ok()?),
            Some(IntOrString::String(name)) => TargetPort::from(name.as_str()),
        };
        Some(Self {
            tag: ProtocolTag::from_port_name(sp.name.as_deref()),
            port,
            target_port,
        })
    }

    /// Returns the descriptors of all of a service's ports, in declaration order.
    pub fn all(svc: &Service) -> Vec<Self> {
        Self::filtered(svc, |_| true)
    }

    /// Returns the descriptors of a service's TCP ports, in declaration order.
    pub fn tcp(svc: &Service) -> Vec<Self> {
        Self::filtered(svc, |sp| {
            sp.protocol
                .as_deref()
                .map(|p| p.eq_ignore_ascii_case("TCP"))
                .unwrap_or(true)
        })
    }

    fn filtered(svc: &Service, keep: impl Fn(&ServicePort) -> bool) -> Vec<Self> {
        svc.spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .into_iter()
            .flatten()
            .filter(|sp| keep(sp))
            .filter_map(Self::from_service_port)
            .collect()
    }
}

/// Determines which engine serves a service, judged by its first port's tag. Services without
/// ports have no engine.
pub fn service_engine(svc: &Service) -> Option<Engine> {
    let first = svc.spec.as_ref()?.ports.as_ref()?.first()?;
    Some(ProtocolTag::from_port_name(first.name.as_deref()).engine())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn mk_port(name: Option<&str>, port: i32, target: Option<IntOrString>) -> ServicePort {
        ServicePort {
            name: name.map(Into::into),
            port,
            target_port: target,
            protocol: Some("TCP".into()),
            ..Default::default()
        }
    }

    #[test]
    fn service_key_text() {
        let key = ServiceKey::new("default", "web");
        assert_eq!(key.to_string(), "default.web");
        assert_eq!("default.web".parse::<ServiceKey>().unwrap(), key);
        assert!("web".parse::<ServiceKey>().is_err());
        assert!(".web".parse::<ServiceKey>().is_err());
        assert!("a.b.c".parse::<ServiceKey>().is_err());
    }

    #[test]
    fn tags_from_port_names() {
        assert_eq!(ProtocolTag::from_port_name(Some("http")), ProtocolTag::Http);
        assert_eq!(ProtocolTag::from_port_name(Some("http-web")), ProtocolTag::Http);
        assert_eq!(ProtocolTag::from_port_name(Some("grpc")), ProtocolTag::Grpc);
        assert_eq!(ProtocolTag::from_port_name(None), ProtocolTag::Tcp);
        assert_eq!(ProtocolTag::from_port_name(Some("")), ProtocolTag::Tcp);
        assert_eq!(
            ProtocolTag::from_port_name(Some("metrics")),
            ProtocolTag::Other("metrics".into())
        );
    }

    #[test]
    fn engines() {
        assert_eq!(ProtocolTag::Http.engine(), Engine::Http);
        assert_eq!(ProtocolTag::Udp.engine(), Engine::Http);
        for tag in [
            ProtocolTag::Tcp,
            ProtocolTag::Grpc,
            ProtocolTag::Https,
            ProtocolTag::Websocket,
            ProtocolTag::Other("redis".into()),
        ] {
            assert_eq!(tag.engine(), Engine::Tcp, "{tag}");
        }
    }

    #[test]
    fn descriptors_from_service() {
        let mut udp = mk_port(Some("dns"), 53, Some(IntOrString::Int(5353)));
        udp.protocol = Some("UDP".into());
        let svc = Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    mk_port(Some("tcp"), 80, Some(IntOrString::Int(8080))),
                    mk_port(None, 9000, None),
                    mk_port(Some("http-api"), 81, Some(IntOrString::String("api".into()))),
                    udp,
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let all = PortDescriptor::all(&svc);
        assert_eq!(all.len(), 4);
        assert_eq!(
            all[0],
            PortDescriptor::new(ProtocolTag::Tcp, 80, TargetPort::Number(8080))
        );
        assert_eq!(all[1].target_port, TargetPort::Number(9000));
        assert_eq!(all[2].target_port, TargetPort::Name("api".into()));

        let tcp = PortDescriptor::tcp(&svc);
        assert_eq!(tcp.len(), 3);
        assert!(tcp.iter().all(|p| p.port != 53));

        assert_eq!(service_engine(&svc), Some(Engine::Tcp));
        assert_eq!(service_engine(&Service::default()), None);
    }
}
