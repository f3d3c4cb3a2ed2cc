use crate::service::ServiceKey;
use anyhow::{bail, Context, Result};
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::{fmt, net::Ipv4Addr, str::FromStr};

/// Read access to the node-local object store.
///
/// The data plane never writes services or pods; the only writes go through the
/// [`ListenerStore`] returned by [`MetaClient::listener`].
#[async_trait::async_trait]
pub trait MetaClient: Send + Sync {
    async fn get_service(&self, key: &ServiceKey) -> Result<Option<Service>>;

    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Returns the pods backing a service.
    async fn get_pods(&self, key: &ServiceKey) -> Result<Vec<Pod>>;

    fn listener(&self) -> &dyn ListenerStore;

    /// Subscribes to change events. Implementations may only support a single subscriber.
    fn subscribe(&self) -> BoxStream<'static, Message>;
}

/// Persists the synthetic IP assigned to each service.
///
/// At most one record exists per service key.
pub trait ListenerStore: Send + Sync {
    fn add(&self, key: &ServiceKey, ip: Ipv4Addr) -> Result<()>;

    fn get(&self, key: &ServiceKey) -> Result<Option<Ipv4Addr>>;

    fn del(&self, key: &ServiceKey) -> Result<()>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    ServiceList,
    PodList,
    Other(String),
}

/// A parsed `namespace/kind/name` resource path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
}

/// A change event emitted by the object store.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub operation: String,
    pub resource: String,
    pub content: serde_json::Value,
}

// === impl Operation ===

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            s => bail!("unknown operation {s:?}"),
        }
    }
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ResourceKind ===

impl From<&str> for ResourceKind {
    fn from(s: &str) -> Self {
        match s {
            "service" => Self::Service,
            "servicelist" => Self::ServiceList,
            "podlist" => Self::PodList,
            s => Self::Other(s.to_string()),
        }
    }
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Service => "service",
            Self::ServiceList => "servicelist",
            Self::PodList => "podlist",
            Self::Other(s) => s,
        }
    }
}

// === impl ResourcePath ===

impl ResourcePath {
    /// Parses `namespace/kind/name` or `namespace/<any>/namespace/kind/name` paths.
    pub fn parse(resource: &str) -> Option<Self> {
        let parts = resource.split('/').collect::<Vec<_>>();
        let (namespace, kind, name) = match parts.as_slice() {
            [ns, kind, name] => (ns, kind, name),
            [_, _, ns, kind, name] => (ns, kind, name),
            _ => return None,
        };
        Some(Self {
            namespace: namespace.to_string(),
            kind: ResourceKind::from(*kind),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind.as_str(), self.name)
    }
}

// === impl Message ===

impl Message {
    pub fn new(op: Operation, resource: impl ToString, content: serde_json::Value) -> Self {
        Self {
            operation: op.as_str().to_string(),
            resource: resource.to_string(),
            content,
        }
    }

    pub fn service(op: Operation, svc: &Service) -> Result<Self> {
        let key = ServiceKey::from_service(svc).context("service must be named")?;
        let path = format!("{}/service/{}", key.namespace, key.name);
        Ok(Self::new(op, path, serde_json::to_value(svc)?))
    }

    pub fn pod_list(op: Operation, key: &ServiceKey, pods: &[Pod]) -> Result<Self> {
        let path = format!("{}/podlist/{}", key.namespace, key.name);
        Ok(Self::new(op, path, serde_json::to_value(pods)?))
    }

    /// Decodes the services carried by a `service` or `servicelist` message.
    pub fn services(&self, kind: &ResourceKind) -> Result<Vec<Service>> {
        match kind {
            ResourceKind::Service => Ok(vec![serde_json::from_value(self.content.clone())
                .context("decoding service")?]),
            ResourceKind::ServiceList => {
                serde_json::from_value(self.content.clone()).context("decoding service list")
            }
            kind => bail!("{} messages do not carry services", kind.as_str()),
        }
    }

    pub fn pods(&self) -> Result<Vec<Pod>> {
        serde_json::from_value(self.content.clone()).context("decoding pod list")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_paths() {
        let p = ResourcePath::parse("default/service/web").unwrap();
        assert_eq!(p.namespace, "default");
        assert_eq!(p.kind, ResourceKind::Service);
        assert_eq!(p.name, "web");

        let p = ResourcePath::parse("node/edge-0/ns1/podlist/web").unwrap();
        assert_eq!(p.namespace, "ns1");
        assert_eq!(p.kind, ResourceKind::PodList);
        assert_eq!(p.name, "web");

        assert!(ResourcePath::parse("default/service").is_none());
        assert!(ResourcePath::parse("a/b/c/d").is_none());
    }

    #[test]
    fn parses_operations() {
        assert_eq!("insert".parse::<Operation>().unwrap(), Operation::Insert);
        assert_eq!("update".parse::<Operation>().unwrap(), Operation::Update);
        assert_eq!("delete".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn decodes_service_messages() {
        let svc = Service {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                namespace: Some("default".into()),
                name: Some("web".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let msg = Message::service(Operation::Insert, &svc).unwrap();
        assert_eq!(msg.resource, "default/service/web");
        let path = ResourcePath::parse(&msg.resource).unwrap();
        let svcs = msg.services(&path.kind).unwrap();
        assert_eq!(svcs, vec![svc]);
        assert!(msg.services(&ResourceKind::PodList).is_err());
    }
}
