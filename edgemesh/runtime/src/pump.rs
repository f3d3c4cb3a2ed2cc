use anyhow::{Context, Result};
use edgemesh_core::{
    service::service_engine, Engine, Message, Operation, PortDescriptor, ResourceKind,
    ResourcePath, Service, ServiceKey,
};
use edgemesh_index::{ObjectCache, Registry};
use edgemesh_proxy::LoadBalancer;
use futures::prelude::*;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Applies object-store change events to the service registry and the object cache.
#[derive(Clone, Debug)]
pub struct EventPump {
    registry: Arc<Registry>,
    cache: Arc<ObjectCache>,
    lb: Arc<LoadBalancer>,
}

/// The ports a service is bound with: all of them for the HTTP engine, only TCP ports for the
/// raw TCP engine. An empty list means the service is not proxied.
pub fn service_ports(svc: &Service) -> Vec<PortDescriptor> {
    match service_engine(svc) {
        Some(Engine::Http) => PortDescriptor::all(svc),
        Some(Engine::Tcp) => PortDescriptor::tcp(svc),
        None => Vec::new(),
    }
}

// === impl EventPump ===

impl EventPump {
    pub fn new(registry: Arc<Registry>, cache: Arc<ObjectCache>, lb: Arc<LoadBalancer>) -> Self {
        Self {
            registry,
            cache,
            lb,
        }
    }

    /// Applies events until the stream ends or the process shuts down.
    pub async fn run(self, events: impl Stream<Item = Message> + Send, drain: drain::Watch) {
        tokio::pin!(events);
        let signaled = drain.signaled();
        tokio::pin!(signaled);
        loop {
            tokio::select! {
                msg = events.next() => match msg {
                    Some(msg) => self.handle(&msg),
                    None => {
                        info!("Event stream ended");
                        return;
                    }
                },
                _ = &mut signaled => {
                    debug!("Event pump shutting down");
                    return;
                }
            }
        }
    }

    /// Applies a single event. Malformed events are logged and dropped.
    pub fn handle(&self, msg: &Message) {
        if let Err(error) = self.try_handle(msg) {
            warn!(resource = %msg.resource, operation = %msg.operation, %error, "Dropping event");
        }
    }

    fn try_handle(&self, msg: &Message) -> Result<()> {
        let path = ResourcePath::parse(&msg.resource).context("invalid resource path")?;
        let op = msg.operation.parse::<Operation>()?;
        trace!(resource = %path, %op, "Event");
        match &path.kind {
            ResourceKind::Service | ResourceKind::ServiceList => {
                for svc in msg.services(&path.kind)? {
                    self.apply_service(op, svc);
                }
            }
            ResourceKind::PodList => {
                let key = ServiceKey::new(path.namespace, path.name);
                match op {
                    Operation::Delete => self.cache.remove_pods(&key),
                    Operation::Insert | Operation::Update => self.cache.add_pods(key, msg.pods()?),
                }
            }
            ResourceKind::Other(kind) => trace!(%kind, "Ignoring event"),
        }
        Ok(())
    }

    fn apply_service(&self, op: Operation, svc: Service) {
        let Some(key) = ServiceKey::from_service(&svc) else {
            debug!("Ignoring unnamed service");
            return;
        };
        let ports = service_ports(&svc);

        if op == Operation::Delete || ports.is_empty() {
            self.cache.remove_service(&key);
            if self.registry.unbind(&key).is_some() {
                self.lb.reset(&key);
            }
            return;
        }

        self.cache.add_service(key.clone(), svc);
        let res = match op {
            Operation::Insert => self.registry.bind(&key, ports).map(|_| ()),
            _ => self.registry.rebind(&key, ports).map(|rebound| {
                if rebound.ports_changed {
                    self.lb.reset(&key);
                }
            }),
        };
        if let Err(error) = res {
            warn!(%key, %error, "Failed to bind service");
        }
    }
}
