use crate::{
    listeners::DeviceListeners,
    pump::{service_ports, EventPump},
};
use anyhow::Result;
use edgemesh_core::{LbStrategy, MetaClient, PortDescriptor, ServiceKey, SessionConfig};
use edgemesh_host::{NetworkBackend, ResolverOverlay};
use edgemesh_index::{FakeIpPool, ObjectCache, PortListeners, Registry};
use edgemesh_proxy::{LoadBalancer, Proxy};
use std::{net::Ipv4Addr, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// The node's data plane: the service registry and everything that serves traffic from it.
#[derive(Clone)]
pub struct DataPlane {
    pub meta: Arc<dyn MetaClient>,
    pub registry: Arc<Registry>,
    pub cache: Arc<ObjectCache>,
    pub lb: Arc<LoadBalancer>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub cache_capacity: usize,
    pub strategy: LbStrategy,
    pub session: SessionConfig,
}

/// The outcome of [`DataPlane::replay`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Replayed {
    pub restored: usize,
    pub bound: usize,
    pub failed: usize,
}

// === impl DataPlane ===

impl DataPlane {
    /// Builds the data plane. `listeners` creates the per-address accept loops from the proxy
    /// that serves them.
    pub fn new(
        meta: Arc<dyn MetaClient>,
        pool: FakeIpPool,
        config: Config,
        listeners: impl FnOnce(Proxy) -> Arc<dyn PortListeners>,
    ) -> Self {
        let cache = Arc::new(ObjectCache::new(config.cache_capacity));
        let lb = Arc::new(LoadBalancer::new(
            meta.clone(),
            cache.clone(),
            config.strategy,
            config.session,
        ));
        let registry = Registry::shared(pool, meta.clone(), listeners(Proxy::new(lb.clone())));
        Self {
            meta,
            registry,
            cache,
            lb,
        }
    }

    pub fn proxy(&self) -> Proxy {
        Proxy::new(self.lb.clone())
    }

    pub fn event_pump(&self) -> EventPump {
        EventPump::new(self.registry.clone(), self.cache.clone(), self.lb.clone())
    }

    /// Rebuilds the registry from the services known at startup.
    ///
    /// Every recorded address is reserved before anything is bound, so a service without a
    /// record never takes an address that another service's record still owns.
    pub async fn replay(&self) -> Result<Replayed> {
        let services = self.meta.list_services().await?;

        let mut recorded = Vec::<(ServiceKey, Ipv4Addr, Vec<PortDescriptor>)>::new();
        let mut fresh = Vec::<(ServiceKey, Vec<PortDescriptor>)>::new();
        for svc in &services {
            let Some(key) = ServiceKey::from_service(svc) else {
                continue;
            };
            let ports = service_ports(svc);
            if ports.is_empty() {
                continue;
            }
            match self.meta.listener().get(&key) {
                Ok(Some(ip)) => recorded.push((key, ip, ports)),
                Ok(None) => fresh.push((key, ports)),
                Err(error) => {
                    warn!(%key, %error, "Failed to read listener record");
                    fresh.push((key, ports));
                }
            }
        }

        for (key, ip, _) in &recorded {
            if !self.registry.reserve(*ip) {
                debug!(%key, %ip, "Recorded address is outside the synthetic subnet");
            }
        }

        let mut replayed = Replayed::default();
        for (key, ip, ports) in recorded {
            match self.registry.restore(&key, ip, ports) {
                Ok(_) => replayed.restored += 1,
                Err(error) => {
                    warn!(%key, %error, "Failed to restore service");
                    replayed.failed += 1;
                }
            }
        }
        for (key, ports) in fresh {
            match self.registry.bind(&key, ports) {
                Ok(_) => replayed.bound += 1,
                Err(error) => {
                    warn!(%key, %error, "Failed to bind service");
                    replayed.failed += 1;
                }
            }
        }
        info!(
            restored = replayed.restored,
            bound = replayed.bound,
            failed = replayed.failed,
            "Replayed services"
        );
        Ok(replayed)
    }
}

impl std::fmt::Debug for DataPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPlane")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("lb", &self.lb)
            .finish_non_exhaustive()
    }
}

/// Re-asserts host state every [`RECONCILE_INTERVAL`] until shutdown, then removes it.
pub async fn reconcile(
    backend: Arc<dyn NetworkBackend>,
    resolver: Arc<ResolverOverlay>,
    interval: Duration,
    drain: drain::Watch,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; host state was just programmed.
    ticks.tick().await;

    let signaled = drain.signaled();
    tokio::pin!(signaled);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if let Err(error) = backend.reconcile().await {
                    warn!(%error, "Failed to reconcile host network");
                }
                if let Err(error) = resolver.ensure().await {
                    warn!(%error, path = %resolver.path().display(), "Failed to reconcile resolver configuration");
                }
            }
            handle = &mut signaled => {
                handle.release_after(cleanup(&*backend, &resolver)).await;
                return;
            }
        }
    }
}

/// Removes the host state installed for the data plane.
pub async fn cleanup(backend: &dyn NetworkBackend, resolver: &ResolverOverlay) {
    if let Err(error) = backend.cleanup().await {
        warn!(%error, "Failed to clean up host network");
    }
    if let Err(error) = resolver.restore().await {
        warn!(%error, path = %resolver.path().display(), "Failed to restore resolver configuration");
    }
    info!("Cleaned up host state");
}

/// Tears the data plane down in stages once `drain` is signaled.
///
/// The event pump is awaited first so that no binding changes while host state is removed.
/// The `host` stage (see [`reconcile`]) is drained next. The `serving` stage, which holds the
/// accept loops and the DNS responder, is drained last, so connections keep being served until
/// the host no longer steers traffic to them.
pub async fn shutdown(
    drain: drain::Watch,
    pump: JoinHandle<()>,
    host: drain::Signal,
    serving: drain::Signal,
    listeners: Option<Arc<DeviceListeners>>,
) {
    let release = drain.signaled().await;
    release
        .release_after(async move {
            if let Err(error) = pump.await {
                warn!(%error, "Event pump failed");
            }
            debug!("Removing host state");
            host.drain().await;
            if let Some(listeners) = listeners {
                listeners.close();
            }
            debug!("Draining listeners");
            serving.drain().await;
            info!("Shut down");
        })
        .await;
}
