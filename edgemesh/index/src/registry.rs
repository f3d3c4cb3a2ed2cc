use crate::allocator::{FakeIpPool, PoolStats};
use ahash::AHashMap as HashMap;
use edgemesh_core::{EncodedPorts, MetaClient, PortDescriptor, ServiceKey};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::{net::Ipv4Addr, sync::Arc};
use tracing::{debug, info, warn};

/// Starts and stops the accept loops of backends that listen on each synthetic `ip:port`.
pub trait PortListeners: Send + Sync {
    /// Starts serving `port` on `ip`, replacing any listener already serving that port.
    fn start(&self, key: &ServiceKey, ip: Ipv4Addr, port: &PortDescriptor);

    fn stop(&self, ip: Ipv4Addr, port: u16);
}

/// Used when all intercepted traffic arrives on a single shared listener.
#[derive(Copy, Clone, Debug, Default)]
pub struct SharedListener;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("synthetic IP pool is exhausted")]
    AllocatorExhausted,
}

/// The bidirectional mapping between services and their synthetic IPs.
///
/// Writers (`bind`, `rebind`, `unbind`, `restore`) serialize on a single exclusive lock, under
/// which the IP pool and both indexes are mutated. The lock is downgraded before a listener
/// record is persisted, so lookups proceed during store I/O while other writers still wait.
/// Readers never observe a partially applied update.
pub struct Registry {
    inner: RwLock<Inner>,
    meta: Arc<dyn MetaClient>,
    listeners: Arc<dyn PortListeners>,
}

pub type SharedRegistry = Arc<Registry>;

/// A service's registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub key: ServiceKey,
    pub ip: Ipv4Addr,
    pub ports: Vec<PortDescriptor>,
    pub encoded: EncodedPorts,
}

/// The outcome of [`Registry::rebind`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rebound {
    pub ip: Ipv4Addr,
    /// True when the service's port descriptors differ from those previously bound.
    pub ports_changed: bool,
}

struct Inner {
    pool: FakeIpPool,
    ip_by_key: HashMap<ServiceKey, Ipv4Addr>,
    by_ip: HashMap<Ipv4Addr, Binding>,
}

// === impl SharedListener ===

impl PortListeners for SharedListener {
    fn start(&self, _: &ServiceKey, _: Ipv4Addr, _: &PortDescriptor) {}

    fn stop(&self, _: Ipv4Addr, _: u16) {}
}

// === impl Registry ===

impl Registry {
    pub fn new(
        pool: FakeIpPool,
        meta: Arc<dyn MetaClient>,
        listeners: Arc<dyn PortListeners>,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                pool,
                ip_by_key: HashMap::default(),
                by_ip: HashMap::default(),
            }),
            meta,
            listeners,
        }
    }

    pub fn shared(
        pool: FakeIpPool,
        meta: Arc<dyn MetaClient>,
        listeners: Arc<dyn PortListeners>,
    ) -> SharedRegistry {
        Arc::new(Self::new(pool, meta, listeners))
    }

    /// Binds a service to a synthetic IP, allocating and persisting one if the service is not yet
    /// bound. A bound service has its ports replaced.
    pub fn bind(&self, key: &ServiceKey, ports: Vec<PortDescriptor>) -> Result<Ipv4Addr, BindError> {
        let mut inner = self.inner.write();
        if let Some(ip) = inner.ip_by_key.get(key).copied() {
            self.update_ports(&mut inner, ip, ports);
            return Ok(ip);
        }

        let ip = inner.pool.acquire().ok_or(BindError::AllocatorExhausted)?;
        self.install(&mut inner, key.clone(), ip, ports);
        let _persisting = RwLockWriteGuard::downgrade(inner);
        if let Err(error) = self.meta.listener().add(key, ip) {
            warn!(%key, %ip, %error, "Failed to persist listener record");
        }
        info!(%key, %ip, "Bound service");
        Ok(ip)
    }

    /// Like [`Registry::bind`], but reports whether the port descriptors changed. Listeners are
    /// stopped for removed ports and (re)started for added ports and for ports whose protocol or
    /// target changed.
    pub fn rebind(&self, key: &ServiceKey, ports: Vec<PortDescriptor>) -> Result<Rebound, BindError> {
        let mut inner = self.inner.write();
        match inner.ip_by_key.get(key).copied() {
            Some(ip) => {
                let ports_changed = self.update_ports(&mut inner, ip, ports);
                Ok(Rebound { ip, ports_changed })
            }
            None => {
                drop(inner);
                let ip = self.bind(key, ports)?;
                Ok(Rebound {
                    ip,
                    ports_changed: true,
                })
            }
        }
    }

    /// Removes a service's binding, deletes its listener record, and recycles its IP.
    pub fn unbind(&self, key: &ServiceKey) -> Option<Ipv4Addr> {
        let mut inner = self.inner.write();
        let ip = inner.ip_by_key.remove(key)?;
        if let Some(binding) = inner.by_ip.remove(&ip) {
            for p in &binding.ports {
                self.listeners.stop(ip, p.port);
            }
        }
        inner.pool.release(ip);
        let _persisting = RwLockWriteGuard::downgrade(inner);
        if let Err(error) = self.meta.listener().del(key) {
            warn!(%key, %ip, %error, "Failed to delete listener record");
        }
        info!(%key, %ip, "Unbound service");
        Some(ip)
    }

    /// Reinstates a binding recorded before a restart without persisting it again.
    ///
    /// If the recorded address cannot be reinstated (it lies outside the subnet or is already
    /// bound to another service) a fresh address is bound instead.
    pub fn restore(
        &self,
        key: &ServiceKey,
        ip: Ipv4Addr,
        ports: Vec<PortDescriptor>,
    ) -> Result<Ipv4Addr, BindError> {
        let mut inner = self.inner.write();
        if let Some(bound) = inner.ip_by_key.get(key).copied() {
            self.update_ports(&mut inner, bound, ports);
            return Ok(bound);
        }
        if inner.by_ip.contains_key(&ip) || !inner.pool.reserve(ip) {
            warn!(%key, %ip, "Listener record cannot be restored; binding a new address");
            drop(inner);
            return self.bind(key, ports);
        }
        self.install(&mut inner, key.clone(), ip, ports);
        info!(%key, %ip, "Restored service binding");
        Ok(ip)
    }

    /// Reserves a recorded address without binding it.
    pub fn reserve(&self, ip: Ipv4Addr) -> bool {
        self.inner.write().pool.reserve(ip)
    }

    pub fn lookup_ip(&self, key: &ServiceKey) -> Option<Ipv4Addr> {
        self.inner.read().ip_by_key.get(key).copied()
    }

    pub fn lookup_ports(&self, ip: Ipv4Addr) -> Option<EncodedPorts> {
        self.inner.read().by_ip.get(&ip).map(|b| b.encoded.clone())
    }

    pub fn binding(&self, ip: Ipv4Addr) -> Option<Binding> {
        self.inner.read().by_ip.get(&ip).cloned()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.inner.read().by_ip.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.read().pool.stats()
    }

    pub fn is_free(&self, ip: Ipv4Addr) -> bool {
        self.inner.read().pool.is_free(ip)
    }

    fn install(&self, inner: &mut Inner, key: ServiceKey, ip: Ipv4Addr, ports: Vec<PortDescriptor>) {
        for p in &ports {
            self.listeners.start(&key, ip, p);
        }
        let encoded = EncodedPorts::encode(&key, &ports);
        inner.ip_by_key.insert(key.clone(), ip);
        inner.by_ip.insert(
            ip,
            Binding {
                key,
                ip,
                ports,
                encoded,
            },
        );
    }

    /// Replaces a bound service's ports, returning whether they changed.
    fn update_ports(&self, inner: &mut Inner, ip: Ipv4Addr, ports: Vec<PortDescriptor>) -> bool {
        let binding = match inner.by_ip.get_mut(&ip) {
            Some(binding) => binding,
            None => return false,
        };
        if binding.ports == ports {
            return false;
        }

        for old in binding.ports.iter().filter(|o| !ports.iter().any(|p| p.port == o.port)) {
            self.listeners.stop(ip, old.port);
        }
        for new in ports.iter().filter(|p| !binding.ports.contains(p)) {
            self.listeners.start(&binding.key, ip, new);
        }

        debug!(key = %binding.key, %ip, "Updated service ports");
        binding.encoded = EncodedPorts::encode(&binding.key, &ports);
        binding.ports = ports;
        true
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("subnet", &inner.pool.subnet())
            .field("bindings", &inner.by_ip.len())
            .finish()
    }
}
