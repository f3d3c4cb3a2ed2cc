use ahash::AHashMap as HashMap;
use edgemesh_core::{
    LbStrategy, MetaClient, Pod, PortDescriptor, Service, ServiceKey, SessionConfig, TargetPort,
};
use edgemesh_index::ObjectCache;
use parking_lot::Mutex;
use rand::Rng;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Chooses one ready pod of a service for each connection.
pub struct LoadBalancer {
    meta: Arc<dyn MetaClient>,
    cache: Arc<ObjectCache>,
    strategy: LbStrategy,
    session: SessionConfig,
    state: Mutex<HashMap<ServiceKey, Balance>>,
}

/// The pod chosen for a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub addr: SocketAddr,
    pub pod: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LbError {
    #[error("service {0} not found")]
    ServiceNotFound(ServiceKey),

    #[error("service {0} has no port {1}")]
    PortNotFound(ServiceKey, u16),

    #[error("service {0} has no ready backends")]
    NoReadyBackends(ServiceKey),
}

/// Per-service balancing state.
#[derive(Debug, Default)]
struct Balance {
    next: usize,
    sessions: HashMap<String, Session>,
}

#[derive(Debug)]
struct Session {
    pod: String,
    expires: Instant,
    failures: u32,
}

/// A running pod that can be dialed.
struct Candidate<'p> {
    name: String,
    host_ip: IpAddr,
    pod: &'p Pod,
}

// === impl LoadBalancer ===

impl LoadBalancer {
    pub fn new(
        meta: Arc<dyn MetaClient>,
        cache: Arc<ObjectCache>,
        strategy: LbStrategy,
        session: SessionConfig,
    ) -> Self {
        Self {
            meta,
            cache,
            strategy,
            session,
            state: Mutex::new(HashMap::default()),
        }
    }

    pub fn strategy(&self) -> LbStrategy {
        self.strategy
    }

    /// Picks a backend for a connection to `listen_port` of a service.
    ///
    /// `session` identifies the caller for [`LbStrategy::SessionStickiness`]; it is ignored by
    /// the other strategies.
    pub async fn pick(
        &self,
        key: &ServiceKey,
        listen_port: u16,
        session: Option<&str>,
    ) -> Result<Backend, LbError> {
        let svc = self.service(key).await?;
        let target = PortDescriptor::all(&svc)
            .into_iter()
            .find(|p| p.port == listen_port)
            .map(|p| p.target_port)
            .ok_or_else(|| LbError::PortNotFound(key.clone(), listen_port))?;

        let pods = self.pods(key).await;
        let running = pods.iter().filter_map(Candidate::new).collect::<Vec<_>>();
        let first = running
            .first()
            .ok_or_else(|| LbError::NoReadyBackends(key.clone()))?;

        // Pods of a service share a port layout, so the first pod's mapping serves all of them.
        let port = host_port(first.pod, &target)
            .ok_or_else(|| LbError::PortNotFound(key.clone(), listen_port))?;

        let idx = self.select(key, &running, session);
        let chosen = &running[idx];
        debug!(%key, pod = %chosen.name, ip = %chosen.host_ip, %port, "Picked backend");
        Ok(Backend {
            addr: SocketAddr::new(chosen.host_ip, port),
            pod: chosen.name.clone(),
        })
    }

    /// Records the outcome of a connection to the backend chosen for `session`.
    ///
    /// A session that fails too many times in a row is re-assigned on its next pick.
    pub fn report(&self, key: &ServiceKey, session: &str, ok: bool) {
        if self.strategy != LbStrategy::SessionStickiness {
            return;
        }
        let mut state = self.state.lock();
        let Some(s) = state
            .get_mut(key)
            .and_then(|b| b.sessions.get_mut(session))
        else {
            return;
        };
        if ok {
            s.failures = 0;
        } else {
            s.failures += 1;
            debug!(%key, %session, failures = s.failures, "Backend failed");
        }
    }

    /// Forgets all balancing state of a service.
    pub fn reset(&self, key: &ServiceKey) {
        if self.state.lock().remove(key).is_some() {
            debug!(%key, "Reset balancing state");
        }
    }

    async fn service(&self, key: &ServiceKey) -> Result<Arc<Service>, LbError> {
        if let Some(svc) = self.cache.get_service(key) {
            return Ok(svc);
        }
        match self.meta.get_service(key).await {
            Ok(Some(svc)) => {
                self.cache.add_service(key.clone(), svc.clone());
                Ok(Arc::new(svc))
            }
            Ok(None) => Err(LbError::ServiceNotFound(key.clone())),
            Err(error) => {
                warn!(%key, %error, "Failed to fetch service");
                Err(LbError::ServiceNotFound(key.clone()))
            }
        }
    }

    async fn pods(&self, key: &ServiceKey) -> Arc<Vec<Pod>> {
        if let Some(pods) = self.cache.get_pods(key) {
            return pods;
        }
        match self.meta.get_pods(key).await {
            Ok(pods) => {
                self.cache.add_pods(key.clone(), pods.clone());
                Arc::new(pods)
            }
            Err(error) => {
                warn!(%key, %error, "Failed to fetch pods");
                Arc::new(Vec::new())
            }
        }
    }

    fn select(&self, key: &ServiceKey, running: &[Candidate<'_>], session: Option<&str>) -> usize {
        let n = running.len();
        let mut state = self.state.lock();
        let balance = state.entry(key.clone()).or_default();
        match (self.strategy, session) {
            (LbStrategy::Random, _) => rand::thread_rng().gen_range(0..n),
            (LbStrategy::SessionStickiness, Some(session)) => {
                let now = Instant::now();
                if let Some(s) = balance.sessions.get(session) {
                    if now < s.expires && s.failures < self.session.successive_failures {
                        if let Some(idx) = running.iter().position(|c| c.name == s.pod) {
                            return idx;
                        }
                    }
                }
                balance.sessions.retain(|_, s| now < s.expires);
                let idx = balance.round_robin(n);
                balance.sessions.insert(
                    session.to_string(),
                    Session {
                        pod: running[idx].name.clone(),
                        expires: now + self.session.timeout,
                        failures: 0,
                    },
                );
                idx
            }
            _ => balance.round_robin(n),
        }
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy)
            .field("session", &self.session)
            .finish()
    }
}

// === impl Balance ===

impl Balance {
    fn round_robin(&mut self, n: usize) -> usize {
        let idx = self.next % n;
        self.next = self.next.wrapping_add(1);
        idx
    }
}

// === impl Candidate ===

impl<'p> Candidate<'p> {
    fn new(pod: &'p Pod) -> Option<Self> {
        let status = pod.status.as_ref()?;
        if status.phase.as_deref() != Some("Running") {
            return None;
        }
        let host_ip = status.host_ip.as_deref()?.parse().ok()?;
        let name = pod.metadata.name.clone().unwrap_or_default();
        Some(Self { name, host_ip, pod })
    }
}

/// Resolves the port on the pod's host that reaches `target`.
fn host_port(pod: &Pod, target: &TargetPort) -> Option<u16> {
    let spec = pod.spec.as_ref()?;
    let mut ports = spec.containers.iter().flat_map(|c| c.ports.iter().flatten());
    let port = match target {
        TargetPort::Number(n) => ports.find(|p| p.container_port == i32::from(*n)),
        TargetPort::Name(name) => ports.find(|p| p.name.as_deref() == Some(name.as_str())),
    };

    if spec.host_network == Some(true) {
        return match target {
            TargetPort::Number(n) => Some(*n),
            TargetPort::Name(_) => u16::try_from(port?.container_port).ok(),
        };
    }
    u16::try_from(port?.host_port?).ok().filter(|p| *p != 0)
}
