use edgemesh_core::{Pod, Service, ServiceKey};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

pub const DEFAULT_CAPACITY: usize = 20;

/// A small least-recently-used cache of service and pod-list snapshots.
///
/// Snapshots are immutable: an update replaces the cached value. Entries are keyed by kind and
/// service key, so that a service and its pod list never collide.
pub struct ObjectCache {
    capacity: usize,
    entries: Mutex<IndexMap<CacheKey, Snapshot>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: Kind,
    key: ServiceKey,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Kind {
    Service,
    Pods,
}

#[derive(Clone, Debug)]
enum Snapshot {
    Service(Arc<Service>),
    Pods(Arc<Vec<Pod>>),
}

// === impl ObjectCache ===

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::with_capacity(capacity)),
        }
    }

    pub fn get_service(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        match self.get(Kind::Service, key)? {
            Snapshot::Service(svc) => Some(svc),
            other => mismatched(Kind::Service, key, &other),
        }
    }

    pub fn add_service(&self, key: ServiceKey, svc: Service) {
        self.add(Kind::Service, key, Snapshot::Service(Arc::new(svc)));
    }

    pub fn remove_service(&self, key: &ServiceKey) {
        self.remove(Kind::Service, key);
    }

    pub fn get_pods(&self, key: &ServiceKey) -> Option<Arc<Vec<Pod>>> {
        match self.get(Kind::Pods, key)? {
            Snapshot::Pods(pods) => Some(pods),
            other => mismatched(Kind::Pods, key, &other),
        }
    }

    pub fn add_pods(&self, key: ServiceKey, pods: Vec<Pod>) {
        self.add(Kind::Pods, key, Snapshot::Pods(Arc::new(pods)));
    }

    pub fn remove_pods(&self, key: &ServiceKey) {
        self.remove(Kind::Pods, key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, kind: Kind, key: &ServiceKey) -> Option<Snapshot> {
        let mut entries = self.entries.lock();
        let ck = CacheKey {
            kind,
            key: key.clone(),
        };
        // Move the entry to the most-recently-used end.
        let (ck, snapshot) = entries.shift_remove_entry(&ck)?;
        entries.insert(ck, snapshot.clone());
        Some(snapshot)
    }

    fn add(&self, kind: Kind, key: ServiceKey, snapshot: Snapshot) {
        let mut entries = self.entries.lock();
        let ck = CacheKey { kind, key };
        entries.shift_remove(&ck);
        while entries.len() >= self.capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                tracing::trace!(kind = ?evicted.kind, key = %evicted.key, "Evicted");
            }
        }
        entries.insert(ck, snapshot);
    }

    fn remove(&self, kind: Kind, key: &ServiceKey) {
        self.entries.lock().shift_remove(&CacheKey {
            kind,
            key: key.clone(),
        });
    }
}

impl fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

fn mismatched<T>(expected: Kind, key: &ServiceKey, found: &Snapshot) -> Option<T> {
    let found = match found {
        Snapshot::Service(_) => Kind::Service,
        Snapshot::Pods(_) => Kind::Pods,
    };
    tracing::warn!(%key, ?expected, ?found, "Cached snapshot has an unexpected type");
    None
}
