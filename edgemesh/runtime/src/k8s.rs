//! An object store backed by the Kubernetes API.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use edgemesh_core::{ListenerStore, Message, MetaClient, Operation, Pod, Service, ServiceKey};
use futures::{prelude::*, stream::BoxStream};
use kube::{
    api::{Api, ListParams},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

/// Reads services and pods from the API server and persists listener records locally.
pub struct KubeMetaClient {
    client: Client,
    store: Arc<dyn ListenerStore>,
}

/// A change observed by one of the watches.
#[derive(Debug)]
enum Change {
    Service(watcher::Event<Service>),
    Pod(watcher::Event<Pod>),
}

/// Tracks watched services and pods so that pod changes can be turned into the pod lists of the
/// services selecting them.
#[derive(Debug, Default)]
struct WatchIndex {
    services: HashMap<ServiceKey, Service>,
    pods: HashMap<ObjectKey, Pod>,
    relisted_services: Option<HashSet<ServiceKey>>,
    relisted_pods: Option<HashSet<ObjectKey>>,
}

type ObjectKey = (String, String);

// === impl KubeMetaClient ===

impl KubeMetaClient {
    pub fn new(client: Client, store: Arc<dyn ListenerStore>) -> Self {
        Self { client, store }
    }
}

#[async_trait::async_trait]
impl MetaClient for KubeMetaClient {
    async fn get_service(&self, key: &ServiceKey) -> Result<Option<Service>> {
        let api = Api::<Service>::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let api = Api::<Service>::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_pods(&self, key: &ServiceKey) -> Result<Vec<Pod>> {
        let Some(svc) = self.get_service(key).await? else {
            return Ok(Vec::new());
        };
        let Some(selector) = label_selector(&svc) else {
            return Ok(Vec::new());
        };
        let api = Api::<Pod>::namespaced(self.client.clone(), &key.namespace);
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    fn listener(&self) -> &dyn ListenerStore {
        &*self.store
    }

    fn subscribe(&self) -> BoxStream<'static, Message> {
        let services = watcher(
            Api::<Service>::all(self.client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .map_ok(Change::Service);
        let pods = watcher(
            Api::<Pod>::all(self.client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .map_ok(Change::Pod);

        let mut index = WatchIndex::default();
        stream::select(services, pods)
            .filter_map(|res| {
                future::ready(match res {
                    Ok(change) => Some(change),
                    Err(error) => {
                        warn!(%error, "Watch failed");
                        None
                    }
                })
            })
            .flat_map(move |change| stream::iter(index.apply(change)))
            .boxed()
    }
}

impl std::fmt::Debug for KubeMetaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeMetaClient").finish_non_exhaustive()
    }
}

// === impl WatchIndex ===

impl WatchIndex {
    fn apply(&mut self, change: Change) -> Vec<Message> {
        match change {
            Change::Service(watcher::Event::Init) => {
                self.relisted_services = Some(HashSet::default());
                Vec::new()
            }
            Change::Service(watcher::Event::InitApply(svc)) => {
                if let (Some(seen), Some(key)) =
                    (self.relisted_services.as_mut(), ServiceKey::from_service(&svc))
                {
                    seen.insert(key);
                }
                self.apply_service(svc)
            }
            Change::Service(watcher::Event::InitDone) => {
                let seen = self.relisted_services.take().unwrap_or_default();
                let gone = self
                    .services
                    .iter()
                    .filter(|(k, _)| !seen.contains(*k))
                    .map(|(_, svc)| svc.clone())
                    .collect::<Vec<_>>();
                gone.into_iter()
                    .flat_map(|svc| self.delete_service(svc))
                    .collect()
            }
            Change::Service(watcher::Event::Apply(svc)) => self.apply_service(svc),
            Change::Service(watcher::Event::Delete(svc)) => self.delete_service(svc),

            Change::Pod(watcher::Event::Init) => {
                self.relisted_pods = Some(HashSet::default());
                Vec::new()
            }
            Change::Pod(watcher::Event::InitApply(pod)) => {
                if let (Some(seen), Some(key)) = (self.relisted_pods.as_mut(), object_key(&pod)) {
                    seen.insert(key);
                }
                self.apply_pod(pod)
            }
            Change::Pod(watcher::Event::InitDone) => {
                let seen = self.relisted_pods.take().unwrap_or_default();
                let gone = self
                    .pods
                    .iter()
                    .filter(|(k, _)| !seen.contains(*k))
                    .map(|(_, pod)| pod.clone())
                    .collect::<Vec<_>>();
                gone.into_iter().flat_map(|pod| self.delete_pod(pod)).collect()
            }
            Change::Pod(watcher::Event::Apply(pod)) => self.apply_pod(pod),
            Change::Pod(watcher::Event::Delete(pod)) => self.delete_pod(pod),
        }
    }

    fn apply_service(&mut self, svc: Service) -> Vec<Message> {
        let Some(key) = ServiceKey::from_service(&svc) else {
            return Vec::new();
        };
        let op = match self.services.get(&key) {
            None => Operation::Insert,
            // Resyncs repeat unchanged objects.
            Some(prior) if prior.spec == svc.spec => return Vec::new(),
            Some(_) => Operation::Update,
        };
        self.services.insert(key.clone(), svc);
        let mut msgs = Vec::new();
        if let Some(svc) = self.services.get(&key) {
            msgs.extend(encode(Message::service(op, svc)));
        }
        msgs.extend(self.pod_list(&key));
        msgs
    }

    fn delete_service(&mut self, svc: Service) -> Vec<Message> {
        let Some(key) = ServiceKey::from_service(&svc) else {
            return Vec::new();
        };
        let Some(svc) = self.services.remove(&key) else {
            return Vec::new();
        };
        let mut msgs = encode(Message::service(Operation::Delete, &svc))
            .into_iter()
            .collect::<Vec<_>>();
        msgs.extend(encode(Message::pod_list(Operation::Delete, &key, &[])));
        msgs
    }

    fn apply_pod(&mut self, pod: Pod) -> Vec<Message> {
        let Some(key) = object_key(&pod) else {
            return Vec::new();
        };
        let prior = self.pods.insert(key, pod.clone());
        if prior.as_ref() == Some(&pod) {
            return Vec::new();
        }
        self.pod_lists_selecting(prior.iter().chain(Some(&pod)))
    }

    fn delete_pod(&mut self, pod: Pod) -> Vec<Message> {
        let Some(key) = object_key(&pod) else {
            return Vec::new();
        };
        match self.pods.remove(&key) {
            Some(prior) => self.pod_lists_selecting([&prior, &pod]),
            None => Vec::new(),
        }
    }

    /// Emits the pod lists of every service that selects any of `pods`.
    fn pod_lists_selecting<'p>(&self, pods: impl IntoIterator<Item = &'p Pod>) -> Vec<Message> {
        let pods = pods.into_iter().collect::<Vec<_>>();
        let mut keys = self
            .services
            .iter()
            .filter(|(_, svc)| pods.iter().any(|pod| selects(svc, pod)))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys.dedup();
        keys.iter().filter_map(|key| self.pod_list(key)).collect()
    }

    fn pod_list(&self, key: &ServiceKey) -> Option<Message> {
        let svc = self.services.get(key)?;
        let mut pods = self
            .pods
            .values()
            .filter(|pod| selects(svc, pod))
            .cloned()
            .collect::<Vec<_>>();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        encode(Message::pod_list(Operation::Update, key, &pods))
    }
}

fn encode(msg: Result<Message>) -> Option<Message> {
    match msg {
        Ok(msg) => Some(msg),
        Err(error) => {
            debug!(%error, "Failed to encode event");
            None
        }
    }
}

fn object_key(pod: &Pod) -> Option<ObjectKey> {
    Some((pod.metadata.namespace.clone()?, pod.metadata.name.clone()?))
}

fn selector(svc: &Service) -> Option<&BTreeMap<String, String>> {
    svc.spec
        .as_ref()?
        .selector
        .as_ref()
        .filter(|sel| !sel.is_empty())
}

/// Renders a service's selector as a label selector. Services without a selector select nothing.
fn label_selector(svc: &Service) -> Option<String> {
    let sel = selector(svc)?;
    Some(
        sel.iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn selects(svc: &Service, pod: &Pod) -> bool {
    if svc.metadata.namespace != pod.metadata.namespace {
        return false;
    }
    let Some(sel) = selector(svc) else {
        return false;
    };
    let labels = pod.metadata.labels.as_ref();
    sel.iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}
