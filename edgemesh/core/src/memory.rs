//! An in-process object store.
//!
//! Services, pods and listener records are held in memory; change events are published by the
//! owner with [`MemoryMetaClient::publish`] and delivered to the single subscriber.

use crate::{
    meta::{ListenerStore, Message, MetaClient},
    service::ServiceKey,
};
use anyhow::Result;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, net::Ipv4Addr};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug)]
pub struct MemoryMetaClient {
    services: RwLock<BTreeMap<ServiceKey, Service>>,
    pods: RwLock<BTreeMap<ServiceKey, Vec<Pod>>>,
    listener: MemoryListenerStore,
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

#[derive(Debug, Default)]
pub struct MemoryListenerStore {
    records: RwLock<BTreeMap<ServiceKey, Ipv4Addr>>,
}

// === impl MemoryMetaClient ===

impl Default for MemoryMetaClient {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            services: Default::default(),
            pods: Default::default(),
            listener: Default::default(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl MemoryMetaClient {
    pub fn put_service(&self, svc: Service) {
        if let Some(key) = ServiceKey::from_service(&svc) {
            self.services.write().insert(key, svc);
        }
    }

    pub fn remove_service(&self, key: &ServiceKey) {
        self.services.write().remove(key);
    }

    pub fn put_pods(&self, key: ServiceKey, pods: Vec<Pod>) {
        self.pods.write().insert(key, pods);
    }

    /// Publishes a change event to the subscriber. Events published before a subscription are
    /// buffered.
    pub fn publish(&self, msg: Message) {
        // The receiver is only gone once the subscriber has been dropped.
        let _ = self.tx.send(msg);
    }

    pub fn listener_store(&self) -> &MemoryListenerStore {
        &self.listener
    }
}

#[async_trait::async_trait]
impl MetaClient for MemoryMetaClient {
    async fn get_service(&self, key: &ServiceKey) -> Result<Option<Service>> {
        Ok(self.services.read().get(key).cloned())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.services.read().values().cloned().collect())
    }

    async fn get_pods(&self, key: &ServiceKey) -> Result<Vec<Pod>> {
        Ok(self.pods.read().get(key).cloned().unwrap_or_default())
    }

    fn listener(&self) -> &dyn ListenerStore {
        &self.listener
    }

    fn subscribe(&self) -> BoxStream<'static, Message> {
        match self.rx.lock().take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => {
                tracing::warn!("object store already has a subscriber");
                futures::stream::empty().boxed()
            }
        }
    }
}

// === impl MemoryListenerStore ===

impl MemoryListenerStore {
    pub fn records(&self) -> BTreeMap<ServiceKey, Ipv4Addr> {
        self.records.read().clone()
    }
}

impl ListenerStore for MemoryListenerStore {
    fn add(&self, key: &ServiceKey, ip: Ipv4Addr) -> Result<()> {
        self.records.write().insert(key.clone(), ip);
        Ok(())
    }

    fn get(&self, key: &ServiceKey) -> Result<Option<Ipv4Addr>> {
        Ok(self.records.read().get(key).copied())
    }

    fn del(&self, key: &ServiceKey) -> Result<()> {
        self.records.write().remove(key);
        Ok(())
    }
}
