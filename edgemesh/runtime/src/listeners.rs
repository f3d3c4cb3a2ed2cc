use ahash::AHashMap as HashMap;
use edgemesh_core::{PortDescriptor, ServiceKey};
use edgemesh_host::VirtualDevice;
use edgemesh_index::PortListeners;
use edgemesh_proxy::{serve_port, Proxy};
use parking_lot::Mutex;
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{net::TcpListener, runtime::Handle, task::JoinHandle};
use tracing::{debug, info_span, warn, Instrument};

/// Runs an accept loop on every synthetic `ip:port`, assigning each IP to the virtual device
/// before binding.
pub struct DeviceListeners {
    device: Arc<VirtualDevice>,
    proxy: Proxy,
    drain: Mutex<Option<drain::Watch>>,
    rt: Handle,
    tasks: Mutex<HashMap<(Ipv4Addr, u16), JoinHandle<()>>>,
}

// === impl DeviceListeners ===

impl DeviceListeners {
    /// Must be called from within the runtime that runs the listeners.
    pub fn new(device: Arc<VirtualDevice>, proxy: Proxy, drain: drain::Watch) -> Self {
        Self {
            device,
            proxy,
            drain: Mutex::new(Some(drain)),
            rt: Handle::current(),
            tasks: Mutex::new(HashMap::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops starting listeners. Running accept loops keep serving until they are drained.
    pub fn close(&self) {
        self.drain.lock().take();
    }
}

impl PortListeners for DeviceListeners {
    fn start(&self, key: &ServiceKey, ip: Ipv4Addr, port: &PortDescriptor) {
        let device = self.device.clone();
        let proxy = self.proxy.clone();
        let Some(drain) = self.drain.lock().clone() else {
            debug!(%ip, port = port.port, "Closed; not starting listener");
            return;
        };
        let key = key.clone();
        let desc = port.clone();
        let addr = SocketAddr::from((ip, desc.port));
        let mut tasks = self.tasks.lock();
        let replaced = tasks.remove(&(ip, port.port));
        if let Some(old) = replaced.as_ref() {
            old.abort();
        }
        let task = self.rt.spawn(
            async move {
                // The replaced listener must release the address before it is bound again.
                if let Some(old) = replaced {
                    let _ = old.await;
                }
                if let Err(error) = device.add_address(ip).await {
                    warn!(%error, "Failed to assign address");
                    return;
                }
                let listener = match TcpListener::bind(addr).await {
                    Ok(listener) => listener,
                    Err(error) => {
                        warn!(%error, "Failed to bind listener");
                        return;
                    }
                };
                if let Err(error) = serve_port(listener, key, desc, proxy, drain).await {
                    warn!(%error, "Listener failed");
                }
            }
            .instrument(info_span!("listener", %addr)),
        );
        tasks.insert((ip, port.port), task);
    }

    fn stop(&self, ip: Ipv4Addr, port: u16) {
        if let Some(task) = self.tasks.lock().remove(&(ip, port)) {
            task.abort();
        }
    }
}

impl Drop for DeviceListeners {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for DeviceListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceListeners")
            .field("device", &self.device)
            .field("listeners", &self.len())
            .finish()
    }
}
