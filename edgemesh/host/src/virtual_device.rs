use crate::{ip::Ip, Intercept, NetworkBackend, Result};
use parking_lot::Mutex;
use std::{collections::BTreeSet, net::Ipv4Addr, sync::Arc};
use tracing::{info, warn};

pub const DEVICE_NAME: &str = "edge0";

/// Assigns every synthetic IP to a dummy link so that per-address listeners can bind to them.
pub struct VirtualDevice {
    ip: Arc<dyn Ip>,
    name: String,
    addrs: Mutex<BTreeSet<Ipv4Addr>>,
}

impl VirtualDevice {
    pub fn new(ip: Arc<dyn Ip>) -> Self {
        Self {
            ip,
            name: DEVICE_NAME.to_string(),
            addrs: Mutex::new(BTreeSet::new()),
        }
    }

    /// Assigns a synthetic IP to the device. The address is re-assigned by every reconcile.
    pub async fn add_address(&self, addr: Ipv4Addr) -> Result<()> {
        self.addrs.lock().insert(addr);
        self.ip.add_addr(&self.name, addr).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait::async_trait]
impl NetworkBackend for VirtualDevice {
    async fn program(&self) -> Result<()> {
        if self.ip.has_link(&self.name).await? {
            self.ip.del_link(&self.name).await?;
        }
        self.ip.add_dummy_link(&self.name).await?;
        info!(device = %self.name, "Created device");
        let addrs = self.addrs.lock().clone();
        for addr in addrs {
            self.ip.add_addr(&self.name, addr).await?;
        }
        Ok(())
    }

    async fn reconcile(&self) -> Result<()> {
        if !self.ip.has_link(&self.name).await? {
            warn!(device = %self.name, "Device is missing");
            self.ip.add_dummy_link(&self.name).await?;
        }
        let present = self.ip.addrs(&self.name).await?;
        let missing = self
            .addrs
            .lock()
            .iter()
            .filter(|a| !present.contains(*a))
            .copied()
            .collect::<Vec<_>>();
        for addr in missing {
            info!(device = %self.name, %addr, "Restoring address");
            self.ip.add_addr(&self.name, addr).await?;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.ip.del_link(&self.name).await
    }

    fn intercept(&self) -> Intercept {
        Intercept::PerAddress
    }
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("name", &self.name)
            .field("addrs", &self.addrs.lock().len())
            .finish()
    }
}
