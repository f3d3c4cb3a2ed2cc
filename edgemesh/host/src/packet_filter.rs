use crate::{
    ip::Ip,
    iptables::{Iptables, OUTPUT, PREROUTING},
    Intercept, NetworkBackend, Result,
};
use ipnet::Ipv4Net;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::PathBuf,
    sync::Arc,
};
use tracing::{debug, info, warn};

/// The NAT chain that redirects synthetic-subnet traffic to the intercept listener.
pub const MESH_CHAIN: &str = "EDGE-MESH";

/// The three rules that steer synthetic-subnet traffic into [`MESH_CHAIN`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshRules {
    /// Jumps from `PREROUTING` for traffic arriving on the listen interface.
    pub inbound: Vec<String>,
    /// Jumps from `OUTPUT` for traffic leaving on the listen interface.
    pub outbound: Vec<String>,
    /// Redirects everything in [`MESH_CHAIN`] to the intercept listener.
    pub dnat: Vec<String>,
}

/// Steers synthetic-subnet traffic to a shared intercept listener with NAT rules, and routes the
/// subnet via the listen address.
///
/// The rules are recorded in a state file so that a restarted process can remove the rules of
/// its predecessor, even if its configuration changed in between.
pub struct PacketFilter {
    iptables: Arc<dyn Iptables>,
    ip: Arc<dyn Ip>,
    rules: MeshRules,
    subnet: Ipv4Net,
    listen: SocketAddrV4,
    state_path: PathBuf,
}

// === impl MeshRules ===

impl MeshRules {
    pub fn new(subnet: Ipv4Net, interface: &str, listen: SocketAddrV4) -> Self {
        let split = |s: String| s.split(' ').map(String::from).collect::<Vec<_>>();
        Self {
            inbound: split(format!("-p tcp -d {subnet} -i {interface} -j {MESH_CHAIN}")),
            outbound: split(format!("-p tcp -d {subnet} -o {interface} -j {MESH_CHAIN}")),
            dnat: split(format!("-p tcp -j DNAT --to-destination {listen}")),
        }
    }

    /// Renders the rules in the state file format, one rule per line.
    pub fn to_state(&self) -> String {
        [&self.inbound, &self.dnat, &self.outbound]
            .iter()
            .map(|r| format!("{}\n", r.join(" ")))
            .collect()
    }

    /// Reads a state file, returning the jump rules it records with the chain each was appended
    /// to. Rules within [`MESH_CHAIN`] are omitted; they are removed with the chain.
    pub fn parse_state(state: &str) -> Vec<(&'static str, Vec<String>)> {
        state
            .lines()
            .filter_map(|line| {
                let rule = line.split_whitespace().map(String::from).collect::<Vec<_>>();
                let chain = if rule.iter().any(|w| w == "-o") {
                    OUTPUT
                } else if rule.iter().any(|w| w == "-i") {
                    PREROUTING
                } else {
                    return None;
                };
                Some((chain, rule))
            })
            .collect()
    }
}

// === impl PacketFilter ===

impl PacketFilter {
    pub fn new(
        iptables: Arc<dyn Iptables>,
        ip: Arc<dyn Ip>,
        subnet: Ipv4Net,
        interface: &str,
        listen: SocketAddrV4,
        state_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            iptables,
            ip,
            rules: MeshRules::new(subnet, interface, listen),
            subnet,
            listen,
            state_path: state_path.into(),
        }
    }

    pub fn rules(&self) -> &MeshRules {
        &self.rules
    }

    fn gateway(&self) -> Ipv4Addr {
        *self.listen.ip()
    }

    /// Removes the rules recorded by a previous run, along with the mesh chain.
    async fn read_and_clean(&self) {
        match tokio::fs::read_to_string(&self.state_path).await {
            Ok(state) => {
                for (chain, rule) in MeshRules::parse_state(&state) {
                    if let Err(error) = self.iptables.delete_rule(chain, &rule).await {
                        debug!(%chain, rule = %rule.join(" "), %error, "Failed to delete recorded rule");
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = %self.state_path.display(), %error, "Failed to read rule state");
            }
        }
        self.clean_chain().await;
    }

    async fn clean_chain(&self) {
        if let Err(error) = self.iptables.flush_chain(MESH_CHAIN).await {
            debug!(%error, "Failed to flush chain");
        }
        if let Err(error) = self.iptables.delete_chain(MESH_CHAIN).await {
            debug!(%error, "Failed to delete chain");
        }
    }

    async fn ensure_rules(&self) -> Result<()> {
        if !self.iptables.ensure_chain(MESH_CHAIN).await? {
            info!(chain = %MESH_CHAIN, "Created chain");
        }
        for (chain, rule) in [
            (PREROUTING, &self.rules.inbound),
            (OUTPUT, &self.rules.outbound),
            (MESH_CHAIN, &self.rules.dnat),
        ] {
            if !self.iptables.ensure_rule(chain, rule).await? {
                info!(%chain, rule = %rule.join(" "), "Added rule");
            }
        }
        Ok(())
    }

    async fn ensure_route(&self) -> Result<()> {
        if self.ip.has_route(self.subnet, self.gateway()).await? {
            return Ok(());
        }
        self.ip.add_route(self.subnet, self.gateway()).await?;
        info!(subnet = %self.subnet, via = %self.gateway(), "Added route");
        Ok(())
    }

    async fn save_state(&self) -> Result<()> {
        let tmp = self.state_path.with_extension("tmp");
        tokio::fs::write(&tmp, self.rules.to_state()).await?;
        tokio::fs::rename(&tmp, &self.state_path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl NetworkBackend for PacketFilter {
    async fn program(&self) -> Result<()> {
        self.read_and_clean().await;
        self.ensure_rules().await?;
        if let Err(error) = self.ensure_route().await {
            warn!(subnet = %self.subnet, %error, "Failed to add route");
        }
        if let Err(error) = self.save_state().await {
            warn!(path = %self.state_path.display(), %error, "Failed to save rule state");
        }
        Ok(())
    }

    async fn reconcile(&self) -> Result<()> {
        self.ensure_rules().await?;
        self.ensure_route().await
    }

    async fn cleanup(&self) -> Result<()> {
        for (chain, rule) in [
            (PREROUTING, &self.rules.inbound),
            (OUTPUT, &self.rules.outbound),
        ] {
            if let Err(error) = self.iptables.delete_rule(chain, rule).await {
                debug!(%chain, %error, "Failed to delete rule");
            }
        }
        self.clean_chain().await;
        if let Err(error) = self.ip.del_route(self.subnet, self.gateway()).await {
            warn!(subnet = %self.subnet, %error, "Failed to delete route");
        }
        match tokio::fs::remove_file(&self.state_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn intercept(&self) -> Intercept {
        Intercept::Shared(self.listen)
    }
}

impl std::fmt::Debug for PacketFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFilter")
            .field("subnet", &self.subnet)
            .field("listen", &self.listen)
            .field("state_path", &self.state_path)
            .finish()
    }
}

#[cfg(test)]
mod tests;
