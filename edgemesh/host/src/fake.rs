//! In-memory drivers that model the host state, for tests that drive a [`NetworkBackend`]
//! without touching the host.
//!
//! [`NetworkBackend`]: crate::NetworkBackend

use crate::{ip::Ip, iptables::Iptables, Error, Result};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    net::Ipv4Addr,
};

#[derive(Debug)]
pub struct FakeIptables {
    chains: Mutex<BTreeMap<String, Vec<Vec<String>>>>,
    mutations: Mutex<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct FakeIp {
    routes: Mutex<BTreeSet<(Ipv4Net, Ipv4Addr)>>,
    links: Mutex<BTreeMap<String, BTreeSet<Ipv4Addr>>>,
    mutations: Mutex<Vec<String>>,
}

fn missing(what: impl std::fmt::Display) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::NotFound, what.to_string()))
}

// === impl FakeIptables ===

impl Default for FakeIptables {
    fn default() -> Self {
        let chains = ["PREROUTING", "OUTPUT"]
            .into_iter()
            .map(|c| (c.to_string(), Vec::new()))
            .collect();
        Self {
            chains: Mutex::new(chains),
            mutations: Default::default(),
        }
    }
}

impl FakeIptables {
    pub fn rules(&self, chain: &str) -> Option<Vec<String>> {
        let chains = self.chains.lock();
        let rules = chains.get(chain)?;
        Some(rules.iter().map(|r| r.join(" ")).collect())
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.chains.lock().contains_key(chain)
    }

    /// Appends a rule without recording a mutation.
    pub fn insert_rule(&self, chain: &str, rule: &str) {
        self.chains
            .lock()
            .entry(chain.to_string())
            .or_default()
            .push(rule.split(' ').map(String::from).collect());
    }

    /// Deletes a chain along with every rule that jumps to it.
    pub fn force_delete_chain(&self, chain: &str) {
        let mut chains = self.chains.lock();
        chains.remove(chain);
        for rules in chains.values_mut() {
            rules.retain(|r| !jumps_to(r, chain));
        }
    }

    /// Returns and clears the recorded mutations.
    pub fn take_mutations(&self) -> Vec<String> {
        std::mem::take(&mut *self.mutations.lock())
    }

    fn record(&self, m: String) {
        self.mutations.lock().push(m);
    }
}

fn jumps_to(rule: &[String], chain: &str) -> bool {
    rule.windows(2).any(|w| w[0] == "-j" && w[1] == chain)
}

#[async_trait::async_trait]
impl Iptables for FakeIptables {
    async fn ensure_chain(&self, chain: &str) -> Result<bool> {
        if self.has_chain(chain) {
            return Ok(true);
        }
        self.chains.lock().insert(chain.to_string(), Vec::new());
        self.record(format!("-N {chain}"));
        Ok(false)
    }

    async fn ensure_rule(&self, chain: &str, rule: &[String]) -> Result<bool> {
        {
            let mut chains = self.chains.lock();
            let rules = chains.get_mut(chain).ok_or_else(|| missing(chain))?;
            if rules.iter().any(|r| r == rule) {
                return Ok(true);
            }
            rules.push(rule.to_vec());
        }
        self.record(format!("-A {chain} {}", rule.join(" ")));
        Ok(false)
    }

    async fn delete_rule(&self, chain: &str, rule: &[String]) -> Result<()> {
        {
            let mut chains = self.chains.lock();
            let rules = chains.get_mut(chain).ok_or_else(|| missing(chain))?;
            let pos = rules
                .iter()
                .position(|r| r == rule)
                .ok_or_else(|| missing(rule.join(" ")))?;
            rules.remove(pos);
        }
        self.record(format!("-D {chain} {}", rule.join(" ")));
        Ok(())
    }

    async fn flush_chain(&self, chain: &str) -> Result<()> {
        self.chains
            .lock()
            .get_mut(chain)
            .ok_or_else(|| missing(chain))?
            .clear();
        self.record(format!("-F {chain}"));
        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        {
            let mut chains = self.chains.lock();
            match chains.get(chain) {
                None => return Err(missing(chain)),
                Some(rules) if !rules.is_empty() => {
                    return Err(Error::Io(io::Error::other("chain is not empty")))
                }
                Some(_) => {}
            }
            if chains.values().flatten().any(|r| jumps_to(r, chain)) {
                return Err(Error::Io(io::Error::other("chain is referenced")));
            }
            chains.remove(chain);
        }
        self.record(format!("-X {chain}"));
        Ok(())
    }
}

// === impl FakeIp ===

impl FakeIp {
    pub fn routes(&self) -> Vec<(Ipv4Net, Ipv4Addr)> {
        self.routes.lock().iter().copied().collect()
    }

    pub fn link(&self, name: &str) -> Option<Vec<Ipv4Addr>> {
        self.links
            .lock()
            .get(name)
            .map(|addrs| addrs.iter().copied().collect())
    }

    /// Removes a link without recording a mutation.
    pub fn drop_link(&self, name: &str) {
        self.links.lock().remove(name);
    }

    pub fn take_mutations(&self) -> Vec<String> {
        std::mem::take(&mut *self.mutations.lock())
    }

    fn record(&self, m: String) {
        self.mutations.lock().push(m);
    }
}

#[async_trait::async_trait]
impl Ip for FakeIp {
    async fn has_route(&self, dst: Ipv4Net, gateway: Ipv4Addr) -> Result<bool> {
        Ok(self.routes.lock().contains(&(dst, gateway)))
    }

    async fn add_route(&self, dst: Ipv4Net, gateway: Ipv4Addr) -> Result<()> {
        self.routes.lock().insert((dst, gateway));
        self.record(format!("route replace {dst} via {gateway}"));
        Ok(())
    }

    async fn del_route(&self, dst: Ipv4Net, gateway: Ipv4Addr) -> Result<()> {
        if !self.routes.lock().remove(&(dst, gateway)) {
            return Err(missing(dst));
        }
        self.record(format!("route del {dst} via {gateway}"));
        Ok(())
    }

    async fn has_link(&self, name: &str) -> Result<bool> {
        Ok(self.links.lock().contains_key(name))
    }

    async fn add_dummy_link(&self, name: &str) -> Result<()> {
        {
            let mut links = self.links.lock();
            if links.contains_key(name) {
                return Err(Error::Io(io::Error::other("link exists")));
            }
            links.insert(name.to_string(), BTreeSet::new());
        }
        self.record(format!("link add {name}"));
        Ok(())
    }

    async fn del_link(&self, name: &str) -> Result<()> {
        self.links.lock().remove(name).ok_or_else(|| missing(name))?;
        self.record(format!("link del {name}"));
        Ok(())
    }

    async fn addrs(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        self.link(name).ok_or_else(|| missing(name))
    }

    async fn add_addr(&self, name: &str, addr: Ipv4Addr) -> Result<()> {
        self.links
            .lock()
            .get_mut(name)
            .ok_or_else(|| missing(name))?
            .insert(addr);
        self.record(format!("addr replace {addr}/32 dev {name}"));
        Ok(())
    }
}
