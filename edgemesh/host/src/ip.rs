//! Routes, links and addresses.

use crate::{
    command::{self, args},
    Result,
};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

#[async_trait::async_trait]
pub trait Ip: Send + Sync {
    /// Returns whether a route to `dst` via `gateway` exists.
    async fn has_route(&self, dst: Ipv4Net, gateway: Ipv4Addr) -> Result<bool>;

    async fn add_route(&self, dst: Ipv4Net, gateway: Ipv4Addr) -> Result<()>;

    async fn del_route(&self, dst: Ipv4Net, gateway: Ipv4Addr) -> Result<()>;

    async fn has_link(&self, name: &str) -> Result<bool>;

    /// Creates a dummy link and sets it up.
    async fn add_dummy_link(&self, name: &str) -> Result<()>;

    async fn del_link(&self, name: &str) -> Result<()>;

    /// Lists the IPv4 addresses assigned to a link.
    async fn addrs(&self, name: &str) -> Result<Vec<Ipv4Addr>>;

    async fn add_addr(&self, name: &str, addr: Ipv4Addr) -> Result<()>;
}

/// Drives the `ip` binary.
#[derive(Clone, Debug)]
pub struct IpCmd {
    program: String,
}

// === impl IpCmd ===

impl Default for IpCmd {
    fn default() -> Self {
        Self {
            program: "ip".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Ip for IpCmd {
    async fn has_route(&self, dst: Ipv4Net, gateway: Ipv4Addr) -> Result<bool> {
        let out = command::check(
            &self.program,
            &args(["-4", "route", "show", "to", "exact", dst.to_string().as_str()]),
        )
        .await?;
        let via = format!("via {gateway}");
        Ok(out.lines().any(|l| l.contains(&via)))
    }

    async fn add_route(&self, dst: Ipv4Net, gateway: Ipv4Addr) -> Result<()> {
        command::check(
            &self.program,
            &args(["route", "replace", &*dst.to_string(), "via", &*gateway.to_string()]),
        )
        .await?;
        Ok(())
    }

    async fn del_route(&self, dst: Ipv4Net, gateway: Ipv4Addr) -> Result<()> {
        command::check(
            &self.program,
            &args(["route", "del", &*dst.to_string(), "via", &*gateway.to_string()]),
        )
        .await?;
        Ok(())
    }

    async fn has_link(&self, name: &str) -> Result<bool> {
        let out = command::run(&self.program, &args(["link", "show", "dev", name])).await?;
        Ok(out.success)
    }

    async fn add_dummy_link(&self, name: &str) -> Result<()> {
        command::check(
            &self.program,
            &args(["link", "add", name, "type", "dummy"]),
        )
        .await?;
        command::check(&self.program, &args(["link", "set", "dev", name, "up"])).await?;
        Ok(())
    }

    async fn del_link(&self, name: &str) -> Result<()> {
        command::check(&self.program, &args(["link", "del", "dev", name])).await?;
        Ok(())
    }

    async fn addrs(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let out = command::check(
            &self.program,
            &args(["-4", "-o", "addr", "show", "dev", name]),
        )
        .await?;
        Ok(parse_addrs(&out))
    }

    async fn add_addr(&self, name: &str, addr: Ipv4Addr) -> Result<()> {
        command::check(
            &self.program,
            &args(["addr", "replace", &*format!("{addr}/32"), "dev", name]),
        )
        .await?;
        Ok(())
    }
}

/// Extracts addresses from `ip -4 -o addr show` output, where each line reads like
/// `3: docker0    inet 172.17.0.1/16 brd 172.17.255.255 scope global docker0`.
fn parse_addrs(out: &str) -> Vec<Ipv4Addr> {
    out.lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "inet")?;
            let cidr = words.next()?;
            let addr = cidr.split('/').next()?;
            addr.parse().ok()
        })
        .collect()
}
