//! NAT table manipulation.

use crate::{
    command::{self, args},
    Result,
};

pub const PREROUTING: &str = "PREROUTING";
pub const OUTPUT: &str = "OUTPUT";

/// Operations on chains and rules of the `nat` table.
#[async_trait::async_trait]
pub trait Iptables: Send + Sync {
    /// Creates `chain` unless it exists. Returns whether it already existed.
    async fn ensure_chain(&self, chain: &str) -> Result<bool>;

    /// Appends `rule` to `chain` unless an identical rule is present. Returns whether it was
    /// already present.
    async fn ensure_rule(&self, chain: &str, rule: &[String]) -> Result<bool>;

    async fn delete_rule(&self, chain: &str, rule: &[String]) -> Result<()>;

    async fn flush_chain(&self, chain: &str) -> Result<()>;

    async fn delete_chain(&self, chain: &str) -> Result<()>;
}

/// Drives the `iptables` binary.
#[derive(Clone, Debug)]
pub struct IptablesCmd {
    program: String,
}

// === impl IptablesCmd ===

impl Default for IptablesCmd {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl IptablesCmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn nat<'a>(&self, op: &str, chain: &str, rule: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut a = args(["-w", "-t", "nat", op, chain]);
        a.extend(rule.into_iter().cloned());
        a
    }
}

#[async_trait::async_trait]
impl Iptables for IptablesCmd {
    async fn ensure_chain(&self, chain: &str) -> Result<bool> {
        let exists = command::run(&self.program, &self.nat("-S", chain, &[])).await?;
        if exists.success {
            return Ok(true);
        }
        command::check(&self.program, &self.nat("-N", chain, &[])).await?;
        Ok(false)
    }

    async fn ensure_rule(&self, chain: &str, rule: &[String]) -> Result<bool> {
        let exists = command::run(&self.program, &self.nat("-C", chain, rule)).await?;
        if exists.success {
            return Ok(true);
        }
        command::check(&self.program, &self.nat("-A", chain, rule)).await?;
        Ok(false)
    }

    async fn delete_rule(&self, chain: &str, rule: &[String]) -> Result<()> {
        command::check(&self.program, &self.nat("-D", chain, rule)).await?;
        Ok(())
    }

    async fn flush_chain(&self, chain: &str) -> Result<()> {
        command::check(&self.program, &self.nat("-F", chain, &[])).await?;
        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        command::check(&self.program, &self.nat("-X", chain, &[])).await?;
        Ok(())
    }
}
