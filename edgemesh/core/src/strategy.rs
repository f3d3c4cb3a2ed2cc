use anyhow::{bail, Result};
use std::{fmt, str::FromStr, time::Duration};

/// How the load balancer chooses among a service's ready pods.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    Random,
    SessionStickiness,
}

/// Tuning for [`LbStrategy::SessionStickiness`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a session stays pinned to the pod it was first assigned.
    pub timeout: Duration,

    /// The number of consecutive failures after which a session is re-assigned.
    pub successive_failures: u32,
}

// === impl LbStrategy ===

impl LbStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "RoundRobin",
            Self::Random => "Random",
            Self::SessionStickiness => "SessionStickiness",
        }
    }
}

impl FromStr for LbStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RoundRobin" => Ok(Self::RoundRobin),
            "Random" => Ok(Self::Random),
            "SessionStickiness" => Ok(Self::SessionStickiness),
            s => bail!(
                "invalid load balancing strategy {s:?} (expected RoundRobin, Random, or SessionStickiness)"
            ),
        }
    }
}

impl fmt::Display for LbStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl SessionConfig ===

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            successive_failures: 5,
        }
    }
}
