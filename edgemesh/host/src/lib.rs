#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Host networking for the EdgeMesh data plane.
//!
//! A [`NetworkBackend`] steers traffic addressed to the synthetic subnet to the process's
//! listeners, either with NAT rules ([`PacketFilter`]) or by assigning every synthetic IP to a
//! dummy link ([`VirtualDevice`]). The [`ResolverOverlay`] points the host resolver at the DNS
//! responder.

mod command;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod ip;
pub mod iptables;
mod packet_filter;
mod resolv;
mod virtual_device;

pub use self::{
    ip::{Ip, IpCmd},
    iptables::{Iptables, IptablesCmd},
    packet_filter::{MeshRules, PacketFilter, MESH_CHAIN},
    resolv::{overlay_nameserver, remove_nameserver, ResolverOverlay},
    virtual_device::{VirtualDevice, DEVICE_NAME},
};

use std::{net::SocketAddrV4, process::ExitStatus};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How intercepted connections reach the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Intercept {
    /// Every intercepted connection is redirected to one shared listener; the original
    /// destination is recovered from the socket.
    Shared(SocketAddrV4),

    /// Each synthetic `ip:port` has its own listener.
    PerAddress,
}

/// Programs and maintains the host state that steers synthetic-subnet traffic.
#[async_trait::async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Installs the host state at startup, replacing anything left over by a previous run.
    async fn program(&self) -> Result<()>;

    /// Re-asserts the host state, repairing anything that was removed.
    async fn reconcile(&self) -> Result<()>;

    /// Removes the host state on shutdown.
    async fn cleanup(&self) -> Result<()>;

    fn intercept(&self) -> Intercept;
}
