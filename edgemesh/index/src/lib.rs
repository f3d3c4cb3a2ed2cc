#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Node-local indexes of the EdgeMesh data plane.
//!
//! The [`Registry`] maps services to the synthetic IPs handed out by the [`FakeIpPool`]; the
//! [`ObjectCache`] holds recently seen service and pod-list snapshots for the load balancer.

pub mod allocator;
pub mod cache;
pub mod registry;

pub use self::{
    allocator::{FakeIpPool, InvalidSubnet, PoolStats},
    cache::ObjectCache,
    registry::{BindError, Binding, PortListeners, Rebound, Registry, SharedListener, SharedRegistry},
};
