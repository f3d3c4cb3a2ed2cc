#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Shared vocabulary of the EdgeMesh data plane.
//!
//! Services are addressed by a [`ServiceKey`] and described by an ordered list of
//! [`PortDescriptor`]s. The node-local object store is reached through the [`MetaClient`] trait,
//! which also exposes the persisted [`ListenerStore`] used to remember synthetic IP assignments
//! across restarts.

mod domain;
pub mod memory;
pub mod meta;
pub mod ports;
pub mod service;
mod strategy;

pub use self::{
    domain::split_service_domain,
    meta::{ListenerStore, Message, MetaClient, Operation, ResourceKind, ResourcePath},
    ports::EncodedPorts,
    service::{Engine, PortDescriptor, ProtocolTag, ServiceKey, TargetPort},
    strategy::{LbStrategy, SessionConfig},
};
pub use ipnet::Ipv4Net;
pub use k8s_openapi::api::core::v1::{Pod, Service};
