#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
pub mod dataplane;
mod k8s;
pub mod listeners;
pub mod pump;
pub mod store;

pub use self::{
    args::Args,
    dataplane::{Config, DataPlane, Replayed},
    k8s::KubeMetaClient,
    listeners::DeviceListeners,
    pump::EventPump,
    store::{FileListenerStore, StoreError},
};
