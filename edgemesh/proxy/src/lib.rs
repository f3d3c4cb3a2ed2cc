#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The EdgeMesh traffic path: a DNS responder that resolves service names to synthetic IPs, and
//! the proxies that carry intercepted connections to the pods behind them.

pub mod dns;
pub mod http;
pub mod intercept;
pub mod lb;
pub mod orig_dst;
pub mod tcp;

pub use self::{
    intercept::{serve_port, serve_shared, Proxy},
    lb::{Backend, LbError, LoadBalancer},
    orig_dst::{GetOriginalDst, LocalAddr, SoOriginalDst},
};
