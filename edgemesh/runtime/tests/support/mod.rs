#![allow(dead_code)]

use edgemesh_core::{memory::MemoryMetaClient, Ipv4Net, LbStrategy, Pod, Service, SessionConfig};
use edgemesh_index::{FakeIpPool, PortListeners, SharedListener};
use edgemesh_runtime::{Config, DataPlane};
use k8s_openapi::{
    api::core::v1::{Container, ContainerPort, PodSpec, PodStatus, ServicePort, ServiceSpec},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use std::sync::Arc;

pub struct TestConfig {
    pub meta: Arc<MemoryMetaClient>,
    pub dataplane: DataPlane,
    _tracing: tracing::subscriber::DefaultGuard,
}

impl TestConfig {
    pub fn new(subnet: &str) -> Self {
        Self::with_listeners(subnet, |_| Arc::new(SharedListener))
    }

    pub fn with_listeners(
        subnet: &str,
        listeners: impl FnOnce(edgemesh_proxy::Proxy) -> Arc<dyn PortListeners>,
    ) -> Self {
        let _tracing = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::DEBUG)
                .finish(),
        );
        let meta = Arc::new(MemoryMetaClient::default());
        let pool = FakeIpPool::new(subnet.parse::<Ipv4Net>().unwrap()).unwrap();
        let config = Config {
            cache_capacity: 20,
            strategy: LbStrategy::RoundRobin,
            session: SessionConfig::default(),
        };
        let dataplane = DataPlane::new(meta.clone(), pool, config, listeners);
        Self {
            meta,
            dataplane,
            _tracing,
        }
    }
}

/// Builds a service from `(port name, protocol, port, target port)` tuples.
pub fn mk_service(ns: &str, name: &str, ports: &[(&str, &str, i32, i32)]) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: Some(ns.into()),
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(name, protocol, port, target)| ServicePort {
                        name: Some(name.to_string()),
                        protocol: Some(protocol.to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*target)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mk_pod(name: &str, host_ip: &str, container_port: i32, host_port: i32) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some("default".into()),
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".into(),
                ports: Some(vec![ContainerPort {
                    container_port,
                    host_port: Some(host_port),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".into()),
            host_ip: Some(host_ip.into()),
            ..Default::default()
        }),
    }
}
