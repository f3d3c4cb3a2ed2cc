use crate::{http, lb::LoadBalancer, orig_dst::GetOriginalDst, tcp};
use edgemesh_core::{Engine, PortDescriptor, ServiceKey};
use edgemesh_index::Registry;
use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, debug_span, info, warn, Instrument};

/// Hands intercepted connections to the engine that serves their port.
#[derive(Clone, Debug)]
pub struct Proxy {
    lb: Arc<LoadBalancer>,
}

// === impl Proxy ===

impl Proxy {
    pub fn new(lb: Arc<LoadBalancer>) -> Self {
        Self { lb }
    }

    pub fn lb(&self) -> &Arc<LoadBalancer> {
        &self.lb
    }

    pub async fn serve(
        &self,
        stream: TcpStream,
        client: SocketAddr,
        key: ServiceKey,
        desc: PortDescriptor,
    ) {
        match desc.tag.engine() {
            Engine::Http => http::serve(self.lb.clone(), stream, client, key, desc.port).await,
            Engine::Tcp => tcp::serve(&self.lb, stream, client, &key, desc.port).await,
        }
    }
}

/// Accepts every redirected connection on a single listener, resolving each one's service from
/// its original destination.
pub async fn serve_shared<O>(
    listener: TcpListener,
    registry: Arc<Registry>,
    proxy: Proxy,
    orig_dst: O,
    drain: drain::Watch,
) -> io::Result<()>
where
    O: GetOriginalDst + 'static,
{
    accept(listener, proxy, drain, move |stream| {
        let Some(dst) = orig_dst.get_original_dst(stream) else {
            warn!("Connection has no original destination");
            return None;
        };
        let IpAddr::V4(ip) = dst.ip() else {
            debug!(%dst, "Ignoring IPv6 destination");
            return None;
        };
        let Some(encoded) = registry.lookup_ports(ip) else {
            debug!(%dst, "No service bound to destination");
            return None;
        };
        let route = encoded.find(dst.port());
        if route.is_none() {
            debug!(%dst, ports = %encoded, "Service has no such port");
        }
        route
    })
    .await
}

/// Accepts connections for one port of one service.
pub async fn serve_port(
    listener: TcpListener,
    key: ServiceKey,
    desc: PortDescriptor,
    proxy: Proxy,
    drain: drain::Watch,
) -> io::Result<()> {
    accept(listener, proxy, drain, move |_| {
        Some((key.clone(), desc.clone()))
    })
    .await
}

async fn accept<F>(
    listener: TcpListener,
    proxy: Proxy,
    drain: drain::Watch,
    mut route: F,
) -> io::Result<()>
where
    F: FnMut(&TcpStream) -> Option<(ServiceKey, PortDescriptor)>,
{
    let addr = listener.local_addr()?;
    info!(%addr, "Proxy listening");
    let signaled = drain.signaled();
    tokio::pin!(signaled);
    loop {
        let (stream, client) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%addr, %error, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut signaled => {
                debug!(%addr, "Proxy shutting down");
                return Ok(());
            }
        };
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%error, "Failed to set TCP_NODELAY");
        }
        let Some((key, desc)) = route(&stream) else {
            continue;
        };
        let proxy = proxy.clone();
        let span = debug_span!("conn", %client, service = %key, port = desc.port);
        tokio::spawn(async move { proxy.serve(stream, client, key, desc).await }.instrument(span));
    }
}
