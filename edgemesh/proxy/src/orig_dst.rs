use socket2::SockRef;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Recovers the synthetic `ip:port` an intercepted connection was addressed to.
///
/// The shared intercept listener routes each accepted connection by this address; tests
/// substitute a fixed destination for the kernel's.
pub trait GetOriginalDst: Send + Sync {
    fn get_original_dst(&self, socket: &TcpStream) -> Option<SocketAddr>;
}

/// Reads the destination a connection had before it was redirected by the packet filter.
#[derive(Copy, Clone, Debug, Default)]
pub struct SoOriginalDst;

impl GetOriginalDst for SoOriginalDst {
    #[cfg(not(target_os = "linux"))]
    fn get_original_dst(&self, _: &TcpStream) -> Option<SocketAddr> {
        debug!("no support for SO_ORIGINAL_DST");
        None
    }

    #[cfg(target_os = "linux")]
    fn get_original_dst(&self, sock: &TcpStream) -> Option<SocketAddr> {
        trace!(?sock, "get_original_dst");
        match SockRef::from(sock).original_dst() {
            Ok(addr) => addr.as_socket(),
            Err(error) => {
                debug!(%error, "Failed to read SO_ORIGINAL_DST");
                None
            }
        }
    }
}

/// Reports the connection's local address, which is the original destination when connections
/// arrive on per-address listeners.
#[derive(Copy, Clone, Debug, Default)]
pub struct LocalAddr;

impl GetOriginalDst for LocalAddr {
    fn get_original_dst(&self, sock: &TcpStream) -> Option<SocketAddr> {
        sock.local_addr().ok()
    }
}
