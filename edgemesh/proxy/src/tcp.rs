use crate::lb::{Backend, LoadBalancer};
use edgemesh_core::ServiceKey;
use std::{io, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::TcpStream,
};
use tracing::{debug, info, trace, warn};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
pub const DIAL_ATTEMPTS: usize = 3;

const BUFFER_SIZE: usize = 8 * 1024;

/// Proxies a connection to a backend of `key` chosen by the load balancer.
///
/// Each attempt picks a backend anew; the inbound connection is dropped once every attempt has
/// failed.
pub async fn serve(
    lb: &LoadBalancer,
    inbound: TcpStream,
    client: SocketAddr,
    key: &ServiceKey,
    port: u16,
) {
    let session = client.ip().to_string();
    let Some((backend, outbound)) = dial(lb, key, port, &session).await else {
        warn!(%key, %port, attempts = DIAL_ATTEMPTS, "Failed to reach a backend");
        return;
    };
    debug!(%key, pod = %backend.pod, addr = %backend.addr, "Connected");

    match duplex(inbound, outbound).await {
        Ok((sent, received)) => trace!(%sent, %received, "Connection closed"),
        Err(error) => debug!(%error, "Connection failed"),
    }
}

/// Connects to a backend, retrying with a fresh pick after each failure.
async fn dial(
    lb: &LoadBalancer,
    key: &ServiceKey,
    port: u16,
    session: &str,
) -> Option<(Backend, TcpStream)> {
    for attempt in 1..=DIAL_ATTEMPTS {
        let backend = match lb.pick(key, port, Some(session)).await {
            Ok(backend) => backend,
            Err(error) => {
                info!(%error, attempt, "Failed to pick a backend");
                continue;
            }
        };
        match connect(backend.addr).await {
            Ok(stream) => {
                lb.report(key, session, true);
                return Some((backend, stream));
            }
            Err(error) => {
                info!(addr = %backend.addr, %error, attempt, "Failed to connect");
                lb.report(key, session, false);
            }
        }
    }
    None
}

/// Connects to a backend, giving up after [`DIAL_TIMEOUT`].
pub(crate) async fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Copies bytes in both directions until either side finishes, then closes both connections.
///
/// Returns the byte counts of the direction that finished; the other direction reports zero.
async fn duplex(inbound: TcpStream, outbound: TcpStream) -> io::Result<(u64, u64)> {
    let (client_rx, mut client_tx) = inbound.into_split();
    let (server_rx, mut server_tx) = outbound.into_split();
    tokio::select! {
        res = copy(client_rx, &mut server_tx) => res.map(|n| (n, 0)),
        res = copy(server_rx, &mut client_tx) => res.map(|n| (0, n)),
    }
}

async fn copy<R, W>(src: R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut src = BufReader::with_capacity(BUFFER_SIZE, src);
    tokio::io::copy_buf(&mut src, dst).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::tests::{mk_pod, mk_service};
    use edgemesh_core::{memory::MemoryMetaClient, LbStrategy, SessionConfig};
    use edgemesh_index::ObjectCache;
    use std::sync::Arc;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    fn lb(backend_port: u16) -> (LoadBalancer, ServiceKey) {
        let meta = Arc::new(MemoryMetaClient::default());
        meta.put_service(mk_service("web", &[("tcp", 80, 8080)]));
        let key = ServiceKey::new("default", "web");
        meta.put_pods(
            key.clone(),
            vec![mk_pod(
                "web-0",
                "Running",
                "127.0.0.1",
                8080,
                Some(backend_port.into()),
            )],
        );
        let lb = LoadBalancer::new(
            meta,
            Arc::new(ObjectCache::default()),
            LbStrategy::RoundRobin,
            SessionConfig::default(),
        );
        (lb, key)
    }

    async fn echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut rx, mut tx) = stream.split();
                    let _ = tokio::io::copy(&mut rx, &mut tx).await;
                });
            }
        });
        addr
    }

    /// Returns a proxied client connection.
    async fn proxied(lb: LoadBalancer, key: ServiceKey) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, client) = listener.accept().await.unwrap();
            serve(&lb, stream, client, &key, 80).await;
        });
        TcpStream::connect(addr).await.unwrap()
    }

    #[tokio::test]
    async fn proxies_bytes_both_ways() {
        let backend = echo().await;
        let (lb, key) = lb(backend.port());
        let mut client = proxied(lb, key).await;

        for msg in [&b"ping"[..], &[7u8; 3 * BUFFER_SIZE][..]] {
            client.write_all(msg).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, msg);
        }
    }

    #[tokio::test]
    async fn closes_the_client_when_no_backend_answers() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (lb, key) = lb(closed.port());
        let mut client = proxied(lb, key).await;

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn closes_the_client_when_the_service_is_unknown() {
        let lb = LoadBalancer::new(
            Arc::new(MemoryMetaClient::default()),
            Arc::new(ObjectCache::default()),
            LbStrategy::RoundRobin,
            SessionConfig::default(),
        );
        let mut client = proxied(lb, ServiceKey::new("default", "missing")).await;
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }
}
