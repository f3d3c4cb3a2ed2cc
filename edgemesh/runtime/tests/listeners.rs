mod support;

use edgemesh_core::{Ipv4Net, Message, Operation, ServiceKey};
use edgemesh_host::{Ip, VirtualDevice, DEVICE_NAME};
use edgemesh_runtime::DeviceListeners;
use parking_lot::Mutex;
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use support::{mk_pod, mk_service, TestConfig};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

const SERVICE_PORT: u16 = 31080;

/// Records assigned addresses without touching the host. The test pool lives in 127/8, which
/// the loopback device already answers for.
#[derive(Default)]
struct LoopbackIp {
    addrs: Mutex<Vec<(String, Ipv4Addr)>>,
}

#[async_trait::async_trait]
impl Ip for LoopbackIp {
    async fn has_route(&self, _: Ipv4Net, _: Ipv4Addr) -> edgemesh_host::Result<bool> {
        Ok(true)
    }

    async fn add_route(&self, _: Ipv4Net, _: Ipv4Addr) -> edgemesh_host::Result<()> {
        Ok(())
    }

    async fn del_route(&self, _: Ipv4Net, _: Ipv4Addr) -> edgemesh_host::Result<()> {
        Ok(())
    }

    async fn has_link(&self, _: &str) -> edgemesh_host::Result<bool> {
        Ok(true)
    }

    async fn add_dummy_link(&self, _: &str) -> edgemesh_host::Result<()> {
        Ok(())
    }

    async fn del_link(&self, _: &str) -> edgemesh_host::Result<()> {
        Ok(())
    }

    async fn addrs(&self, name: &str) -> edgemesh_host::Result<Vec<Ipv4Addr>> {
        Ok(self
            .addrs
            .lock()
            .iter()
            .filter(|(link, _)| link == name)
            .map(|(_, addr)| *addr)
            .collect())
    }

    async fn add_addr(&self, name: &str, addr: Ipv4Addr) -> edgemesh_host::Result<()> {
        self.addrs.lock().push((name.to_string(), addr));
        Ok(())
    }
}

async fn echo_backend() -> SocketAddr {
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

async fn connect(addr: SocketAddr) -> TcpStream {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("listener must start")
}

#[tokio::test]
async fn binds_a_listener_per_service_port() {
    let ip = Arc::new(LoopbackIp::default());
    let device = Arc::new(VirtualDevice::new(ip.clone()));
    let (signal, watch) = drain::channel();

    let mut listeners = None;
    let test = TestConfig::with_listeners("127.77.0.0/16", |proxy| {
        let l = Arc::new(DeviceListeners::new(device.clone(), proxy, watch.clone()));
        listeners = Some(l.clone());
        l
    });
    let listeners = listeners.unwrap();

    let backend = echo_backend().await;
    let key = ServiceKey::new("default", "echo");
    let svc = mk_service(
        "default",
        "echo",
        &[("tcp", "TCP", SERVICE_PORT as i32, 7000)],
    );
    test.meta.put_service(svc.clone());
    test.meta.put_pods(
        key.clone(),
        vec![mk_pod("echo-0", "127.0.0.1", 7000, backend.port() as i32)],
    );

    let pump = test.dataplane.event_pump();
    pump.handle(&Message::service(Operation::Insert, &svc).unwrap());
    let bound = Ipv4Addr::new(127, 77, 0, 1);
    assert_eq!(test.dataplane.registry.lookup_ip(&key), Some(bound));
    assert_eq!(listeners.len(), 1);

    let mut stream = connect(SocketAddr::from((bound, SERVICE_PORT))).await;
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(ip.addrs(DEVICE_NAME).await.unwrap(), vec![bound]);
    drop(stream);

    pump.handle(&Message::service(Operation::Delete, &svc).unwrap());
    assert!(listeners.is_empty());
    tokio::time::timeout(Duration::from_secs(5), async {
        while TcpStream::connect(SocketAddr::from((bound, SERVICE_PORT)))
            .await
            .is_ok()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener must stop");

    drop(test);
    signal.drain().await;
}

#[tokio::test]
async fn rebinding_starts_and_stops_changed_ports() {
    let device = Arc::new(VirtualDevice::new(Arc::new(LoopbackIp::default())));
    let (_signal, watch) = drain::channel();

    let mut listeners = None;
    let test = TestConfig::with_listeners("127.78.0.0/16", |proxy| {
        let l = Arc::new(DeviceListeners::new(device.clone(), proxy, watch.clone()));
        listeners = Some(l.clone());
        l
    });
    let listeners = listeners.unwrap();
    let pump = test.dataplane.event_pump();

    let svc = mk_service(
        "default",
        "web",
        &[("http", "TCP", 31081, 8080), ("http-admin", "TCP", 31082, 9990)],
    );
    pump.handle(&Message::service(Operation::Insert, &svc).unwrap());
    assert_eq!(listeners.len(), 2);

    let svc = mk_service("default", "web", &[("http", "TCP", 31081, 8080)]);
    pump.handle(&Message::service(Operation::Update, &svc).unwrap());
    assert_eq!(listeners.len(), 1);
}

#[tokio::test]
async fn a_changed_protocol_restarts_the_listener() {
    let device = Arc::new(VirtualDevice::new(Arc::new(LoopbackIp::default())));
    let (_signal, watch) = drain::channel();

    let mut listeners = None;
    let test = TestConfig::with_listeners("127.79.0.0/16", |proxy| {
        let l = Arc::new(DeviceListeners::new(device.clone(), proxy, watch.clone()));
        listeners = Some(l.clone());
        l
    });
    let listeners = listeners.unwrap();
    let pump = test.dataplane.event_pump();

    let backend = echo_backend().await;
    let key = ServiceKey::new("default", "echo");
    test.meta.put_pods(
        key.clone(),
        vec![mk_pod("echo-0", "127.0.0.1", 7000, backend.port() as i32)],
    );
    let svc = mk_service("default", "echo", &[("tcp", "TCP", 31083, 7000)]);
    test.meta.put_service(svc.clone());
    pump.handle(&Message::service(Operation::Insert, &svc).unwrap());
    let addr = SocketAddr::from((Ipv4Addr::new(127, 79, 0, 1), 31083));

    // A raw TCP listener echoes the request back.
    let request = b"GET / HTTP/1.1\r\nHost: echo.default\r\n\r\n";
    let reply = exchange(addr, request).await;
    assert!(reply.starts_with("GET / HTTP/1.1"), "{reply}");

    let svc = mk_service("default", "echo", &[("http", "TCP", 31083, 7000)]);
    test.meta.put_service(svc.clone());
    pump.handle(&Message::service(Operation::Update, &svc).unwrap());
    assert_eq!(listeners.len(), 1);

    // The HTTP engine rejects the echoed request as a response.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let reply = exchange(addr, request).await;
            if reply.starts_with("HTTP/1.1 503") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener must restart with the new protocol");
}

/// Writes `request` and reads whatever arrives before the peer pauses or closes.
async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = connect(addr).await;
    if stream.write_all(request).await.is_err() {
        return String::new();
    }
    let mut buf = vec![0u8; 1024];
    match tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf)).await {
        Ok(Ok(n)) => String::from_utf8_lossy(&buf[..n]).into_owned(),
        _ => String::new(),
    }
}

#[tokio::test]
async fn closing_releases_the_drain_watch() {
    let device = Arc::new(VirtualDevice::new(Arc::new(LoopbackIp::default())));
    let (signal, watch) = drain::channel();

    let mut listeners = None;
    let test = TestConfig::with_listeners("127.80.0.0/16", |proxy| {
        let l = Arc::new(DeviceListeners::new(device.clone(), proxy, watch));
        listeners = Some(l.clone());
        l
    });
    let listeners = listeners.unwrap();

    listeners.close();
    let svc = mk_service("default", "web", &[("tcp", "TCP", 31084, 8080)]);
    test.dataplane
        .event_pump()
        .handle(&Message::service(Operation::Insert, &svc).unwrap());
    assert!(listeners.is_empty());

    // The data plane is still alive, yet draining completes.
    tokio::time::timeout(Duration::from_secs(5), signal.drain())
        .await
        .expect("drain must complete once closed");
}
