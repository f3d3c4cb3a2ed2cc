use crate::{
    dataplane::{self, Config, DataPlane, RECONCILE_INTERVAL},
    k8s::KubeMetaClient,
    listeners::DeviceListeners,
    store::FileListenerStore,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use edgemesh_core::{Ipv4Net, LbStrategy, MetaClient, SessionConfig};
use edgemesh_host::{
    Intercept, Ip, IpCmd, IptablesCmd, NetworkBackend, PacketFilter, ResolverOverlay,
    VirtualDevice,
};
use edgemesh_index::{FakeIpPool, PortListeners, SharedListener};
use edgemesh_proxy::{dns, serve_shared, Proxy, SoOriginalDst};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "edgemesh", about = "A node-local service mesh data plane")]
pub struct Args {
    #[clap(long, default_value = "edgemesh=info,warn", env = "EDGEMESH_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The synthetic subnet from which services are assigned addresses.
    #[clap(long, default_value = "9.251.0.0/16", env = "EDGEMESH_SUBNET")]
    sub_net: Ipv4Net,

    /// The interface on which intercepted traffic arrives.
    #[clap(long, default_value = "docker0", env = "EDGEMESH_LISTEN_INTERFACE")]
    listen_interface: String,

    /// The address of the DNS responder and the intercept listener.
    ///
    /// Defaults to the first IPv4 address of the listen interface.
    #[clap(long, env = "EDGEMESH_LISTEN_IP")]
    listen_ip: Option<Ipv4Addr>,

    #[clap(long, default_value = "40001", env = "EDGEMESH_LISTEN_PORT")]
    listen_port: u16,

    #[clap(long, default_value = "RoundRobin", env = "EDGEMESH_LB_STRATEGY")]
    lb_strategy: LbStrategy,

    #[clap(long, default_value = "30")]
    session_timeout_seconds: u64,

    #[clap(long, default_value = "5")]
    successive_failed_times: u32,

    /// How intercepted traffic reaches the process.
    #[clap(long, value_enum, default_value = "iptables")]
    network_backend: Backend,

    #[clap(long, default_value = "53")]
    dns_port: u16,

    #[clap(long, default_value = "/etc/resolv.conf")]
    resolv_conf: PathBuf,

    #[clap(long, default_value = "/run/edgemesh-iptables")]
    rule_state_path: PathBuf,

    #[clap(long, default_value = "/var/lib/edgemesh/listeners.json")]
    listener_db: PathBuf,

    #[clap(long, default_value = "20")]
    cache_capacity: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Backend {
    /// NAT rules redirect the synthetic subnet to a single listener.
    Iptables,

    /// Synthetic addresses are assigned to a dummy link with a listener per port.
    Dummy,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            sub_net,
            listen_interface,
            listen_ip,
            listen_port,
            lb_strategy,
            session_timeout_seconds,
            successive_failed_times,
            network_backend,
            dns_port,
            resolv_conf,
            rule_state_path,
            listener_db,
            cache_capacity,
        } = self;

        let pool = FakeIpPool::new(sub_net).context("invalid synthetic subnet")?;
        if listen_port == 0 {
            bail!("--listen-port must not be zero");
        }
        let config = Config {
            cache_capacity,
            strategy: lb_strategy,
            session: SessionConfig {
                timeout: Duration::from_secs(session_timeout_seconds),
                successive_failures: successive_failed_times,
            },
        };

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder())
            .with_client(client)
            .build()
            .await?;
        let drain = runtime.shutdown_handle();
        // Host state is removed before connections are drained; see `dataplane::shutdown`.
        let (host_signal, host_drain) = drain::channel();
        let (serving_signal, serving) = drain::channel();

        let ip = Arc::new(IpCmd::default());
        let listen_ip = match listen_ip {
            Some(addr) => addr,
            None => ip
                .addrs(&listen_interface)
                .await
                .with_context(|| format!("failed to read addresses of {listen_interface}"))?
                .into_iter()
                .next()
                .with_context(|| format!("{listen_interface} has no IPv4 address"))?,
        };
        info!(%sub_net, %listen_ip, %listen_interface, strategy = %lb_strategy, "Starting");

        let store = FileListenerStore::open(&listener_db)?;
        let meta: Arc<dyn MetaClient> =
            Arc::new(KubeMetaClient::new(runtime.client(), Arc::new(store)));

        let mut device_listeners = None;
        let (backend, dataplane): (Arc<dyn NetworkBackend>, _) = match network_backend {
            Backend::Iptables => {
                let filter = Arc::new(PacketFilter::new(
                    Arc::new(IptablesCmd::default()),
                    ip.clone(),
                    sub_net,
                    &listen_interface,
                    SocketAddrV4::new(listen_ip, listen_port),
                    rule_state_path,
                ));
                let dataplane = DataPlane::new(meta, pool, config, |_| {
                    Arc::new(SharedListener) as Arc<dyn PortListeners>
                });
                (filter as Arc<dyn NetworkBackend>, dataplane)
            }
            Backend::Dummy => {
                let device = Arc::new(VirtualDevice::new(ip.clone()));
                let dataplane = DataPlane::new(meta, pool, config, |proxy| {
                    let listeners =
                        Arc::new(DeviceListeners::new(device.clone(), proxy, serving.clone()));
                    device_listeners = Some(listeners.clone());
                    listeners as Arc<dyn PortListeners>
                });
                (device as Arc<dyn NetworkBackend>, dataplane)
            }
        };
        backend
            .program()
            .await
            .context("failed to program the host network")?;

        let resolver = Arc::new(ResolverOverlay::new(resolv_conf, listen_ip));
        if let Err(error) = resolver.ensure().await {
            warn!(%error, "Failed to update resolver configuration");
        }

        if let Err(error) = dataplane.replay().await {
            warn!(%error, "Failed to replay services");
        }

        let events = dataplane.meta.subscribe();
        let pump = tokio::spawn(
            dataplane
                .event_pump()
                .run(events, drain.clone())
                .instrument(info_span!("events")),
        );

        let dns_socket = UdpSocket::bind((listen_ip, dns_port))
            .await
            .with_context(|| format!("failed to bind DNS responder on {listen_ip}:{dns_port}"))?;
        tokio::spawn(
            serve_dns(dns_socket, dataplane.clone(), serving.clone()).instrument(info_span!("dns")),
        );

        if let Intercept::Shared(addr) = backend.intercept() {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind intercept listener on {addr}"))?;
            tokio::spawn(
                intercept(listener, dataplane.clone(), serving.clone())
                    .instrument(info_span!("intercept")),
            );
        }

        drop(serving);
        tokio::spawn(
            dataplane::reconcile(backend, resolver, RECONCILE_INTERVAL, host_drain)
                .instrument(info_span!("reconcile")),
        );
        tokio::spawn(
            dataplane::shutdown(drain, pump, host_signal, serving_signal, device_listeners)
                .instrument(info_span!("shutdown")),
        );

        // Returns once the shutdown task has released the runtime's drain.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn serve_dns(socket: UdpSocket, dataplane: DataPlane, drain: drain::Watch) {
    if let Err(error) = dns::serve(socket, dataplane.registry, drain).await {
        warn!(%error, "DNS responder failed");
    }
}

async fn intercept(listener: TcpListener, dataplane: DataPlane, drain: drain::Watch) {
    let proxy = Proxy::new(dataplane.lb.clone());
    let res = serve_shared(listener, dataplane.registry, proxy, SoOriginalDst, drain).await;
    if let Err(error) = res {
        warn!(%error, "Intercept listener failed");
    }
}
