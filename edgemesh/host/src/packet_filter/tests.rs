use super::*;
use crate::fake::{FakeIp, FakeIptables};

const INBOUND: &str = "-p tcp -d 9.251.0.0/16 -i docker0 -j EDGE-MESH";
const OUTBOUND: &str = "-p tcp -d 9.251.0.0/16 -o docker0 -j EDGE-MESH";
const DNAT: &str = "-p tcp -j DNAT --to-destination 172.17.0.1:40001";

#[tokio::test]
async fn program_installs_rules_route_and_state() {
    let test = TestConfig::new();
    test.filter.program().await.unwrap();

    test.assert_programmed();
    let state = std::fs::read_to_string(test.state_path()).unwrap();
    assert_eq!(state, format!("{INBOUND}\n{DNAT}\n{OUTBOUND}\n"));
}

#[tokio::test]
async fn program_removes_rules_of_a_previous_run() {
    let test = TestConfig::new();
    let old_inbound = "-p tcp -d 9.251.0.0/16 -i eth0 -j EDGE-MESH";
    let old_outbound = "-p tcp -d 9.251.0.0/16 -o eth0 -j EDGE-MESH";
    let old_dnat = "-p tcp -j DNAT --to-destination 10.0.0.1:40001";
    test.iptables.insert_rule("PREROUTING", old_inbound);
    test.iptables.insert_rule("OUTPUT", old_outbound);
    test.iptables.insert_rule(MESH_CHAIN, old_dnat);
    test.iptables.insert_rule("OUTPUT", "-j KUBE-SERVICES");
    std::fs::write(
        test.state_path(),
        format!("{old_inbound}\n{old_dnat}\n{old_outbound}\n"),
    )
    .unwrap();

    test.filter.program().await.unwrap();

    assert_eq!(test.iptables.rules("PREROUTING").unwrap(), vec![INBOUND]);
    assert_eq!(
        test.iptables.rules("OUTPUT").unwrap(),
        vec!["-j KUBE-SERVICES", OUTBOUND]
    );
    assert_eq!(test.iptables.rules(MESH_CHAIN).unwrap(), vec![DNAT]);
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let test = TestConfig::new();
    test.filter.program().await.unwrap();
    test.iptables.take_mutations();
    test.ip.take_mutations();

    for _ in 0..2 {
        test.filter.reconcile().await.unwrap();
        assert!(test.iptables.take_mutations().is_empty());
        assert!(test.ip.take_mutations().is_empty());
    }
    test.assert_programmed();
}

#[tokio::test]
async fn reconcile_repairs_a_deleted_chain() {
    let test = TestConfig::new();
    test.filter.program().await.unwrap();

    test.iptables.force_delete_chain(MESH_CHAIN);
    test.ip.del_route(test.subnet(), test.listen_ip()).await.unwrap();
    assert!(!test.iptables.has_chain(MESH_CHAIN));
    assert!(test.iptables.rules("PREROUTING").unwrap().is_empty());

    test.filter.reconcile().await.unwrap();
    test.assert_programmed();
}

#[tokio::test]
async fn reconcile_fails_without_iptables_chain_support() {
    let test = TestConfig::new();
    test.iptables.force_delete_chain("OUTPUT");
    assert!(test.filter.reconcile().await.is_err());
}

#[tokio::test]
async fn cleanup_removes_all_host_state() {
    let test = TestConfig::new();
    test.filter.program().await.unwrap();
    test.filter.cleanup().await.unwrap();

    assert!(!test.iptables.has_chain(MESH_CHAIN));
    assert!(test.iptables.rules("PREROUTING").unwrap().is_empty());
    assert!(test.iptables.rules("OUTPUT").unwrap().is_empty());
    assert!(test.ip.routes().is_empty());
    assert!(!test.state_path().exists());
}

#[test]
fn parses_state_files() {
    let rules = MeshRules::new(
        "9.251.0.0/16".parse().unwrap(),
        "docker0",
        "172.17.0.1:40001".parse().unwrap(),
    );
    let state = rules.to_state();
    let parsed = MeshRules::parse_state(&state);
    assert_eq!(
        parsed,
        vec![(PREROUTING, rules.inbound.clone()), (OUTPUT, rules.outbound.clone())]
    );
    assert!(MeshRules::parse_state("").is_empty());
}

// === Utils ===

struct TestConfig {
    filter: PacketFilter,
    iptables: Arc<FakeIptables>,
    ip: Arc<FakeIp>,
    dir: tempfile::TempDir,
    _tracing: tracing::subscriber::DefaultGuard,
}

impl TestConfig {
    fn new() -> Self {
        let _tracing = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::TRACE)
                .finish(),
        );
        let dir = tempfile::tempdir().unwrap();
        let iptables = Arc::new(FakeIptables::default());
        let ip = Arc::new(FakeIp::default());
        let filter = PacketFilter::new(
            iptables.clone(),
            ip.clone(),
            "9.251.0.0/16".parse().unwrap(),
            "docker0",
            "172.17.0.1:40001".parse().unwrap(),
            dir.path().join("edgemesh-iptables"),
        );
        Self {
            filter,
            iptables,
            ip,
            dir,
            _tracing,
        }
    }

    fn state_path(&self) -> PathBuf {
        self.dir.path().join("edgemesh-iptables")
    }

    fn subnet(&self) -> Ipv4Net {
        "9.251.0.0/16".parse().unwrap()
    }

    fn listen_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(172, 17, 0, 1)
    }

    fn assert_programmed(&self) {
        assert_eq!(self.iptables.rules("PREROUTING").unwrap(), vec![INBOUND]);
        assert_eq!(self.iptables.rules("OUTPUT").unwrap(), vec![OUTBOUND]);
        assert_eq!(self.iptables.rules(MESH_CHAIN).unwrap(), vec![DNAT]);
        assert_eq!(self.ip.routes(), vec![(self.subnet(), self.listen_ip())]);
    }
}
