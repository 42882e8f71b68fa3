//! End-to-end dispatch tests for the load-balance group: mock member
//! outbounds probed against a local canary HTTP server.

use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sy_config::{
    EmptyPoolAction, HashConfig, HysteresisConfig, LoadBalanceConfig, OnEmptyKey, Strategy, TopN,
};
use sy_core::adapter::{IoStream, Outbound, OutboundGroup, OutboundRegistry};
use sy_core::balance::{LoadBalance, Tier};
use sy_core::context::InboundContext;
use sy_core::error::DispatchError;
use sy_core::pause::{PauseController, PauseManager};
use sy_core::history::HistoryStore;
use sy_core::types::{Endpoint, Host, Network};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Minimal HTTP endpoint answering every request with 204.
async fn spawn_canary() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind canary");
    let addr = listener.local_addr().expect("canary addr");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                    .await;
            });
        }
    });
    addr
}

/// Member outbound with injectable probe latency and a health switch.
struct MockOutbound {
    tag: String,
    networks: Vec<Network>,
    canary: SocketAddr,
    probe_delay: Duration,
    healthy: AtomicBool,
    dispatch_dials: AtomicUsize,
    /// Peer halves of dispatched streams, kept open for the test.
    peers: parking_lot::Mutex<Vec<tokio::io::DuplexStream>>,
}

impl MockOutbound {
    fn new(tag: &str, canary: SocketAddr, probe_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            networks: vec![Network::Tcp, Network::Udp],
            canary,
            probe_delay,
            healthy: AtomicBool::new(true),
            dispatch_dials: AtomicUsize::new(0),
            peers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn dials(&self) -> usize {
        self.dispatch_dials.load(Ordering::SeqCst)
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Outbound for MockOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn network(&self) -> Vec<Network> {
        self.networks.clone()
    }

    async fn dial(
        &self,
        _ctx: &InboundContext,
        _network: Network,
        destination: &Endpoint,
    ) -> io::Result<IoStream> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock outbound down",
            ));
        }
        if destination.port == self.canary.port() {
            // Canary probe path: add this member's artificial latency.
            tokio::time::sleep(self.probe_delay).await;
            let stream = tokio::net::TcpStream::connect(self.canary).await?;
            return Ok(Box::new(stream));
        }
        self.dispatch_dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64);
        self.peers.lock().push(server);
        Ok(Box::new(client))
    }
}

fn base_config(url: String, strategy: Strategy, primary: &[&str]) -> LoadBalanceConfig {
    LoadBalanceConfig {
        primary_outbounds: primary.iter().map(|s| s.to_string()).collect(),
        backup_outbounds: Vec::new(),
        url,
        interval: Duration::from_secs(1),
        timeout: Duration::from_secs(2),
        idle_timeout: Duration::ZERO,
        top_n: TopN {
            primary: primary.len(),
            backup: 0,
        },
        strategy,
        hash: None,
        hysteresis: HysteresisConfig::default(),
        empty_pool_action: EmptyPoolAction::Error,
        interrupt_exist_connections: false,
    }
}

fn dispatch_ctx(src: &str, fqdn: &str, port: u16) -> InboundContext {
    InboundContext {
        source: Some(src.parse().expect("source addr")),
        destination: Some(Endpoint::new(Host::domain(fqdn), port)),
        network: Some(Network::Tcp),
        ..Default::default()
    }
}

fn target() -> Endpoint {
    Endpoint::new(Host::domain("upstream.test"), 9999)
}

#[tokio::test(flavor = "multi_thread")]
async fn top_n_excludes_slowest_member() {
    let canary = spawn_canary().await;
    let url = format!("http://{canary}/generate_204");

    let registry = Arc::new(OutboundRegistry::new());
    let p1 = MockOutbound::new("p1", canary, Duration::ZERO);
    let p2 = MockOutbound::new("p2", canary, Duration::from_millis(60));
    let p3 = MockOutbound::new("p3", canary, Duration::from_millis(300));
    for outbound in [&p1, &p2, &p3] {
        registry.insert(outbound.clone());
    }

    let mut config = base_config(url, Strategy::Random, &["p1", "p2", "p3"]);
    config.top_n.primary = 2;
    let lb = LoadBalance::new("lb", config, registry).expect("construct");
    lb.start();
    lb.post_start().await;

    assert_eq!(lb.all_tags(), vec!["p1", "p2", "p3"]);
    assert_eq!(lb.now_tag(), "p1");

    let ctx = InboundContext::default();
    for _ in 0..1000 {
        lb.dial(&ctx, Network::Tcp, &target()).await.expect("dial");
    }

    assert_eq!(p3.dials(), 0, "slowest member must never be selected");
    assert_eq!(p1.dials() + p2.dials(), 1000);
    assert!(p1.dials() > 0 && p2.dials() > 0, "both top-2 members share load");
    lb.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn consistent_hash_keeps_session_affinity() {
    let canary = spawn_canary().await;
    let url = format!("http://{canary}/generate_204");

    let registry = Arc::new(OutboundRegistry::new());
    let members: Vec<Arc<MockOutbound>> = ["n1", "n2", "n3"]
        .iter()
        .map(|tag| {
            let outbound = MockOutbound::new(tag, canary, Duration::ZERO);
            registry.insert(outbound.clone());
            outbound
        })
        .collect();

    let mut config = base_config(url, Strategy::ConsistentHash, &["n1", "n2", "n3"]);
    config.hash = Some(HashConfig {
        key_parts: vec!["src_ip".into(), "etld_plus_one".into()],
        virtual_nodes: 100,
        on_empty_key: OnEmptyKey::Random,
        key_salt: String::new(),
    });
    let lb = LoadBalance::new("lb", config, registry).expect("construct");
    lb.post_start().await;

    // Same source, same eTLD+1, different FQDNs and ports.
    let first = dispatch_ctx("10.0.0.1:51000", "a.b.example.com", 443);
    let second = dispatch_ctx("10.0.0.1:52000", "c.d.example.com", 80);

    lb.dial(&first, Network::Tcp, &target()).await.expect("dial");
    let chosen: Vec<&Arc<MockOutbound>> =
        members.iter().filter(|m| m.dials() == 1).collect();
    assert_eq!(chosen.len(), 1);
    let chosen = chosen[0];

    for ctx in [&second, &first, &second] {
        lb.dial(ctx, Network::Tcp, &target()).await.expect("dial");
    }
    assert_eq!(
        chosen.dials(),
        4,
        "all dispatches with the same affinity key land on one member"
    );

    // A different source may move, but stays deterministic.
    let other = dispatch_ctx("10.9.9.9:40000", "a.b.example.com", 443);
    lb.dial(&other, Network::Tcp, &target()).await.expect("dial");
    let snapshot_total: usize = members.iter().map(|m| m.dials()).sum();
    assert_eq!(snapshot_total, 5);
    lb.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_pool_error_and_fallback() {
    // Canary port 1 refuses immediately: every probe fails, no history.
    let url = "http://127.0.0.1:1/generate_204".to_string();
    let canary: SocketAddr = "127.0.0.1:1".parse().expect("addr");

    let registry = Arc::new(OutboundRegistry::new());
    let p1 = MockOutbound::new("p1", canary, Duration::ZERO);
    registry.insert(p1.clone());

    let lb = LoadBalance::new(
        "lb-error",
        base_config(url.clone(), Strategy::Random, &["p1"]),
        registry.clone(),
    )
    .expect("construct");
    lb.post_start().await;
    let err = lb
        .dial(&InboundContext::default(), Network::Tcp, &target())
        .await
        .expect_err("no healthy candidates");
    assert!(matches!(err, DispatchError::NoHealthyCandidates));
    lb.close();

    let mut config = base_config(url, Strategy::Random, &["p1"]);
    config.empty_pool_action = EmptyPoolAction::FallbackAll;
    let lb = LoadBalance::new("lb-fallback", config, registry).expect("construct");
    lb.post_start().await;
    lb.dial(&InboundContext::default(), Network::Tcp, &target())
        .await
        .expect("fallback_all dispatches through the configured union");
    assert_eq!(p1.dials(), 1);
    lb.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn backup_tier_activates_and_recovers_with_hold() {
    let canary = spawn_canary().await;
    let url = format!("http://{canary}/generate_204");

    let registry = Arc::new(OutboundRegistry::new());
    let p1 = MockOutbound::new("p1", canary, Duration::ZERO);
    let b1 = MockOutbound::new("b1", canary, Duration::ZERO);
    registry.insert(p1.clone());
    registry.insert(b1.clone());
    p1.set_healthy(false);

    let mut config = base_config(url, Strategy::Random, &["p1"]);
    config.backup_outbounds = vec!["b1".into()];
    config.hysteresis = HysteresisConfig {
        primary_failures: 2,
        backup_hold_time: Duration::from_millis(300),
    };
    let lb = LoadBalance::new("lb", config, registry).expect("construct");

    lb.post_start().await;
    let snapshot = lb.snapshot().expect("snapshot");
    assert_eq!(snapshot.active_tier, Tier::Primary);
    assert!(snapshot.primary.is_empty());

    lb.check_outbounds().await;
    let snapshot = lb.snapshot().expect("snapshot");
    assert_eq!(snapshot.active_tier, Tier::Backup, "threshold reached");

    // Primary recovers, but the backup hold time has not elapsed yet.
    p1.set_healthy(true);
    lb.check_outbounds().await;
    assert_eq!(lb.snapshot().expect("snapshot").active_tier, Tier::Backup);

    tokio::time::sleep(Duration::from_millis(350)).await;
    lb.check_outbounds().await;
    let snapshot = lb.snapshot().expect("snapshot");
    assert_eq!(snapshot.active_tier, Tier::Primary);
    assert_eq!(snapshot.primary.len(), 1);
    lb.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_group_skips_probe_rounds() {
    let canary = spawn_canary().await;
    let url = format!("http://{canary}/generate_204");

    let registry = Arc::new(OutboundRegistry::new());
    registry.insert(MockOutbound::new("p1", canary, Duration::ZERO));

    let pause = Arc::new(PauseController::new());
    pause.pause();
    let lb = LoadBalance::with_services(
        "lb",
        base_config(url, Strategy::Random, &["p1"]),
        registry,
        Arc::new(HistoryStore::new()),
        Some(pause.clone() as Arc<dyn PauseManager>),
    )
    .expect("construct");

    lb.post_start().await;
    assert!(lb.snapshot().is_none(), "paused prober publishes nothing");

    pause.resume();
    lb.post_start().await;
    assert!(lb.snapshot().is_some());
    lb.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn tier_switch_interrupts_existing_connections() {
    let canary = spawn_canary().await;
    let url = format!("http://{canary}/generate_204");

    let registry = Arc::new(OutboundRegistry::new());
    let p1 = MockOutbound::new("p1", canary, Duration::ZERO);
    let b1 = MockOutbound::new("b1", canary, Duration::ZERO);
    registry.insert(p1.clone());
    registry.insert(b1.clone());

    let mut config = base_config(url, Strategy::Random, &["p1"]);
    config.backup_outbounds = vec!["b1".into()];
    config.interrupt_exist_connections = true;
    config.hysteresis = HysteresisConfig {
        primary_failures: 1,
        backup_hold_time: Duration::from_secs(10),
    };
    let lb = LoadBalance::new("lb", config, registry).expect("construct");
    lb.post_start().await;
    assert_eq!(lb.snapshot().expect("snapshot").active_tier, Tier::Primary);

    let mut conn = lb
        .dial(&InboundContext::default(), Network::Tcp, &target())
        .await
        .expect("dial through primary");
    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        conn.read(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Primary drops out entirely: one failing round trips the threshold.
    p1.set_healthy(false);
    lb.history().delete("p1");
    lb.check_outbounds().await;
    assert_eq!(lb.snapshot().expect("snapshot").active_tier, Tier::Backup);

    let result = reader.await.expect("reader task");
    assert_eq!(
        result.expect_err("in-flight connection torn down").kind(),
        io::ErrorKind::ConnectionReset
    );
    lb.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshots_are_never_torn_under_churn() {
    let canary = spawn_canary().await;
    let url = format!("http://{canary}/generate_204");

    let registry = Arc::new(OutboundRegistry::new());
    let members: Vec<Arc<MockOutbound>> = ["n1", "n2", "n3"]
        .iter()
        .map(|tag| {
            let outbound = MockOutbound::new(tag, canary, Duration::ZERO);
            registry.insert(outbound.clone());
            outbound
        })
        .collect();

    let mut config = base_config(url, Strategy::ConsistentHash, &["n1", "n2", "n3"]);
    config.hash = Some(HashConfig {
        key_parts: vec!["src_ip".into()],
        virtual_nodes: 50,
        on_empty_key: OnEmptyKey::HashEmpty,
        key_salt: String::new(),
    });
    // Short interval keeps histories fresh while members flap.
    config.interval = Duration::from_millis(500);
    let lb = LoadBalance::new("lb", config, registry).expect("construct");
    lb.post_start().await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let lb = lb.clone();
        let member = members[i % members.len()].clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..8 {
                let down = round % 2 == 0;
                member.set_healthy(!down);
                if down {
                    // Drop the member's history so the next round really
                    // changes the candidate membership.
                    lb.history().delete(member.tag());
                }
                lb.check_outbounds().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            member.set_healthy(true);
        }));
    }
    for _ in 0..50 {
        let lb = lb.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = dispatch_ctx("10.0.0.7:4000", "x.example.com", 443);
            for _ in 0..40 {
                if let Some(snapshot) = lb.snapshot() {
                    let active: Vec<String> = if snapshot.active_tier == Tier::Primary
                        && !snapshot.primary.is_empty()
                    {
                        snapshot.primary.iter().map(|o| o.tag().to_string()).collect()
                    } else {
                        snapshot.backup.iter().map(|o| o.tag().to_string()).collect()
                    };
                    if let Some(ring) = &snapshot.ring {
                        let ring_members: HashSet<&str> =
                            ring.members().iter().map(String::as_str).collect();
                        let active_set: HashSet<&str> =
                            active.iter().map(String::as_str).collect();
                        assert_eq!(
                            ring_members, active_set,
                            "ring membership must match the tier it was published with"
                        );
                    }
                    let _ = lb.dial(&ctx, Network::Tcp, &target()).await;
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }
    lb.close();
}
