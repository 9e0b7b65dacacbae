use super::*;
use crate::config::ParentMakerConfig;
use crate::rendezvous::RendezvousServer;
use crate::self_model::SelfRegistry;
use natpunch_core::endpoint::{EndpointConfig, EndpointEvent};
use natpunch_core::nat::{AllocationPolicy, FilteringPolicy, NatDescriptor};
use std::net::{IpAddr, Ipv4Addr};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn natted(mapping: MappingPolicy) -> NatDescriptor {
    NatDescriptor::natted(
        mapping,
        AllocationPolicy::PortPreservation,
        FilteringPolicy::AddressAndPortDependent,
    )
}

struct Node {
    hp: HolePunchClient,
    endpoint: Endpoint<Message>,
    me: SelfModel,
    events: Receiver<HpEvent>,
    _shutdown: ShutdownManager<()>,
}

impl Node {
    async fn start(node_id: u32, nat: NatDescriptor, config: NatConfig) -> Node {
        let shutdown = ShutdownManager::new();
        let (tx, mut endpoint_events) = channel(64);
        let endpoint = Endpoint::start(EndpointConfig::default(), tx, shutdown.clone());
        let (_, port) = endpoint.bind(LOCALHOST, 0, Transport::Udp).await.unwrap();
        let registry = SelfRegistry::new(3);
        registry.init(node_id, nat);
        let me = SelfModel::minimal(Address::new(Ipv4Addr::LOCALHOST, port, node_id), 0, registry);
        let (events_tx, events) = channel(64);
        let hp = HolePunchClient::start(&config, me.clone(), endpoint.clone(), events_tx, &shutdown);
        let inbound = hp.clone();
        tokio::spawn(async move {
            while let Some(event) = endpoint_events.recv().await {
                if let EndpointEvent::Message {
                    msg, remote, local, ..
                } = event
                {
                    _ = inbound.inbound(msg, remote, local).await;
                }
            }
        });
        Node {
            hp,
            endpoint,
            me,
            events,
            _shutdown: shutdown,
        }
    }

    async fn next(&mut self) -> HpEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn adopt_parent(&self, parent: Address) {
        assert!(self.me.registry().add_parent(self.me.node_id(), parent));
    }
}

/// An open node running only the rendezvous server.
async fn rendezvous(node_id: u32, shutdown: &ShutdownManager<()>) -> Address {
    let (tx, mut endpoint_events) = channel(64);
    let endpoint = Endpoint::start(EndpointConfig::default(), tx, shutdown.clone());
    let (_, port) = endpoint.bind(LOCALHOST, 0, Transport::Udp).await.unwrap();
    let addr = Address::new(Ipv4Addr::LOCALHOST, port, node_id);
    let registry = SelfRegistry::new(3);
    registry.init(node_id, NatDescriptor::open());
    let me = SelfModel::minimal(addr, 0, registry);
    let server = RendezvousServer::start(&Default::default(), me, endpoint, shutdown);
    tokio::spawn(async move {
        while let Some(event) = endpoint_events.recv().await {
            if let EndpointEvent::Message { msg, remote, .. } = event {
                _ = server.handle(msg, remote).await;
            }
        }
    });
    addr
}

#[tokio::test]
async fn no_parents_fails_without_sending() {
    let mut node =
        Node::start(10, natted(MappingPolicy::EndpointIndependent), NatConfig::default()).await;
    let target = VodAddress::new(
        Address::new(Ipv4Addr::LOCALHOST, 9, 20),
        0,
        natted(MappingPolicy::AddressAndPortDependent),
    );
    node.hp.connect(target).await.unwrap();
    match node.next().await {
        HpEvent::Failed { key, error, .. } => {
            assert_eq!(key, (20, 0));
            assert!(matches!(error, Error::NoParents { node_id: 20 }));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(node.endpoint.total_written_bytes(), 0);
    assert_eq!(node.hp.state((20, 0)).await.unwrap(), None);
}

#[tokio::test]
async fn retries_exhaust_and_release_ports() {
    let config = NatConfig::default().set_hp_client(
        HpClientConfig::default()
            .set_rto(Duration::from_millis(100))
            .set_rto_scale(1.2)
            .set_rto_retries(3),
    );
    let mut node = Node::start(10, natted(MappingPolicy::EndpointIndependent), config).await;
    // swallows everything without answering
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let black_hole = silent.local_addr().unwrap();
    let parent = Address::from_socket(black_hole, 99);
    node.adopt_parent(parent);
    let main_port = node.me.address().port;

    let target = VodAddress::new(
        Address::from_socket(black_hole, 20),
        0,
        natted(MappingPolicy::AddressAndPortDependent),
    )
    .with_parents([parent]);
    let started = Instant::now();
    node.hp.connect(target).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.endpoint.ports(Transport::Udp).await.unwrap().len(), 2);
    assert_eq!(
        node.hp.state((20, 0)).await.unwrap(),
        Some(HandshakeState::ConnectRequested)
    );

    match node.next().await {
        HpEvent::Failed { error, .. } => {
            assert!(matches!(error, Error::HandshakeTimeout { node_id: 20 }))
        }
        other => panic!("unexpected {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(360), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert_eq!(
        node.endpoint.ports(Transport::Udp).await.unwrap(),
        BTreeSet::from([main_port])
    );
    drop(silent);
}

#[tokio::test]
async fn probe_measures_round_trip() {
    let mut prober = Node::start(10, NatDescriptor::open(), NatConfig::default()).await;
    let target = Node::start(20, NatDescriptor::open(), NatConfig::default()).await;
    let dst = target.me.address();
    prober.hp.probe(dst).await.unwrap();
    match prober.next().await {
        HpEvent::ProbeSucceeded { dst: probed, rtt } => {
            assert_eq!(probed, dst);
            assert!(rtt < Duration::from_secs(1));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn open_target_needs_no_parent() {
    let mut a = Node::start(10, NatDescriptor::open(), NatConfig::default()).await;
    let b = Node::start(20, NatDescriptor::open(), NatConfig::default()).await;
    a.hp.connect(b.me.vod_address()).await.unwrap();
    match a.next().await {
        HpEvent::Verified { key, path, .. } => {
            assert_eq!(key, (20, 0));
            assert_eq!(path.remote, b.me.address().socket_addr());
            assert_eq!(path.local_port, a.me.address().port);
        }
        other => panic!("unexpected {other:?}"),
    }
    // cached from now on
    a.hp.connect(b.me.vod_address()).await.unwrap();
    assert!(matches!(a.next().await, HpEvent::Verified { .. }));
    assert_eq!(
        a.hp.state((20, 0)).await.unwrap(),
        Some(HandshakeState::Verified)
    );
}

#[tokio::test]
async fn handshake_through_rendezvous() {
    let shutdown = ShutdownManager::new();
    let server = rendezvous(1, &shutdown).await;
    let config = NatConfig::default()
        .set_parent_maker(ParentMakerConfig::default().set_servers(vec![server]));
    let nat = natted(MappingPolicy::EndpointIndependent);
    let mut a = Node::start(10, nat, config.clone()).await;
    let mut b = Node::start(20, nat, config).await;

    for node in [&mut a, &mut b] {
        node.hp.start_parent_maker().await.unwrap();
        match node.next().await {
            HpEvent::ParentRegistered(parent) => {
                assert_eq!(parent, server);
                node.adopt_parent(parent);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    a.hp.connect(b.me.vod_address()).await.unwrap();
    match a.next().await {
        HpEvent::Verified { key, path, .. } => {
            assert_eq!(key, (20, 0));
            assert_eq!(path.remote, b.me.address().socket_addr());
        }
        other => panic!("unexpected {other:?}"),
    }
    match b.next().await {
        HpEvent::Verified { key, .. } => assert_eq!(key, (10, 0)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn unknown_target_at_every_parent_fails() {
    let shutdown = ShutdownManager::new();
    let server = rendezvous(1, &shutdown).await;
    let mut a = Node::start(10, natted(MappingPolicy::EndpointIndependent), NatConfig::default()).await;
    a.adopt_parent(server);
    // registered nowhere and never answers pings
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = VodAddress::new(
        Address::from_socket(silent.local_addr().unwrap(), 20),
        0,
        natted(MappingPolicy::EndpointIndependent),
    )
    .with_parents([server]);
    a.hp.connect(target).await.unwrap();
    match a.next().await {
        HpEvent::Failed { error, .. } => {
            assert!(matches!(error, Error::UnknownTarget { node_id: 20 }))
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn unregister_reports_lost_parents() {
    let shutdown = ShutdownManager::new();
    let server = rendezvous(1, &shutdown).await;
    let config = NatConfig::default()
        .set_parent_maker(ParentMakerConfig::default().set_servers(vec![server]));
    let mut a = Node::start(10, natted(MappingPolicy::EndpointIndependent), config).await;
    a.hp.start_parent_maker().await.unwrap();
    assert!(matches!(a.next().await, HpEvent::ParentRegistered(_)));
    a.hp.unregister().await.unwrap();
    match a.next().await {
        HpEvent::ParentLost(parent) => assert_eq!(parent, server),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn open_node_makes_no_parents() {
    let shutdown = ShutdownManager::new();
    let server = rendezvous(1, &shutdown).await;
    let config = NatConfig::default()
        .set_parent_maker(ParentMakerConfig::default().set_servers(vec![server]));
    let mut a = Node::start(10, NatDescriptor::open(), config).await;
    a.hp.start_parent_maker().await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), a.events.recv())
            .await
            .is_err()
    );
    assert_eq!(a.endpoint.total_written_bytes(), 0);
}

/// Two nodes registered with one rendezvous server, each knowing its parent.
async fn registered_pair(
    shutdown: &ShutdownManager<()>,
    nat: NatDescriptor,
    hp_client: HpClientConfig,
) -> (Node, Node) {
    let server = rendezvous(1, shutdown).await;
    let config = NatConfig::default()
        .set_hp_client(hp_client)
        .set_parent_maker(ParentMakerConfig::default().set_servers(vec![server]));
    let mut a = Node::start(10, nat, config.clone()).await;
    let mut b = Node::start(20, nat, config).await;
    for node in [&mut a, &mut b] {
        node.hp.start_parent_maker().await.unwrap();
        match node.next().await {
            HpEvent::ParentRegistered(parent) => node.adopt_parent(parent),
            other => panic!("unexpected {other:?}"),
        }
    }
    (a, b)
}

#[tokio::test]
async fn expired_path_releases_punch_port() {
    let shutdown = ShutdownManager::new();
    let hp_client = HpClientConfig::default().set_path_ttl(Duration::from_millis(300));
    let (mut a, b) = registered_pair(
        &shutdown,
        natted(MappingPolicy::AddressAndPortDependent),
        hp_client,
    )
    .await;
    let main_port = a.me.address().port;

    a.hp.connect(b.me.vod_address()).await.unwrap();
    let path = match a.next().await {
        HpEvent::Verified { path, .. } => path,
        other => panic!("unexpected {other:?}"),
    };
    assert_ne!(path.local_port, main_port);
    assert_eq!(
        a.endpoint.ports(Transport::Udp).await.unwrap(),
        BTreeSet::from([main_port, path.local_port])
    );

    match a.next().await {
        HpEvent::PathClosed { key, path: closed } => {
            assert_eq!(key, (20, 0));
            assert_eq!(closed, path);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        a.endpoint.ports(Transport::Udp).await.unwrap(),
        BTreeSet::from([main_port])
    );
    assert_eq!(a.hp.state((20, 0)).await.unwrap(), None);
}

#[tokio::test]
async fn forwarded_request_replaces_cached_path() {
    let shutdown = ShutdownManager::new();
    let (mut a, mut b) = registered_pair(
        &shutdown,
        natted(MappingPolicy::AddressAndPortDependent),
        HpClientConfig::default(),
    )
    .await;
    let main_port = a.me.address().port;

    a.hp.connect(b.me.vod_address()).await.unwrap();
    let first = match a.next().await {
        HpEvent::Verified { path, .. } => path,
        other => panic!("unexpected {other:?}"),
    };
    assert!(matches!(b.next().await, HpEvent::Verified { .. }));

    // b forgets its side and punches again, a answers from its main port
    b.hp.close_path((10, 0)).await.unwrap();
    assert!(matches!(b.next().await, HpEvent::PathClosed { .. }));
    b.hp.connect(a.me.vod_address()).await.unwrap();
    match a.next().await {
        HpEvent::PathClosed { path, .. } => assert_eq!(path, first),
        other => panic!("unexpected {other:?}"),
    }
    match a.next().await {
        HpEvent::Verified { path, .. } => assert_eq!(path.local_port, main_port),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        a.endpoint.ports(Transport::Udp).await.unwrap(),
        BTreeSet::from([main_port])
    );
}

#[tokio::test]
async fn unregister_closes_paths() {
    let mut a = Node::start(10, NatDescriptor::open(), NatConfig::default()).await;
    let b = Node::start(20, NatDescriptor::open(), NatConfig::default()).await;
    a.hp.connect(b.me.vod_address()).await.unwrap();
    assert!(matches!(a.next().await, HpEvent::Verified { .. }));
    a.hp.unregister().await.unwrap();
    match a.next().await {
        HpEvent::PathClosed { key, .. } => assert_eq!(key, (20, 0)),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(a.hp.state((20, 0)).await.unwrap(), None);
}

#[tokio::test]
async fn expire_notice_registers_again() {
    let shutdown = ShutdownManager::new();
    let server = rendezvous(1, &shutdown).await;
    let config = NatConfig::default()
        .set_parent_maker(ParentMakerConfig::default().set_servers(vec![server]));
    let mut a = Node::start(10, natted(MappingPolicy::EndpointIndependent), config).await;
    a.hp.start_parent_maker().await.unwrap();
    assert!(matches!(a.next().await, HpEvent::ParentRegistered(_)));

    let expire = Message::new(
        VodAddress::new(server, 0, NatDescriptor::open()),
        a.me.address(),
        Body::HpExpire,
    );
    a.hp.inbound(expire, server.socket_addr(), a.me.address().socket_addr())
        .await
        .unwrap();
    match a.next().await {
        HpEvent::ParentLost(parent) => assert_eq!(parent, server),
        other => panic!("unexpected {other:?}"),
    }
    match a.next().await {
        HpEvent::ParentRegistered(parent) => assert_eq!(parent, server),
        other => panic!("unexpected {other:?}"),
    }
}
