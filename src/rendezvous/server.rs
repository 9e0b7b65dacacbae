use async_shutdown::ShutdownManager;
use natpunch_core::endpoint::Endpoint;
use natpunch_core::timer::Timer;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{channel, Receiver, Sender};

use super::RendezvousRegistry;
use crate::config::RendezvousServerConfig;
use crate::error::{Error, Result};
use crate::protocol::{Address, Body, ConnectStatus, Message, UnregisterStatus};
use crate::self_model::SelfModel;

enum ServerCommand {
    Inbound { msg: Message, remote: SocketAddr },
    Sweep,
    CompleteMove { client_id: u32 },
}

/// Handle to the rendezvous actor of an open node.
#[derive(Clone)]
pub struct RendezvousServer {
    sender: Sender<ServerCommand>,
}

impl RendezvousServer {
    pub fn start(
        config: &RendezvousServerConfig,
        me: SelfModel,
        endpoint: Endpoint<Message>,
        shutdown_manager: &ShutdownManager<()>,
    ) -> Self {
        let (sender, receiver) = channel(256);
        let timer = Timer::new(sender.clone());
        timer.schedule_periodic(config.sweep_period(), config.sweep_period(), |_| {
            ServerCommand::Sweep
        });
        let actor = ServerActor {
            registry: RendezvousRegistry::new(
                config.session_expiration_time(),
                config.max_sessions,
            ),
            me,
            endpoint,
            timer,
        };
        crate::spawn_actor("rendezvous server", shutdown_manager, actor.run(receiver));
        Self { sender }
    }

    /// Hands a request received on `remote` to the server.
    pub async fn handle(&self, msg: Message, remote: SocketAddr) -> Result<()> {
        self.sender
            .send(ServerCommand::Inbound { msg, remote })
            .await
            .map_err(|_| Error::Shutdown)
    }
}

struct ServerActor {
    registry: RendezvousRegistry,
    me: SelfModel,
    endpoint: Endpoint<Message>,
    timer: Timer<ServerCommand>,
}

impl ServerActor {
    async fn run(mut self, mut receiver: Receiver<ServerCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                ServerCommand::Inbound { msg, remote } => self.inbound(msg, remote).await,
                ServerCommand::Sweep => self.sweep().await,
                ServerCommand::CompleteMove { client_id } => {
                    if self.registry.complete_move(client_id) {
                        log::debug!("client {client_id} moved away");
                    }
                }
            }
        }
        self.timer.cancel_all();
    }

    async fn inbound(&mut self, msg: Message, remote: SocketAddr) {
        let now = Instant::now();
        let client_id = msg.src.node_id();
        let public = Address::from_socket(remote, client_id);
        let body = match &msg.body {
            Body::HpRegisterRequest { .. } => Body::HpRegisterResponse {
                status: self.registry.register(&msg.src, public, now),
            },
            Body::HpKeepAliveRequest => Body::HpKeepAliveResponse {
                status: self.registry.keepalive(client_id, public, now),
            },
            Body::HpUnregisterRequest { delay, .. } => {
                let status = self.registry.unregister(client_id, public, *delay, now);
                if status == UnregisterStatus::Success && *delay > 0 {
                    self.timer.schedule(
                        Duration::from_millis(*delay as u64),
                        ServerCommand::CompleteMove { client_id },
                    );
                }
                Body::HpUnregisterResponse { status }
            }
            Body::HpConnectRequest {
                peer,
                forwarded: false,
            } => {
                let target_id = peer.node_id();
                let status = match self.registry.connect(client_id, target_id, now) {
                    Some(target) => {
                        // the target must punch towards what we observed
                        let mut initiator = msg.src.clone();
                        initiator.addr = public;
                        let forward = Message::new(
                            self.me.vod_address(),
                            target,
                            Body::HpConnectRequest {
                                peer: initiator,
                                forwarded: true,
                            },
                        )
                        .with_timeout(msg.timeout_id);
                        self.send(forward).await;
                        ConnectStatus::Success
                    }
                    None => {
                        log::debug!("connect {client_id} -> {target_id}: unknown target");
                        ConnectStatus::UnknownTarget
                    }
                };
                Body::HpConnectResponse { status, target_id }
            }
            Body::HpDeleteConnection { remote_client_id } => {
                self.registry.delete_connection(client_id, *remote_client_id);
                return;
            }
            other => {
                log::debug!("rendezvous ignores {:?} from {remote}", other.opcode());
                return;
            }
        };
        let reply = Message::new(self.me.vod_address(), public, body).with_timeout(msg.timeout_id);
        self.send(reply).await;
    }

    async fn sweep(&mut self) {
        for entry in self.registry.sweep(Instant::now()) {
            log::info!(
                "session of {} at {} expired",
                entry.client_id,
                entry.public_address
            );
            let expire = Message::new(self.me.vod_address(), entry.public_address, Body::HpExpire);
            self.send(expire).await;
        }
    }

    async fn send(&self, msg: Message) {
        let dst = msg.dst;
        if let Err(e) = self.endpoint.send(msg).await {
            log::warn!("rendezvous send to {dst}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{KeepAliveStatus, RegisterStatus, VodAddress};
    use crate::self_model::SelfRegistry;
    use natpunch_core::endpoint::{EndpointConfig, EndpointEvent, Transport};
    use natpunch_core::nat::{AllocationPolicy, FilteringPolicy, MappingPolicy, NatDescriptor};
    use std::net::{IpAddr, Ipv4Addr};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Harness {
        server: Address,
        client: Endpoint<Message>,
        client_addr: VodAddress,
        client_events: Receiver<EndpointEvent<Message>>,
        _shutdown: ShutdownManager<()>,
    }

    async fn harness(config: RendezvousServerConfig) -> Harness {
        let shutdown = ShutdownManager::new();
        let (tx, mut server_events) = channel(64);
        let server_endpoint = Endpoint::start(EndpointConfig::default(), tx, shutdown.clone());
        let (_, port) = server_endpoint.bind(LOCALHOST, 0, Transport::Udp).await.unwrap();
        let server_addr = Address::new(Ipv4Addr::LOCALHOST, port, 1);
        let registry = SelfRegistry::new(3);
        registry.init(1, NatDescriptor::open());
        let me = SelfModel::minimal(server_addr, 0, registry);
        let server = RendezvousServer::start(&config, me, server_endpoint, &shutdown);
        tokio::spawn(async move {
            while let Some(event) = server_events.recv().await {
                if let EndpointEvent::Message { msg, remote, .. } = event {
                    _ = server.handle(msg, remote).await;
                }
            }
        });

        let (tx, client_events) = channel(64);
        let client = Endpoint::start(EndpointConfig::default(), tx, shutdown.clone());
        let (_, port) = client.bind(LOCALHOST, 0, Transport::Udp).await.unwrap();
        let nat = NatDescriptor::natted(
            MappingPolicy::EndpointIndependent,
            AllocationPolicy::PortPreservation,
            FilteringPolicy::AddressAndPortDependent,
        );
        let client_addr = VodAddress::new(Address::new(Ipv4Addr::LOCALHOST, port, 9), 0, nat)
            .with_parents([server_addr]);
        Harness {
            server: server_addr,
            client,
            client_addr,
            client_events,
            _shutdown: shutdown,
        }
    }

    impl Harness {
        async fn request(&mut self, body: Body) -> Body {
            let msg = Message::new(self.client_addr.clone(), self.server, body);
            self.client.send(msg).await.unwrap();
            self.next().await
        }

        async fn next(&mut self) -> Body {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.client_events.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if let EndpointEvent::Message { msg, .. } = event {
                    return msg.body;
                }
            }
        }
    }

    #[tokio::test]
    async fn register_keepalive_and_connect() {
        let mut h = harness(RendezvousServerConfig::default()).await;
        let body = h
            .request(Body::HpRegisterRequest {
                wait_time: 0,
                overlay_id: 0,
            })
            .await;
        assert_eq!(
            body,
            Body::HpRegisterResponse {
                status: RegisterStatus::Accepted
            }
        );
        let body = h.request(Body::HpKeepAliveRequest).await;
        assert_eq!(
            body,
            Body::HpKeepAliveResponse {
                status: KeepAliveStatus::Alive
            }
        );
        let unknown = VodAddress::new(
            Address::new(Ipv4Addr::LOCALHOST, 1, 42),
            0,
            NatDescriptor::open(),
        );
        let body = h
            .request(Body::HpConnectRequest {
                peer: unknown,
                forwarded: false,
            })
            .await;
        assert_eq!(
            body,
            Body::HpConnectResponse {
                status: ConnectStatus::UnknownTarget,
                target_id: 42
            }
        );
    }

    #[tokio::test]
    async fn expired_session_gets_expire_notice() {
        let config = RendezvousServerConfig::default()
            .set_session_expiration_time(Duration::from_millis(100))
            .set_sweep_period(Duration::from_millis(50));
        let mut h = harness(config).await;
        h.request(Body::HpRegisterRequest {
            wait_time: 0,
            overlay_id: 0,
        })
        .await;
        assert_eq!(h.next().await, Body::HpExpire);
        let body = h.request(Body::HpKeepAliveRequest).await;
        assert_eq!(
            body,
            Body::HpKeepAliveResponse {
                status: KeepAliveStatus::NotRegistered
            }
        );
    }
}
