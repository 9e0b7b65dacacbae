//! The node-level façade.
//!
//! [`NatTraverser`] owns the endpoint and wires the other actors together:
//! outbound messages go straight to open destinations, over a cached direct
//! path, or wait in a queue while the hole-punching client opens one.
//! Inbound frames are routed by opcode to the STUN client, the server role
//! (open nodes only), the hole-punching client or the application.

use async_shutdown::ShutdownManager;
use natpunch_core::endpoint::{
    BandwidthStats, BindStatus, Endpoint, EndpointEvent, Transport,
};
use natpunch_core::nat::NatDescriptor;
use natpunch_core::timer::TimeoutId;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;

use crate::config::NatConfig;
use crate::error::{Error, Result};
use crate::hole_punch::{DirectPath, HandshakeKey, HolePunchClient, HpEvent};
use crate::protocol::{Address, Body, Message, VodAddress};
use crate::rendezvous::RendezvousServer;
use crate::self_model::{SelfModel, SelfRegistry};
use crate::stun::{PortMapper, StunClient, StunReply, StunResponder};

const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum TraverserEvent {
    /// An application message (`ConnectionPing`, `ConnectionPong`, `Data`).
    Delivered(Message),
    Unreachable {
        dst: Address,
        reason: Error,
    },
    Verified {
        dst: VodAddress,
        path: DirectPath,
    },
    NatClassified(NatDescriptor),
    ParentsChanged(Vec<Address>),
    ProbeSucceeded {
        dst: Address,
        rtt: Duration,
    },
    Fault(String),
    Bandwidth(BandwidthStats),
}

pub struct Builder {
    node_id: Option<u32>,
    ip: Option<Ipv4Addr>,
    port: u16,
    overlay_id: u32,
    utility: Option<u32>,
    nat: Option<NatDescriptor>,
    config: NatConfig,
    port_mapper: Option<Arc<dyn PortMapper>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            node_id: None,
            ip: None,
            port: 0,
            overlay_id: 0,
            utility: None,
            nat: None,
            config: NatConfig::default(),
            port_mapper: None,
        }
    }
    pub fn node_id(mut self, node_id: u32) -> Self {
        self.node_id = Some(node_id);
        self
    }
    /// Address of the main UDP socket. Port 0 lets the OS choose.
    pub fn bind(mut self, ip: Ipv4Addr, port: u16) -> Self {
        self.ip = Some(ip);
        self.port = port;
        self
    }
    pub fn overlay_id(mut self, overlay_id: u32) -> Self {
        self.overlay_id = overlay_id;
        self
    }
    pub fn utility(mut self, utility: u32) -> Self {
        self.utility = Some(utility);
        self
    }
    /// Skips classification and uses `nat` as is.
    pub fn nat(mut self, nat: NatDescriptor) -> Self {
        self.nat = Some(nat);
        self
    }
    pub fn config(mut self, config: NatConfig) -> Self {
        self.config = config;
        self
    }
    pub fn port_mapper<P: PortMapper + 'static>(mut self, port_mapper: P) -> Self {
        self.port_mapper = Some(Arc::new(port_mapper));
        self
    }

    /// Binds the main port, classifies the NAT unless it was given and
    /// starts every actor. Events of the node arrive on the returned receiver.
    pub async fn build(self) -> Result<(NatTraverser, Receiver<TraverserEvent>)> {
        let config = self.config;
        config.check()?;
        let node_id = self
            .node_id
            .ok_or_else(|| Error::Config("node_id is required".into()))?;
        let ip = self
            .ip
            .ok_or_else(|| Error::Config("bind address is required".into()))?;
        if ip.is_unspecified() {
            return Err(Error::Config(format!("cannot advertise {ip}")));
        }
        let open_server = config.nat_traverser.open_server;

        let shutdown_manager = ShutdownManager::<()>::new();
        let (endpoint_tx, endpoint_rx) = channel(config.endpoint.channel_capacity);
        let endpoint = Endpoint::start(config.endpoint.clone(), endpoint_tx, shutdown_manager.clone());
        let bound = async {
            let port = bind_udp(&endpoint, ip, self.port).await?;
            if open_server && config.stun_server.alt_port != 0 {
                bind_udp(&endpoint, ip, config.stun_server.alt_port).await?;
            }
            Ok::<_, Error>(port)
        }
        .await;
        let port = match bound {
            Ok(port) => port,
            Err(e) => {
                _ = shutdown_manager.trigger_shutdown(());
                return Err(e);
            }
        };

        let registry = SelfRegistry::new(config.parent_maker.max_parents);
        registry.init(node_id, self.nat.unwrap_or_default());
        let addr = Address::new(ip, port, node_id);
        let me = match self.utility {
            Some(utility) => SelfModel::full(addr, self.overlay_id, registry, utility),
            None => SelfModel::minimal(addr, self.overlay_id, registry),
        };

        let (hp_tx, hp_rx) = channel(256);
        let hp = HolePunchClient::start(&config, me.clone(), endpoint.clone(), hp_tx, &shutdown_manager);
        let (commands, command_rx) = channel(256);
        let (events_tx, events) = channel(256);
        let (stun_tx, stun_rx) = channel(64);
        let actor = TraverserActor {
            config: config.clone(),
            me: me.clone(),
            endpoint: endpoint.clone(),
            hp: hp.clone(),
            server: None,
            stun_replies: stun_tx,
            events: events_tx,
            queued: HashMap::new(),
            paths: HashMap::new(),
            failures: HashMap::new(),
            shutdown_manager: shutdown_manager.clone(),
        };
        crate::spawn_actor(
            "nat traverser",
            &shutdown_manager,
            actor.run(command_rx, endpoint_rx, hp_rx),
        );
        let traverser = NatTraverser {
            commands,
            hp,
            endpoint,
            me,
            shutdown_manager,
        };
        log::info!("node {node_id} listening on {ip}:{port}");

        let nat = match self.nat {
            Some(nat) => nat,
            None if open_server => NatDescriptor::open(),
            None => {
                let mut client = StunClient::new(
                    config.stun_client.clone(),
                    traverser.me.clone(),
                    traverser.endpoint.clone(),
                    stun_rx,
                );
                if let Some(port_mapper) = self.port_mapper {
                    client = client.set_port_mapper(port_mapper);
                }
                client.run().await?
            }
        };
        let (reply, done) = oneshot::channel();
        traverser
            .command(TraverserCommand::Classified { nat, reply })
            .await?;
        done.await.map_err(|_| Error::Shutdown)?;
        Ok((traverser, events))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

async fn bind_udp(endpoint: &Endpoint<Message>, ip: Ipv4Addr, port: u16) -> Result<u16> {
    let (status, bound) = endpoint.bind(IpAddr::V4(ip), port, Transport::Udp).await?;
    if status != BindStatus::Success {
        return Err(Error::BindFailed { port, status });
    }
    Ok(bound)
}

enum TraverserCommand {
    Send {
        dst: VodAddress,
        body: Body,
        timeout_id: TimeoutId,
        reply: oneshot::Sender<Result<()>>,
    },
    Classified {
        nat: NatDescriptor,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running node. Dropping it shuts the node down.
pub struct NatTraverser {
    commands: Sender<TraverserCommand>,
    hp: HolePunchClient,
    endpoint: Endpoint<Message>,
    me: SelfModel,
    shutdown_manager: ShutdownManager<()>,
}

impl NatTraverser {
    async fn command(&self, command: TraverserCommand) -> Result<()> {
        if self.shutdown_manager.is_shutdown_triggered() {
            return Err(Error::Shutdown);
        }
        self.commands.send(command).await.map_err(|_| Error::Shutdown)
    }

    /// Sends `body` to `dst`, opening a direct path first if `dst` is
    /// behind a NAT. `Ok` means sent or queued; a failed handshake is
    /// reported as [`TraverserEvent::Unreachable`].
    pub async fn send(&self, dst: VodAddress, body: Body, timeout_id: TimeoutId) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.command(TraverserCommand::Send {
            dst,
            body,
            timeout_id,
            reply,
        })
        .await?;
        receiver.await.map_err(|_| Error::Shutdown)?
    }

    /// Pings `dst` directly, see [`TraverserEvent::ProbeSucceeded`].
    pub async fn probe(&self, dst: Address) -> Result<()> {
        self.hp.probe(dst).await
    }

    pub fn address(&self) -> VodAddress {
        self.me.vod_address()
    }

    pub fn nat(&self) -> NatDescriptor {
        self.me.nat()
    }

    pub fn parents(&self) -> Vec<Address> {
        self.me.parents()
    }

    pub fn total_read_bytes(&self) -> u64 {
        self.endpoint.total_read_bytes()
    }

    pub fn total_written_bytes(&self) -> u64 {
        self.endpoint.total_written_bytes()
    }

    /// Leaves every parent and stops all actors.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_manager.is_shutdown_triggered() {
            return Err(Error::Shutdown);
        }
        match tokio::time::timeout(UNREGISTER_TIMEOUT, self.hp.unregister()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("unregister: {e}"),
            Err(_) => log::warn!("unregister timed out"),
        }
        self.shutdown_manager
            .trigger_shutdown(())
            .map_err(|_| Error::Shutdown)
    }
}

impl Drop for NatTraverser {
    fn drop(&mut self) {
        _ = self.shutdown_manager.trigger_shutdown(());
    }
}

struct ServerRole {
    rendezvous: RendezvousServer,
    stun: StunResponder,
}

struct QueuedMessage {
    body: Body,
    timeout_id: TimeoutId,
}

struct TraverserActor {
    config: NatConfig,
    me: SelfModel,
    endpoint: Endpoint<Message>,
    hp: HolePunchClient,
    server: Option<ServerRole>,
    stun_replies: Sender<StunReply>,
    events: Sender<TraverserEvent>,
    queued: HashMap<HandshakeKey, Vec<QueuedMessage>>,
    paths: HashMap<HandshakeKey, DirectPath>,
    /// Consecutive failed handshakes per destination.
    failures: HashMap<HandshakeKey, u32>,
    shutdown_manager: ShutdownManager<()>,
}

impl TraverserActor {
    async fn run(
        mut self,
        mut commands: Receiver<TraverserCommand>,
        mut endpoint_events: Receiver<EndpointEvent<Message>>,
        mut hp_events: Receiver<HpEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                event = endpoint_events.recv() => match event {
                    Some(event) => self.on_endpoint(event).await,
                    None => break,
                },
                event = hp_events.recv() => match event {
                    Some(event) => self.on_hole_punch(event).await,
                    None => break,
                },
            }
        }
        log::debug!("nat traverser of {} stopped", self.me.node_id());
    }

    fn emit(&self, event: TraverserEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    _ = events.send(event).await;
                });
            }
        }
    }

    async fn handle(&mut self, command: TraverserCommand) {
        match command {
            TraverserCommand::Send {
                dst,
                body,
                timeout_id,
                reply,
            } => {
                let rs = self.send(dst, body, timeout_id).await;
                _ = reply.send(rs);
            }
            TraverserCommand::Classified { nat, reply } => {
                self.classified(nat).await;
                _ = reply.send(());
            }
        }
    }

    async fn classified(&mut self, nat: NatDescriptor) {
        let node_id = self.me.node_id();
        self.me.registry().set_nat(node_id, nat);
        log::info!("node {node_id} is {nat}");
        if self.config.nat_traverser.open_server {
            if nat.is_open() {
                self.server = Some(ServerRole {
                    rendezvous: RendezvousServer::start(
                        &self.config.rendezvous_server,
                        self.me.clone(),
                        self.endpoint.clone(),
                        &self.shutdown_manager,
                    ),
                    stun: StunResponder::new(self.config.stun_server.clone()),
                });
            } else {
                log::warn!("node {node_id} is behind a nat and cannot serve");
            }
        }
        self.emit(TraverserEvent::NatClassified(nat));
        if let Err(e) = self.hp.start_parent_maker().await {
            log::warn!("start parent maker: {e}");
        }
    }

    async fn send(&mut self, dst: VodAddress, body: Body, timeout_id: TimeoutId) -> Result<()> {
        let key = dst.key();
        if dst.is_open() {
            let msg = Message::new(self.me.vod_address(), dst.address(), body).with_timeout(timeout_id);
            return Ok(self.endpoint.send(msg).await?);
        }
        if let Some(path) = self.paths.get(&key).copied() {
            let rs = self.send_direct(key, path, body, timeout_id).await;
            if rs.is_err() {
                self.close_path(key).await;
            }
            return rs;
        }
        if dst.parents.is_empty() {
            let error = Error::NoParents {
                node_id: dst.node_id(),
            };
            log::debug!("{dst} has no parents");
            self.emit(TraverserEvent::Unreachable {
                dst: dst.address(),
                reason: Error::NoParents {
                    node_id: dst.node_id(),
                },
            });
            return Err(error);
        }
        let failures = self.failures.get(&key).copied().unwrap_or_default();
        if failures >= self.config.nat_traverser.max_fail_before_giving_up {
            let reason = format!("{failures} failed handshakes");
            self.emit(TraverserEvent::Unreachable {
                dst: dst.address(),
                reason: Error::Unreachable {
                    node_id: dst.node_id(),
                    reason: reason.clone(),
                },
            });
            return Err(Error::Unreachable {
                node_id: dst.node_id(),
                reason,
            });
        }
        let queue = self.queued.entry(key).or_default();
        queue.push(QueuedMessage { body, timeout_id });
        if queue.len() == 1 {
            self.hp.connect(dst).await?;
        }
        Ok(())
    }

    /// Forgets `key`'s path here and in the hole-punching client.
    async fn close_path(&mut self, key: HandshakeKey) {
        if self.paths.remove(&key).is_some() {
            if let Err(e) = self.hp.close_path(key).await {
                log::debug!("close path to {}: {e}", key.0);
            }
        }
    }

    async fn send_direct(
        &self,
        key: HandshakeKey,
        path: DirectPath,
        body: Body,
        timeout_id: TimeoutId,
    ) -> Result<()> {
        let mut src = self.me.vod_address();
        src.addr.port = path.local_port;
        let dst = Address::from_socket(path.remote, key.0);
        let msg = Message::new(src, dst, body).with_timeout(timeout_id);
        Ok(self.endpoint.send(msg).await?)
    }

    async fn on_hole_punch(&mut self, event: HpEvent) {
        match event {
            HpEvent::Verified { key, target, path } => {
                self.paths.insert(key, path);
                self.failures.remove(&key);
                self.emit(TraverserEvent::Verified {
                    dst: target,
                    path,
                });
                for queued in self.queued.remove(&key).unwrap_or_default() {
                    if let Err(e) = self
                        .send_direct(key, path, queued.body, queued.timeout_id)
                        .await
                    {
                        log::warn!("send queued message to {}: {e}", key.0);
                    }
                }
            }
            HpEvent::Failed { key, target, error } => {
                self.paths.remove(&key);
                *self.failures.entry(key).or_default() += 1;
                let dropped = self.queued.remove(&key).map_or(0, |q| q.len());
                log::info!("{target} unreachable, {dropped} messages dropped: {error}");
                self.emit(TraverserEvent::Unreachable {
                    dst: target.address(),
                    reason: error,
                });
            }
            HpEvent::PathClosed { key, path } => {
                if self.paths.get(&key) == Some(&path) {
                    self.paths.remove(&key);
                }
                log::debug!("direct path to {} via {} closed", key.0, path.remote);
            }
            HpEvent::ParentRegistered(parent) => {
                if self.me.registry().add_parent(self.me.node_id(), parent) {
                    self.emit(TraverserEvent::ParentsChanged(self.me.parents()));
                }
            }
            HpEvent::ParentLost(parent) => {
                if self.me.registry().remove_parent(self.me.node_id(), &parent) {
                    self.emit(TraverserEvent::ParentsChanged(self.me.parents()));
                }
            }
            HpEvent::ProbeSucceeded { dst, rtt } => {
                self.emit(TraverserEvent::ProbeSucceeded { dst, rtt })
            }
        }
    }

    async fn on_endpoint(&mut self, event: EndpointEvent<Message>) {
        match event {
            EndpointEvent::Message {
                msg, remote, local, ..
            } => self.inbound(msg, remote, local).await,
            EndpointEvent::Fault {
                transport,
                port,
                error,
                fatal,
            } => {
                if fatal {
                    log::error!("{transport:?} port {port} lost: {error}");
                    self.emit(TraverserEvent::Fault(error.to_string()));
                    _ = self.shutdown_manager.trigger_shutdown(());
                } else {
                    log::warn!("{transport:?} port {port}: {error}");
                    self.emit(TraverserEvent::Fault(error.to_string()));
                }
            }
            EndpointEvent::SessionClosed { remote, transport } => {
                log::debug!("{transport:?} session with {remote} closed")
            }
            EndpointEvent::Bandwidth(stats) => self.emit(TraverserEvent::Bandwidth(stats)),
        }
    }

    async fn inbound(&mut self, msg: Message, remote: SocketAddr, local: SocketAddr) {
        let opcode = msg.opcode();
        if opcode.is_stun() {
            match &msg.body {
                Body::StunEchoRequest { .. } | Body::StunReportRequest { .. } => {
                    let Some(server) = &self.server else {
                        log::debug!("not a stun server, drop {opcode:?} from {remote}");
                        return;
                    };
                    let replies = server.stun.respond(&self.me.vod_address(), &msg, remote, local);
                    for reply in replies {
                        if let Err(e) = self.endpoint.send(reply).await {
                            log::warn!("stun reply to {remote}: {e}");
                        }
                    }
                }
                _ => {
                    if self
                        .stun_replies
                        .try_send(StunReply { msg, remote })
                        .is_err()
                    {
                        log::debug!("no stun client waits for {opcode:?} from {remote}");
                    }
                }
            }
            return;
        }
        if opcode.is_hole_punching() {
            let for_server = matches!(
                msg.body,
                Body::HpRegisterRequest { .. }
                    | Body::HpUnregisterRequest { .. }
                    | Body::HpKeepAliveRequest
                    | Body::HpDeleteConnection { .. }
                    | Body::HpConnectRequest {
                        forwarded: false,
                        ..
                    }
            );
            if for_server {
                match &self.server {
                    Some(server) => {
                        if let Err(e) = server.rendezvous.handle(msg, remote).await {
                            log::warn!("rendezvous server: {e}");
                        }
                    }
                    None => log::debug!("not a rendezvous server, drop {opcode:?} from {remote}"),
                }
                return;
            }
            if let Err(e) = self.hp.inbound(msg, remote, local).await {
                log::warn!("hole punch client: {e}");
            }
            return;
        }
        self.emit(TraverserEvent::Delivered(msg));
    }
}
