//! Hole-punching client.
//!
//! One actor drives a handshake per remote `(node_id, overlay_id)`:
//!
//! ```text
//! REGISTERED -> CONNECT_REQUESTED -> HOLE_OPEN -> VERIFIED
//!                      \                  \
//!                       FAILED             FAILED
//! ```
//!
//! The initiator asks one of the target's parents to forward a connect
//! request and pings the target from its punch port at the same time. The
//! target pings back once the request reaches it. Every ping is answered with
//! a pong carrying the ping's timeout id, and the first pong matching an
//! outstanding id verifies the path. Requests are resent with a growing
//! timeout until the retry budget or the handshake deadline runs out.
//!
//! The same actor keeps the node registered with its parents, see
//! [`parent_maker`].

use async_shutdown::ShutdownManager;
use natpunch_core::endpoint::{Endpoint, Transport};
use natpunch_core::nat::MappingPolicy;
use natpunch_core::timer::{TimeoutId, Timer};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::{HpClientConfig, NatConfig};
use crate::error::{Error, Result};
use crate::protocol::{Address, Body, ConnectStatus, Message, UnregisterStatus, VodAddress};
use crate::self_model::SelfModel;

mod parent_maker;

use parent_maker::ParentMaker;

/// `(node_id, overlay_id)` of the remote side.
pub type HandshakeKey = (u32, u32);

/// A verified direct UDP path to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectPath {
    pub remote: SocketAddr,
    /// Local port the path was punched from.
    pub local_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Registered,
    ConnectRequested,
    HoleOpen,
    Verified,
}

#[derive(Debug)]
pub enum HpEvent {
    Verified {
        key: HandshakeKey,
        target: VodAddress,
        path: DirectPath,
    },
    Failed {
        key: HandshakeKey,
        target: VodAddress,
        error: Error,
    },
    /// A cached path was dropped and its ports released.
    PathClosed {
        key: HandshakeKey,
        path: DirectPath,
    },
    ParentRegistered(Address),
    ParentLost(Address),
    ProbeSucceeded {
        dst: Address,
        rtt: Duration,
    },
}

pub(crate) enum HpCommand {
    Connect {
        target: VodAddress,
    },
    Probe {
        target: Address,
    },
    Inbound {
        msg: Message,
        remote: SocketAddr,
        local: SocketAddr,
    },
    StartParentMaker,
    Unregister {
        reply: oneshot::Sender<()>,
    },
    State {
        key: HandshakeKey,
        reply: oneshot::Sender<Option<HandshakeState>>,
    },
    Retry {
        key: HandshakeKey,
        id: TimeoutId,
    },
    Deadline {
        key: HandshakeKey,
        id: TimeoutId,
    },
    ProbeExpired {
        id: TimeoutId,
    },
    ClosePath {
        key: HandshakeKey,
    },
    PathExpired {
        key: HandshakeKey,
        id: TimeoutId,
    },
    ParentTimeout {
        id: TimeoutId,
    },
    Refresh,
}

struct PendingHandshake {
    target: VodAddress,
    /// Where pings go. Follows the address the target's own pings come from.
    remote: SocketAddr,
    allocated_ports: BTreeSet<u16>,
    punch_port: u16,
    attempt: u32,
    retries_left: u32,
    rto: Duration,
    state: HandshakeState,
    deadline: Instant,
    retry_id: TimeoutId,
    deadline_id: TimeoutId,
    ping_id: TimeoutId,
    /// Parent the connect request went through.
    parent: Option<Address>,
    /// Parents that answered with an unknown target.
    refused: BTreeSet<u32>,
    responder: bool,
}

struct CachedPath {
    path: DirectPath,
    /// Ephemeral ports bound for the handshake, released with the path.
    allocated_ports: BTreeSet<u16>,
    expiry_id: TimeoutId,
}

/// Handle to the hole-punching actor.
#[derive(Clone)]
pub struct HolePunchClient {
    sender: Sender<HpCommand>,
}

impl HolePunchClient {
    pub fn start(
        config: &NatConfig,
        me: SelfModel,
        endpoint: Endpoint<Message>,
        events: Sender<HpEvent>,
        shutdown_manager: &ShutdownManager<()>,
    ) -> Self {
        let (sender, receiver) = channel(256);
        let actor = HpActor {
            config: config.hp_client.clone(),
            handshake_timeout: config.nat_traverser.open_server_timeout(),
            parent_maker: ParentMaker::new(config.parent_maker.clone()),
            me,
            endpoint,
            timer: Timer::new(sender.clone()),
            events,
            handshakes: HashMap::new(),
            by_ping: HashMap::new(),
            paths: HashMap::new(),
            probes: HashMap::new(),
        };
        crate::spawn_actor("hole punch client", shutdown_manager, actor.run(receiver));
        Self { sender }
    }

    async fn command(&self, command: HpCommand) -> Result<()> {
        self.sender.send(command).await.map_err(|_| Error::Shutdown)
    }

    /// Starts a handshake with `target`; the outcome arrives as an [`HpEvent`].
    pub async fn connect(&self, target: VodAddress) -> Result<()> {
        self.command(HpCommand::Connect { target }).await
    }

    /// Pings `target` directly and reports the round trip time.
    pub async fn probe(&self, target: Address) -> Result<()> {
        self.command(HpCommand::Probe { target }).await
    }

    pub async fn inbound(&self, msg: Message, remote: SocketAddr, local: SocketAddr) -> Result<()> {
        self.command(HpCommand::Inbound { msg, remote, local })
            .await
    }

    /// Registers with parents and keeps the registrations alive. No effect
    /// on an open node.
    pub async fn start_parent_maker(&self) -> Result<()> {
        self.command(HpCommand::StartParentMaker).await
    }

    /// Drops the cached path to `key`, if any, and releases its ports.
    pub async fn close_path(&self, key: HandshakeKey) -> Result<()> {
        self.command(HpCommand::ClosePath { key }).await
    }

    /// Tells every parent to drop our session and closes every direct path.
    pub async fn unregister(&self) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.command(HpCommand::Unregister { reply }).await?;
        receiver.await.map_err(|_| Error::Shutdown)
    }

    pub async fn state(&self, key: HandshakeKey) -> Result<Option<HandshakeState>> {
        let (reply, receiver) = oneshot::channel();
        self.command(HpCommand::State { key, reply }).await?;
        receiver.await.map_err(|_| Error::Shutdown)
    }
}

struct HpActor {
    config: HpClientConfig,
    handshake_timeout: Duration,
    parent_maker: ParentMaker,
    me: SelfModel,
    endpoint: Endpoint<Message>,
    timer: Timer<HpCommand>,
    events: Sender<HpEvent>,
    handshakes: HashMap<HandshakeKey, PendingHandshake>,
    by_ping: HashMap<TimeoutId, HandshakeKey>,
    paths: HashMap<HandshakeKey, CachedPath>,
    probes: HashMap<TimeoutId, (Address, Instant)>,
}

impl HpActor {
    async fn run(mut self, mut receiver: Receiver<HpCommand>) {
        while let Some(command) = receiver.recv().await {
            self.handle(command).await;
        }
        self.timer.cancel_all();
    }

    async fn handle(&mut self, command: HpCommand) {
        match command {
            HpCommand::Connect { target } => self.connect(target).await,
            HpCommand::Probe { target } => self.probe(target).await,
            HpCommand::Inbound { msg, remote, local } => self.inbound(msg, remote, local).await,
            HpCommand::StartParentMaker => self.start_parent_maker().await,
            HpCommand::Unregister { reply } => {
                self.unregister_all().await;
                let keys: Vec<HandshakeKey> = self.paths.keys().copied().collect();
                for key in keys {
                    self.close_path(key).await;
                }
                _ = reply.send(());
            }
            HpCommand::State { key, reply } => {
                let state = match self.handshakes.get(&key) {
                    Some(hs) => Some(hs.state),
                    None => self
                        .paths
                        .contains_key(&key)
                        .then_some(HandshakeState::Verified),
                };
                _ = reply.send(state);
            }
            HpCommand::Retry { key, id } => self.retry(key, id).await,
            HpCommand::Deadline { key, id } => {
                let expired = self
                    .handshakes
                    .get(&key)
                    .is_some_and(|hs| hs.deadline_id == id);
                if expired {
                    self.fail(key, Error::HandshakeTimeout { node_id: key.0 })
                        .await;
                }
            }
            HpCommand::ProbeExpired { id } => {
                if let Some((dst, _)) = self.probes.remove(&id) {
                    log::debug!("probe of {dst} got no pong");
                }
            }
            HpCommand::ClosePath { key } => self.close_path(key).await,
            HpCommand::PathExpired { key, id } => {
                let expired = self.paths.get(&key).is_some_and(|c| c.expiry_id == id);
                if expired {
                    log::debug!("direct path to {} expired", key.0);
                    self.close_path(key).await;
                }
            }
            HpCommand::ParentTimeout { id } => self.parent_timeout(id).await,
            HpCommand::Refresh => self.refresh_parents().await,
        }
    }

    /// Never waits, so a slow consumer cannot stall the handshakes.
    fn emit(&self, event: HpEvent) {
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

    fn main_port(&self) -> u16 {
        self.me.address().port
    }

    /// Our advertised address with the port a message leaves from.
    fn src(&self, port: u16) -> VodAddress {
        let mut src = self.me.vod_address();
        src.addr.port = port;
        src
    }

    async fn send(&self, msg: Message) {
        let dst = msg.dst;
        let opcode = msg.opcode();
        if let Err(e) = self.endpoint.send(msg).await {
            log::warn!("send {opcode:?} to {dst}: {e}");
        }
    }

    async fn connect(&mut self, target: VodAddress) {
        let key = target.key();
        if let Some(cached) = self.paths.get(&key) {
            self.emit(HpEvent::Verified {
                key,
                target,
                path: cached.path,
            });
            return;
        }
        if self.handshakes.contains_key(&key) {
            log::debug!("handshake with {target} already running");
            return;
        }
        if !target.is_open() && target.parents.is_empty() {
            let error = Error::NoParents {
                node_id: target.node_id(),
            };
            self.emit(HpEvent::Failed { key, target, error });
            return;
        }
        if !self.me.is_open() && self.me.parents().is_empty() {
            let error = Error::NoParents {
                node_id: self.me.node_id(),
            };
            self.emit(HpEvent::Failed { key, target, error });
            return;
        }

        let main_port = self.main_port();
        let (punch_port, allocated_ports) = match target.nat.mapping {
            MappingPolicy::EndpointIndependent => (main_port, BTreeSet::new()),
            _ => {
                let ip = self.me.address().socket_addr().ip();
                match self.endpoint.alloc_ephemeral(ip, 1, Transport::Udp).await {
                    Ok(ports) => match ports.first().copied() {
                        Some(port) => (port, ports),
                        None => {
                            log::warn!("no ephemeral port for {target}, punching from {main_port}");
                            (main_port, ports)
                        }
                    },
                    Err(e) => {
                        self.emit(HpEvent::Failed {
                            key,
                            target,
                            error: e.into(),
                        });
                        return;
                    }
                }
            }
        };
        log::debug!("handshake with {target} from port {punch_port}");
        let remote = target.addr.socket_addr();
        self.begin(target, remote, punch_port, allocated_ports, None, false)
            .await;
    }

    /// A parent forwarded the connect request of `initiator`.
    async fn on_forwarded(&mut self, initiator: VodAddress, parent: Address) {
        let key = initiator.key();
        let remote = initiator.addr.socket_addr();
        if let Some(hs) = self.handshakes.get_mut(&key) {
            // both sides asked at the same time
            hs.remote = remote;
            hs.parent.get_or_insert(parent);
            self.send_attempt(key).await;
            return;
        }
        self.close_path(key).await;
        let punch_port = self.main_port();
        self.begin(
            initiator,
            remote,
            punch_port,
            BTreeSet::new(),
            Some(parent),
            true,
        )
        .await;
    }

    async fn begin(
        &mut self,
        target: VodAddress,
        remote: SocketAddr,
        punch_port: u16,
        allocated_ports: BTreeSet<u16>,
        parent: Option<Address>,
        responder: bool,
    ) {
        let key = target.key();
        let ping_id = TimeoutId::random();
        let retry_id = TimeoutId::random();
        let deadline_id = TimeoutId::random();
        let rto = self.config.rto();
        self.timer
            .schedule_with_id(retry_id, rto, HpCommand::Retry { key, id: retry_id });
        self.timer.schedule_with_id(
            deadline_id,
            self.handshake_timeout,
            HpCommand::Deadline {
                key,
                id: deadline_id,
            },
        );
        self.handshakes.insert(
            key,
            PendingHandshake {
                target,
                remote,
                allocated_ports,
                punch_port,
                attempt: 0,
                retries_left: self.config.rto_retries.saturating_sub(1),
                rto,
                state: HandshakeState::Registered,
                deadline: Instant::now() + self.handshake_timeout,
                retry_id,
                deadline_id,
                ping_id,
                parent,
                refused: BTreeSet::new(),
                responder,
            },
        );
        self.by_ping.insert(ping_id, key);
        self.send_attempt(key).await;
    }

    /// Sends the connect request (initiator only) and a ping.
    async fn send_attempt(&mut self, key: HandshakeKey) {
        let src_port = match self.handshakes.get(&key) {
            Some(hs) => hs.punch_port,
            None => return,
        };
        let src = self.src(src_port);
        let Some(hs) = self.handshakes.get_mut(&key) else {
            return;
        };
        let mut outgoing = Vec::with_capacity(2);
        if !hs.responder && !hs.target.is_open() {
            let live: Vec<Address> = hs
                .target
                .parents
                .iter()
                .filter(|p| !hs.refused.contains(&p.node_id))
                .copied()
                .collect();
            if !live.is_empty() {
                let parent = live[hs.attempt as usize % live.len()];
                hs.parent = Some(parent);
                outgoing.push(
                    Message::new(
                        src.clone(),
                        parent,
                        Body::HpConnectRequest {
                            peer: hs.target.clone(),
                            forwarded: false,
                        },
                    )
                    .with_timeout(hs.ping_id),
                );
            }
        }
        if hs.state == HandshakeState::Registered {
            hs.state = HandshakeState::ConnectRequested;
        }
        let dst = Address::from_socket(hs.remote, hs.target.node_id());
        outgoing.push(Message::new(src, dst, Body::HpPing).with_timeout(hs.ping_id));
        for msg in outgoing {
            self.send(msg).await;
        }
    }

    async fn retry(&mut self, key: HandshakeKey, id: TimeoutId) {
        let scale = self.config.rto_scale;
        let Some(hs) = self.handshakes.get_mut(&key) else {
            return;
        };
        if hs.retry_id != id {
            return;
        }
        if hs.retries_left == 0 || Instant::now() >= hs.deadline {
            self.fail(key, Error::HandshakeTimeout { node_id: key.0 })
                .await;
            return;
        }
        hs.retries_left -= 1;
        hs.attempt += 1;
        hs.rto = hs.rto.mul_f64(scale);
        hs.retry_id = TimeoutId::random();
        let (retry_id, rto) = (hs.retry_id, hs.rto);
        log::debug!(
            "handshake with {} attempt {} (rto {rto:?})",
            hs.target,
            hs.attempt
        );
        self.timer
            .schedule_with_id(retry_id, rto, HpCommand::Retry { key, id: retry_id });
        self.send_attempt(key).await;
    }

    async fn fail(&mut self, key: HandshakeKey, error: Error) {
        let Some(hs) = self.handshakes.remove(&key) else {
            return;
        };
        self.timer.cancel(hs.retry_id);
        self.timer.cancel(hs.deadline_id);
        self.by_ping.remove(&hs.ping_id);
        self.release_ports(hs.allocated_ports).await;
        log::info!("handshake with {} failed: {error}", hs.target);
        self.emit(HpEvent::Failed {
            key,
            target: hs.target,
            error,
        });
    }

    async fn verify(&mut self, key: HandshakeKey, remote: SocketAddr) {
        let Some(hs) = self.handshakes.remove(&key) else {
            return;
        };
        self.timer.cancel(hs.retry_id);
        self.timer.cancel(hs.deadline_id);
        self.by_ping.remove(&hs.ping_id);
        let path = DirectPath {
            remote,
            local_port: hs.punch_port,
        };
        let expiry_id = TimeoutId::random();
        self.timer.schedule_with_id(
            expiry_id,
            self.config.path_ttl(),
            HpCommand::PathExpired { key, id: expiry_id },
        );
        let cached = CachedPath {
            path,
            allocated_ports: hs.allocated_ports,
            expiry_id,
        };
        if let Some(old) = self.paths.insert(key, cached) {
            self.timer.cancel(old.expiry_id);
            self.release_ports(old.allocated_ports).await;
        }
        log::info!("direct path to {} via {remote} from port {}", hs.target, hs.punch_port);
        if let Some(parent) = hs.parent {
            let delete = Message::new(
                self.src(self.main_port()),
                parent,
                Body::HpDeleteConnection {
                    remote_client_id: hs.target.node_id(),
                },
            );
            self.send(delete).await;
        }
        self.emit(HpEvent::Verified {
            key,
            target: hs.target,
            path,
        });
    }

    async fn close_path(&mut self, key: HandshakeKey) {
        let Some(cached) = self.paths.remove(&key) else {
            return;
        };
        self.timer.cancel(cached.expiry_id);
        self.release_ports(cached.allocated_ports).await;
        self.emit(HpEvent::PathClosed {
            key,
            path: cached.path,
        });
    }

    async fn release_ports(&self, ports: BTreeSet<u16>) {
        if ports.is_empty() {
            return;
        }
        if let Err(e) = self.endpoint.release(ports, Transport::Udp).await {
            log::warn!("release punch ports: {e}");
        }
    }

    async fn probe(&mut self, target: Address) {
        let id = TimeoutId::random();
        self.probes.insert(id, (target, Instant::now()));
        let budget = self.config.retry_budget().max(self.config.rto());
        self.timer
            .schedule_with_id(id, budget, HpCommand::ProbeExpired { id });
        let ping = Message::new(self.src(self.main_port()), target, Body::HpPing).with_timeout(id);
        self.send(ping).await;
    }

    async fn inbound(&mut self, msg: Message, remote: SocketAddr, local: SocketAddr) {
        match &msg.body {
            Body::HpPing => self.on_ping(&msg, remote, local).await,
            Body::HpPong => self.on_pong(&msg, remote).await,
            Body::HpConnectRequest {
                peer,
                forwarded: true,
            } => {
                log::debug!("{} wants to connect through {}", peer, msg.src.addr);
                self.on_forwarded(peer.clone(), msg.src.addr).await
            }
            Body::HpConnectResponse { status, target_id } => {
                self.on_connect_response(&msg, *status, *target_id).await
            }
            Body::HpRegisterResponse { status } => {
                self.on_register_response(&msg, *status, remote).await
            }
            Body::HpKeepAliveResponse { status } => {
                self.on_keepalive_response(&msg, *status, remote).await
            }
            Body::HpUnregisterResponse { status } => match status {
                UnregisterStatus::AlreadyMoving => {
                    let e = Error::AlreadyMoving {
                        client_id: self.me.node_id(),
                    };
                    log::warn!("unregister at {remote}: {e}")
                }
                status => log::debug!("unregister at {remote}: {status:?}"),
            },
            Body::HpExpire => self.on_expire(remote).await,
            other => log::debug!("hole punch client ignores {:?}", other.opcode()),
        }
    }

    async fn on_ping(&mut self, msg: &Message, remote: SocketAddr, local: SocketAddr) {
        let pong = Message::new(
            self.src(local.port()),
            Address::from_socket(remote, msg.src.node_id()),
            Body::HpPong,
        )
        .with_timeout(msg.timeout_id);
        self.send(pong).await;

        let key = msg.src.key();
        let Some(hs) = self.handshakes.get_mut(&key) else {
            return;
        };
        hs.state = HandshakeState::HoleOpen;
        if hs.remote != remote {
            log::debug!("{} answers from {remote}", hs.target);
            hs.remote = remote;
            self.send_attempt(key).await;
        }
    }

    async fn on_pong(&mut self, msg: &Message, remote: SocketAddr) {
        let id = msg.timeout_id;
        if let Some(key) = self.by_ping.get(&id).copied() {
            self.verify(key, remote).await;
            return;
        }
        if let Some((dst, sent)) = self.probes.remove(&id) {
            self.timer.cancel(id);
            self.emit(HpEvent::ProbeSucceeded {
                dst,
                rtt: sent.elapsed(),
            });
            return;
        }
        log::debug!("drop pong {id} from {remote}");
    }

    async fn on_connect_response(&mut self, msg: &Message, status: ConnectStatus, target_id: u32) {
        let Some(key) = self.by_ping.get(&msg.timeout_id).copied() else {
            return;
        };
        let Some(hs) = self.handshakes.get_mut(&key) else {
            return;
        };
        match status {
            ConnectStatus::Success => {
                log::debug!("{} forwards our request to {target_id}", msg.src.addr)
            }
            ConnectStatus::UnknownTarget => {
                hs.refused.insert(msg.src.node_id());
                let exhausted = hs
                    .target
                    .parents
                    .iter()
                    .all(|p| hs.refused.contains(&p.node_id));
                if exhausted {
                    self.fail(key, Error::UnknownTarget { node_id: target_id })
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
