//! Multi-transport network endpoint.
//!
//! The endpoint binds local UDP, TCP and UDT (KCP over UDP) ports, writes
//! outbound messages to the right channel and hands every decoded inbound
//! frame to a single event channel. One actor task owns the port tables;
//! receive loops and stream connections run as their own tasks and only talk
//! back to the actor through its mailbox.

use async_shutdown::ShutdownManager;
use bytes::BytesMut;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender, WeakSender};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

use crate::error::{Error, Result};
use crate::socket;

mod bandwidth;
mod port_table;
mod tcp;
mod udp;
mod udt;

pub use bandwidth::{BandwidthSampler, BandwidthStats, Counters};
pub use port_table::PortTable;
pub use tcp::LengthPrefixedCodec;

/// Ports preferred for hole-punching allocations.
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 50000..=65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    /// Reliable transport over UDP.
    Udt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindStatus {
    Success,
    Fail,
    /// The OS reports the address as used by someone else.
    AlreadyBound,
}

/// A message the endpoint can route, frame and rewrite.
pub trait WireMessage: Send + Sized + 'static {
    type Error: std::fmt::Display + Send + 'static;

    fn source(&self) -> SocketAddr;
    fn destination(&self) -> SocketAddr;
    fn transport(&self) -> Transport;
    /// Stream channels call this with their local address right before
    /// encoding; datagram sends never do.
    fn rewrite_source(&mut self, local: SocketAddr);
    fn encode(&self, buf: &mut BytesMut) -> Result<(), Self::Error>;
    fn decode(frame: &[u8], transport: Transport) -> Result<Self, Self::Error>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Receive buffer of UDP sockets.
    pub recv_buffer_size: usize,
    pub max_frame_len: usize,
    pub connect_timeout_ms: u64,
    pub udt_idle_timeout_ms: u64,
    pub channel_capacity: usize,
    pub bandwidth_interval_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 1500,
            max_frame_len: 65535,
            connect_timeout_ms: 5000,
            udt_idle_timeout_ms: 60_000,
            channel_capacity: 128,
            bandwidth_interval_ms: 1000,
        }
    }
}

impl EndpointConfig {
    pub fn set_recv_buffer_size(mut self, recv_buffer_size: usize) -> Self {
        self.recv_buffer_size = recv_buffer_size;
        self
    }
    pub fn set_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
    pub fn set_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout_ms = connect_timeout.as_millis() as u64;
        self
    }
    pub fn set_udt_idle_timeout(mut self, udt_idle_timeout: Duration) -> Self {
        self.udt_idle_timeout_ms = udt_idle_timeout.as_millis() as u64;
        self
    }
    pub fn set_channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity;
        self
    }
    pub fn set_bandwidth_interval(mut self, bandwidth_interval: Duration) -> Self {
        self.bandwidth_interval_ms = bandwidth_interval.as_millis() as u64;
        self
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn udt_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.udt_idle_timeout_ms)
    }
    pub fn bandwidth_interval(&self) -> Duration {
        Duration::from_millis(self.bandwidth_interval_ms)
    }
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.recv_buffer_size < 64 {
            return Err(format!("recv_buffer_size {} too small", self.recv_buffer_size));
        }
        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            return Err(format!("max_frame_len {} out of range", self.max_frame_len));
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be positive".into());
        }
        if self.bandwidth_interval_ms == 0 {
            return Err("bandwidth_interval_ms must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum EndpointEvent<M> {
    Message {
        msg: M,
        /// Observed address of the sender.
        remote: SocketAddr,
        /// Local address the frame arrived on.
        local: SocketAddr,
        transport: Transport,
    },
    Fault {
        transport: Transport,
        port: u16,
        error: Arc<Error>,
        /// The bound socket is gone.
        fatal: bool,
    },
    SessionClosed {
        remote: SocketAddr,
        transport: Transport,
    },
    Bandwidth(BandwidthStats),
}

pub(crate) struct AbortOnDrop(AbortHandle);

impl From<JoinHandle<()>> for AbortOnDrop {
    fn from(handle: JoinHandle<()>) -> Self {
        AbortOnDrop(handle.abort_handle())
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) struct Connection<M> {
    id: u64,
    writer: Sender<M>,
    _task: AbortOnDrop,
}

pub(crate) enum Command<M> {
    Bind {
        ip: IpAddr,
        port: u16,
        transport: Transport,
        reply: oneshot::Sender<(BindStatus, u16)>,
    },
    Alloc {
        ip: IpAddr,
        count: usize,
        transport: Transport,
        reply: oneshot::Sender<BTreeSet<u16>>,
    },
    Release {
        ports: BTreeSet<u16>,
        transport: Transport,
        reply: oneshot::Sender<BTreeSet<u16>>,
    },
    Send {
        msg: M,
        reply: oneshot::Sender<Result<()>>,
    },
    Ports {
        transport: Transport,
        reply: oneshot::Sender<BTreeSet<u16>>,
    },
    Attached {
        transport: Transport,
        remote: SocketAddr,
        connection: Connection<M>,
    },
    ChannelInactive {
        transport: Transport,
        remote: SocketAddr,
        id: u64,
    },
    SocketLost {
        transport: Transport,
        port: u16,
        error: Error,
    },
}

/// State shared with receive loops and connection tasks.
pub(crate) struct Shared<M> {
    pub(crate) config: EndpointConfig,
    pub(crate) counters: Arc<Counters>,
    events: Sender<EndpointEvent<M>>,
    commands: WeakSender<Command<M>>,
    next_id: AtomicU64,
}

impl<M: WireMessage> Shared<M> {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// False once nobody listens to the endpoint anymore.
    pub(crate) async fn emit(&self, event: EndpointEvent<M>) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Never waits; used by the actor so a full event queue cannot stall it.
    fn emit_detached(&self, event: EndpointEvent<M>) {
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

    pub(crate) async fn command(&self, command: Command<M>) {
        if let Some(sender) = self.commands.upgrade() {
            _ = sender.send(command).await;
        }
    }

    pub(crate) async fn deliver(
        &self,
        frame: &[u8],
        remote: SocketAddr,
        local: SocketAddr,
        transport: Transport,
    ) -> bool {
        match M::decode(frame, transport) {
            Ok(msg) => {
                self.emit(EndpointEvent::Message {
                    msg,
                    remote,
                    local,
                    transport,
                })
                .await
            }
            Err(e) => {
                log::debug!("drop {transport:?} frame from {remote}: {e}");
                true
            }
        }
    }

    pub(crate) fn encode(&self, msg: &M, buf: &mut BytesMut) -> Result<()> {
        msg.encode(buf).map_err(|e| Error::Encode(e.to_string()))?;
        if buf.len() > self.config.max_frame_len {
            return Err(Error::FrameTooLarge {
                len: buf.len(),
                max: self.config.max_frame_len,
            });
        }
        Ok(())
    }

    pub(crate) async fn attach(
        self: &Arc<Self>,
        transport: Transport,
        remote: SocketAddr,
        id: u64,
        writer: Sender<M>,
        task: JoinHandle<()>,
    ) {
        self.command(Command::Attached {
            transport,
            remote,
            connection: Connection {
                id,
                writer,
                _task: task.into(),
            },
        })
        .await;
    }
}

/// Handle to the endpoint actor. Dropping every handle stops it.
pub struct Endpoint<M> {
    commands: Sender<Command<M>>,
    counters: Arc<Counters>,
    shutdown_manager: ShutdownManager<()>,
}

impl<M> Clone for Endpoint<M> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            counters: self.counters.clone(),
            shutdown_manager: self.shutdown_manager.clone(),
        }
    }
}

impl<M: WireMessage> Endpoint<M> {
    pub fn start(
        config: EndpointConfig,
        events: Sender<EndpointEvent<M>>,
        shutdown_manager: ShutdownManager<()>,
    ) -> Self {
        let (commands, receiver) = channel(config.channel_capacity);
        let counters = Arc::new(Counters::default());
        let shared = Arc::new(Shared {
            config,
            counters: counters.clone(),
            events,
            commands: commands.downgrade(),
            next_id: AtomicU64::new(1),
        });
        let actor = EndpointActor {
            shared: shared.clone(),
            udp: PortTable::default(),
            tcp: PortTable::default(),
            udt: PortTable::default(),
            connections: HashMap::new(),
        };
        let mut join_set = JoinSet::new();
        join_set.spawn(actor.run(receiver));
        join_set.spawn(sample_bandwidth(shared));
        let fut = shutdown_manager
            .wrap_cancel(async move { while join_set.join_next().await.is_some() {} });
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("recv shutdown signal: endpoint tasks are shutdown");
            }
        });
        Self {
            commands,
            counters,
            shutdown_manager,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command<M>) -> Result<T> {
        if self.shutdown_manager.is_shutdown_triggered() {
            return Err(Error::Shutdown);
        }
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::Shutdown)?;
        receiver.await.map_err(|_| Error::Shutdown)
    }

    /// Binds `port` (0 lets the OS choose) and returns the port actually bound.
    pub async fn bind(&self, ip: IpAddr, port: u16, transport: Transport) -> Result<(BindStatus, u16)> {
        self.request(|reply| Command::Bind {
            ip,
            port,
            transport,
            reply,
        })
        .await
    }

    /// Binds up to `count` random ports from [`EPHEMERAL_PORTS`].
    pub async fn alloc_ephemeral(
        &self,
        ip: IpAddr,
        count: usize,
        transport: Transport,
    ) -> Result<BTreeSet<u16>> {
        self.request(|reply| Command::Alloc {
            ip,
            count,
            transport,
            reply,
        })
        .await
    }

    /// Returns the subset of `ports` that was bound and is now closed.
    pub async fn release(&self, ports: BTreeSet<u16>, transport: Transport) -> Result<BTreeSet<u16>> {
        self.request(|reply| Command::Release {
            ports,
            transport,
            reply,
        })
        .await
    }

    pub async fn send(&self, msg: M) -> Result<()> {
        self.request(|reply| Command::Send { msg, reply }).await?
    }

    pub async fn ports(&self, transport: Transport) -> Result<BTreeSet<u16>> {
        self.request(|reply| Command::Ports { transport, reply }).await
    }

    pub fn total_read_bytes(&self) -> u64 {
        self.counters.total_read()
    }

    pub fn total_written_bytes(&self) -> u64 {
        self.counters.total_written()
    }
}

pub(crate) struct UdpChannel {
    pub(crate) socket: Arc<UdpSocket>,
    _task: AbortOnDrop,
}

struct EndpointActor<M> {
    shared: Arc<Shared<M>>,
    udp: PortTable<UdpChannel>,
    tcp: PortTable<AbortOnDrop>,
    udt: PortTable<UdpChannel>,
    connections: HashMap<(Transport, SocketAddr), Connection<M>>,
}

impl<M: WireMessage> EndpointActor<M> {
    async fn run(mut self, mut commands: Receiver<Command<M>>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        log::debug!("endpoint actor stopped");
    }

    async fn handle(&mut self, command: Command<M>) {
        match command {
            Command::Bind {
                ip,
                port,
                transport,
                reply,
            } => {
                let rs = self.bind(ip, port, transport);
                _ = reply.send(rs);
            }
            Command::Alloc {
                ip,
                count,
                transport,
                reply,
            } => {
                let ports = self.alloc(ip, count, transport);
                _ = reply.send(ports);
            }
            Command::Release {
                ports,
                transport,
                reply,
            } => {
                let released = self.release(ports, transport);
                _ = reply.send(released);
            }
            Command::Send { msg, reply } => {
                let rs = self.send(msg).await;
                _ = reply.send(rs);
            }
            Command::Ports { transport, reply } => {
                let ports = match transport {
                    Transport::Udp => self.udp.ports(),
                    Transport::Tcp => self.tcp.ports(),
                    Transport::Udt => self.udt.ports(),
                };
                _ = reply.send(ports);
            }
            Command::Attached {
                transport,
                remote,
                connection,
            } => {
                log::debug!("{transport:?} channel to {remote} attached");
                self.connections.insert((transport, remote), connection);
            }
            Command::ChannelInactive {
                transport,
                remote,
                id,
            } => {
                let key = (transport, remote);
                if self.connections.get(&key).map(|c| c.id) == Some(id) {
                    self.connections.remove(&key);
                    log::debug!("{transport:?} channel to {remote} closed");
                    self.shared
                        .emit_detached(EndpointEvent::SessionClosed { remote, transport });
                }
            }
            Command::SocketLost {
                transport,
                port,
                error,
            } => {
                log::error!("{transport:?} socket on port {port} lost: {error}");
                self.release(BTreeSet::from([port]), transport);
                self.shared.emit_detached(EndpointEvent::Fault {
                    transport,
                    port,
                    error: Arc::new(error),
                    fatal: true,
                });
            }
        }
    }

    fn bind(&mut self, ip: IpAddr, port: u16, transport: Transport) -> (BindStatus, u16) {
        match self.try_bind(ip, port, transport) {
            Ok(rs) => rs,
            Err((status, error)) => {
                log::warn!("bind {transport:?} {ip}:{port}: {error}");
                self.shared.emit_detached(EndpointEvent::Fault {
                    transport,
                    port,
                    error: Arc::new(error),
                    fatal: false,
                });
                (status, port)
            }
        }
    }

    fn try_bind(
        &mut self,
        ip: IpAddr,
        port: u16,
        transport: Transport,
    ) -> std::result::Result<(BindStatus, u16), (BindStatus, Error)> {
        if port != 0 {
            let (own, other) = match transport {
                Transport::Udp => (self.udp.contains_port(port), self.udt.contains_port(port)),
                Transport::Udt => (self.udt.contains_port(port), self.udp.contains_port(port)),
                Transport::Tcp => (self.tcp.contains_port(port), false),
            };
            if own {
                return Ok((BindStatus::Success, port));
            }
            if other {
                let owner = if transport == Transport::Udp {
                    Transport::Udt
                } else {
                    Transport::Udp
                };
                return Err((BindStatus::Fail, Error::PortConflict { port, owner }));
            }
        }
        let addr = SocketAddr::new(ip, port);
        let rs = match transport {
            Transport::Udp | Transport::Udt => self.bind_datagram(addr, transport),
            Transport::Tcp => self.bind_stream(addr),
        };
        rs.map(|port| (BindStatus::Success, port)).map_err(|e| {
            let status = if socket::io_error_kind(&e) == Some(io::ErrorKind::AddrInUse) {
                BindStatus::AlreadyBound
            } else {
                BindStatus::Fail
            };
            (
                status,
                Error::BindFailed {
                    addr,
                    reason: format!("{e:#}"),
                },
            )
        })
    }

    fn bind_datagram(&mut self, addr: SocketAddr, transport: Transport) -> anyhow::Result<u16> {
        let socket = Arc::new(socket::bind_udp(addr)?);
        let local = socket.local_addr()?;
        let task = if transport == Transport::Udp {
            tokio::spawn(udp::recv_loop(socket.clone(), local, self.shared.clone()))
        } else {
            tokio::spawn(udt::demux_loop(socket.clone(), local, self.shared.clone()))
        };
        let channel = UdpChannel {
            socket,
            _task: task.into(),
        };
        let table = if transport == Transport::Udp {
            &mut self.udp
        } else {
            &mut self.udt
        };
        if table.insert(local, channel).is_err() {
            anyhow::bail!("port {} is already in the {transport:?} table", local.port());
        }
        log::debug!("{transport:?} bound on {local}");
        Ok(local.port())
    }

    fn bind_stream(&mut self, addr: SocketAddr) -> anyhow::Result<u16> {
        let listener = socket::create_tcp_listener(addr)?;
        let local = listener.local_addr()?;
        let task = tokio::spawn(tcp::accept_loop(listener, local, self.shared.clone()));
        if self.tcp.insert(local, task.into()).is_err() {
            anyhow::bail!("port {} is already in the Tcp table", local.port());
        }
        log::debug!("Tcp listening on {local}");
        Ok(local.port())
    }

    fn alloc(&mut self, ip: IpAddr, count: usize, transport: Transport) -> BTreeSet<u16> {
        let mut bound = BTreeSet::new();
        let mut attempts = 0;
        while bound.len() < count && attempts < count * 8 {
            attempts += 1;
            let port = rand::thread_rng().gen_range(EPHEMERAL_PORTS);
            if self.udp.contains_port(port)
                || self.udt.contains_port(port)
                || self.tcp.contains_port(port)
            {
                continue;
            }
            match self.try_bind(ip, port, transport) {
                Ok((_, port)) => {
                    bound.insert(port);
                }
                Err((_, e)) => log::debug!("ephemeral port {port}: {e}"),
            }
        }
        if bound.len() < count {
            log::warn!("allocated {} of {count} {transport:?} ports", bound.len());
        }
        bound
    }

    fn release(&mut self, ports: BTreeSet<u16>, transport: Transport) -> BTreeSet<u16> {
        ports
            .into_iter()
            .filter(|port| match transport {
                Transport::Udp => self.udp.remove(*port).is_some(),
                Transport::Udt => self.udt.remove(*port).is_some(),
                Transport::Tcp => self.tcp.remove(*port).is_some(),
            })
            .collect()
    }

    async fn send(&mut self, msg: M) -> Result<()> {
        let src = msg.source();
        let dst = msg.destination();
        let transport = msg.transport();
        if src == dst {
            self.shared.emit_detached(EndpointEvent::Message {
                msg,
                remote: src,
                local: dst,
                transport,
            });
            return Ok(());
        }
        match transport {
            Transport::Udp => self.send_datagram(msg, src, dst).await,
            Transport::Tcp | Transport::Udt => self.send_stream(msg, src, dst, transport),
        }
    }

    async fn send_datagram(&mut self, msg: M, src: SocketAddr, dst: SocketAddr) -> Result<()> {
        let Some(channel) = self.udp.get(src.port()) else {
            return Err(Error::NotBound {
                port: src.port(),
                transport: Transport::Udp,
            });
        };
        let mut buf = BytesMut::with_capacity(self.shared.config.recv_buffer_size);
        self.shared.encode(&msg, &mut buf)?;
        match channel.socket.send_to(&buf, dst).await {
            Ok(len) => {
                self.shared.counters.add_written(len);
                Ok(())
            }
            Err(e) => {
                log::warn!("udp send {src} -> {dst}: {e:?}");
                let error = Error::Io(io::Error::new(e.kind(), e.to_string()));
                self.shared.emit_detached(EndpointEvent::Fault {
                    transport: Transport::Udp,
                    port: src.port(),
                    error: Arc::new(error),
                    fatal: false,
                });
                Err(e.into())
            }
        }
    }

    fn send_stream(
        &mut self,
        msg: M,
        src: SocketAddr,
        dst: SocketAddr,
        transport: Transport,
    ) -> Result<()> {
        let key = (transport, dst);
        let msg = match self.connections.get(&key) {
            Some(connection) => match connection.writer.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => {
                    return Err(Error::Io(io::Error::from(io::ErrorKind::WouldBlock)))
                }
                Err(TrySendError::Closed(msg)) => {
                    self.connections.remove(&key);
                    msg
                }
            },
            None => msg,
        };
        let (writer, receiver) = channel(self.shared.config.channel_capacity);
        _ = writer.try_send(msg);
        let id = self.shared.next_connection_id();
        let shared = self.shared.clone();
        let task = match transport {
            Transport::Tcp => tokio::spawn(tcp::connect_and_run(dst, receiver, shared, id)),
            _ => tokio::spawn(udt::connect_and_run(src.ip(), dst, receiver, shared, id)),
        };
        self.connections.insert(
            key,
            Connection {
                id,
                writer,
                _task: task.into(),
            },
        );
        Ok(())
    }
}

async fn sample_bandwidth<M: WireMessage>(shared: Arc<Shared<M>>) {
    let mut sampler = BandwidthSampler::default();
    let mut interval = tokio::time::interval(shared.config.bandwidth_interval());
    interval.tick().await;
    loop {
        interval.tick().await;
        let stats = sampler.tick(
            shared.counters.total_read(),
            shared.counters.total_written(),
        );
        if !shared.emit(EndpointEvent::Bandwidth(stats)).await {
            break;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::{Buf, BufMut};
    use std::net::Ipv4Addr;

    /// Minimal message: src, dst, then the payload.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct TestMsg {
        pub src: SocketAddr,
        pub dst: SocketAddr,
        pub transport: Transport,
        pub payload: Vec<u8>,
    }

    fn put_addr(buf: &mut BytesMut, addr: SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => buf.put_u32(ip.into()),
            IpAddr::V6(_) => buf.put_u32(0),
        }
        buf.put_u16(addr.port());
    }

    fn get_addr(buf: &mut &[u8]) -> SocketAddr {
        let ip = Ipv4Addr::from(buf.get_u32());
        SocketAddr::from((ip, buf.get_u16()))
    }

    impl WireMessage for TestMsg {
        type Error = String;

        fn source(&self) -> SocketAddr {
            self.src
        }
        fn destination(&self) -> SocketAddr {
            self.dst
        }
        fn transport(&self) -> Transport {
            self.transport
        }
        fn rewrite_source(&mut self, local: SocketAddr) {
            self.src = local;
        }
        fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), String> {
            put_addr(buf, self.src);
            put_addr(buf, self.dst);
            buf.extend_from_slice(&self.payload);
            Ok(())
        }
        fn decode(frame: &[u8], transport: Transport) -> std::result::Result<Self, String> {
            if frame.len() < 12 {
                return Err(format!("short frame {}", frame.len()));
            }
            let mut buf = frame;
            let src = get_addr(&mut buf);
            let dst = get_addr(&mut buf);
            Ok(TestMsg {
                src,
                dst,
                transport,
                payload: buf.to_vec(),
            })
        }
    }

    pub(crate) const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    pub(crate) fn start() -> (Endpoint<TestMsg>, Receiver<EndpointEvent<TestMsg>>) {
        let (tx, rx) = channel(256);
        let endpoint = Endpoint::start(EndpointConfig::default(), tx, ShutdownManager::new());
        (endpoint, rx)
    }

    pub(crate) async fn next_message(
        rx: &mut Receiver<EndpointEvent<TestMsg>>,
    ) -> (TestMsg, SocketAddr, SocketAddr) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("event channel closed");
            if let EndpointEvent::Message {
                msg, remote, local, ..
            } = event
            {
                return (msg, remote, local);
            }
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(LOCALHOST, port)
    }

    #[tokio::test]
    async fn udt_on_udp_port_fails() {
        let (endpoint, _rx) = start();
        let (status, port) = endpoint.bind(LOCALHOST, 50001, Transport::Udp).await.unwrap();
        assert_eq!((status, port), (BindStatus::Success, 50001));
        let (status, _) = endpoint.bind(LOCALHOST, 50001, Transport::Udt).await.unwrap();
        assert_eq!(status, BindStatus::Fail);
        let (status, _) = endpoint.bind(LOCALHOST, 50001, Transport::Udp).await.unwrap();
        assert_eq!(status, BindStatus::Success);
        assert_eq!(
            endpoint.ports(Transport::Udp).await.unwrap(),
            BTreeSet::from([50001])
        );
        assert!(endpoint.ports(Transport::Udt).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_socket_is_already_bound() {
        let foreign = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = foreign.local_addr().unwrap().port();
        let (endpoint, _rx) = start();
        let (status, _) = endpoint.bind(LOCALHOST, port, Transport::Udp).await.unwrap();
        assert_eq!(status, BindStatus::AlreadyBound);
    }

    #[tokio::test]
    async fn release_only_touches_requested_transport() {
        let (endpoint, _rx) = start();
        let (_, udp) = endpoint.bind(LOCALHOST, 0, Transport::Udp).await.unwrap();
        let (_, tcp) = endpoint.bind(LOCALHOST, 0, Transport::Tcp).await.unwrap();
        let released = endpoint
            .release(BTreeSet::from([udp, tcp]), Transport::Tcp)
            .await
            .unwrap();
        assert_eq!(released, BTreeSet::from([tcp]));
        assert_eq!(
            endpoint.ports(Transport::Udp).await.unwrap(),
            BTreeSet::from([udp])
        );
        assert!(endpoint.ports(Transport::Tcp).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn alloc_ephemeral_in_range() {
        let (endpoint, _rx) = start();
        let ports = endpoint
            .alloc_ephemeral(LOCALHOST, 3, Transport::Udp)
            .await
            .unwrap();
        assert!(!ports.is_empty() && ports.len() <= 3);
        assert!(ports.iter().all(|p| EPHEMERAL_PORTS.contains(p)));
        let released = endpoint.release(ports.clone(), Transport::Udp).await.unwrap();
        assert_eq!(released, ports);
    }

    #[tokio::test]
    async fn udp_send_requires_bound_source() {
        let (endpoint, _rx) = start();
        let msg = TestMsg {
            src: addr(50011),
            dst: addr(50012),
            transport: Transport::Udp,
            payload: vec![1],
        };
        let err = endpoint.send(msg).await.unwrap_err();
        assert!(matches!(err, Error::NotBound { port: 50011, .. }));
    }

    #[tokio::test]
    async fn loopback_skips_the_wire() {
        let (endpoint, mut rx) = start();
        let msg = TestMsg {
            src: addr(40000),
            dst: addr(40000),
            transport: Transport::Udp,
            payload: b"self".to_vec(),
        };
        endpoint.send(msg.clone()).await.unwrap();
        let (received, _, _) = next_message(&mut rx).await;
        assert_eq!(received, msg);
        assert_eq!(endpoint.total_written_bytes(), 0);
    }

    #[tokio::test]
    async fn udp_preserves_source() {
        let (a, _rx_a) = start();
        let (b, mut rx_b) = start();
        let (_, pa) = a.bind(LOCALHOST, 0, Transport::Udp).await.unwrap();
        let (_, pb) = b.bind(LOCALHOST, 0, Transport::Udp).await.unwrap();
        let msg = TestMsg {
            // claims a different source than the socket it leaves from
            src: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), pa),
            dst: addr(pb),
            transport: Transport::Udp,
            payload: b"hello".to_vec(),
        };
        a.send(msg.clone()).await.unwrap();
        let (received, remote, local) = next_message(&mut rx_b).await;
        assert_eq!(received, msg);
        assert_eq!(remote, addr(pa));
        assert_eq!(local, addr(pb));
        assert_eq!(b.total_read_bytes(), 17);
    }

    #[tokio::test]
    async fn tcp_rewrites_source_and_replies_on_channel() {
        let (a, mut rx_a) = start();
        let (b, mut rx_b) = start();
        let (_, pb) = b.bind(LOCALHOST, 0, Transport::Tcp).await.unwrap();
        let msg = TestMsg {
            src: addr(1),
            dst: addr(pb),
            transport: Transport::Tcp,
            payload: b"over tcp".to_vec(),
        };
        a.send(msg).await.unwrap();
        let (received, remote, _) = next_message(&mut rx_b).await;
        assert_eq!(received.src, remote);
        assert_eq!(received.payload, b"over tcp");

        let reply = TestMsg {
            src: addr(pb),
            dst: remote,
            transport: Transport::Tcp,
            payload: b"back".to_vec(),
        };
        b.send(reply).await.unwrap();
        let (received, _, _) = next_message(&mut rx_a).await;
        assert_eq!(received.payload, b"back");
        assert_eq!(received.dst, remote);
    }

    #[tokio::test]
    async fn tcp_connect_failure_closes_session() {
        let (a, mut rx_a) = start();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dst = listener.local_addr().unwrap();
        drop(listener);
        let msg = TestMsg {
            src: addr(1),
            dst,
            transport: Transport::Tcp,
            payload: vec![],
        };
        a.send(msg).await.unwrap();
        let mut saw_fault = false;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx_a.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                EndpointEvent::Fault { fatal, .. } => {
                    assert!(!fatal);
                    saw_fault = true;
                }
                EndpointEvent::SessionClosed { remote, transport } => {
                    assert_eq!(remote, dst);
                    assert_eq!(transport, Transport::Tcp);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_fault);
    }

    #[tokio::test]
    async fn udt_delivers_in_both_directions() {
        let (a, mut rx_a) = start();
        let (b, mut rx_b) = start();
        let (_, pb) = b.bind(LOCALHOST, 0, Transport::Udt).await.unwrap();
        for i in 0..5u8 {
            let msg = TestMsg {
                src: addr(2),
                dst: addr(pb),
                transport: Transport::Udt,
                payload: vec![i; 100],
            };
            a.send(msg).await.unwrap();
        }
        let mut remote = None;
        for i in 0..5u8 {
            let (received, from, _) = next_message(&mut rx_b).await;
            assert_eq!(received.payload, vec![i; 100]);
            assert_eq!(received.src.port(), from.port());
            remote = Some(from);
        }
        let remote = remote.unwrap();
        let reply = TestMsg {
            src: addr(pb),
            dst: remote,
            transport: Transport::Udt,
            payload: b"ack".to_vec(),
        };
        b.send(reply).await.unwrap();
        let (received, _, _) = next_message(&mut rx_a).await;
        assert_eq!(received.payload, b"ack");
    }

    #[tokio::test]
    async fn oversized_udt_message_does_not_stall_session() {
        let (a, _rx_a) = start();
        let (tx, mut rx_b) = channel(256);
        let config = EndpointConfig::default().set_max_frame_len(1024);
        let b: Endpoint<TestMsg> = Endpoint::start(config, tx, ShutdownManager::new());
        let (_, pb) = b.bind(LOCALHOST, 0, Transport::Udt).await.unwrap();
        for payload in [vec![1u8; 4000], vec![2u8; 100]] {
            let msg = TestMsg {
                src: addr(2),
                dst: addr(pb),
                transport: Transport::Udt,
                payload,
            };
            a.send(msg).await.unwrap();
        }
        let (received, _, _) = next_message(&mut rx_b).await;
        assert_eq!(received.payload, vec![2u8; 100]);
    }

    #[tokio::test]
    async fn bandwidth_published_every_interval() {
        let (tx, mut rx) = channel(16);
        let config = EndpointConfig::default().set_bandwidth_interval(Duration::from_millis(20));
        let _endpoint: Endpoint<TestMsg> = Endpoint::start(config, tx, ShutdownManager::new());
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, EndpointEvent::Bandwidth(_)));
    }
}
