//! Reliable datagram channels: one KCP session per remote address.
//!
//! A bound UDT port demultiplexes its datagrams into sessions keyed by the
//! sender. Outbound channels get their own socket on an OS-chosen port, the
//! same way a stream connect gets a fresh local port. Each KCP message
//! carries exactly one encoded frame.

use bytes::{Bytes, BytesMut};
use kcp::Kcp;
use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::udp::is_transient;
use super::{Command, Counters, EndpointEvent, Shared, Transport, WireMessage};
use crate::error::{Error, Result};
use crate::socket;

const KCP_UPDATE_INTERVAL: Duration = Duration::from_millis(10);
const KCP_OVERHEAD: usize = 24;
const DATAGRAM_BUF: usize = 2048;

struct KcpOutput {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    counters: Arc<Counters>,
}

impl Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.socket.try_send_to(buf, self.remote) {
            Ok(len) => self.counters.add_written(len),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => Err(e)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) async fn demux_loop<M: WireMessage>(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    shared: Arc<Shared<M>>,
) {
    let mut sessions: HashMap<SocketAddr, Sender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(rs) => rs,
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                shared
                    .command(Command::SocketLost {
                        transport: Transport::Udt,
                        port: local.port(),
                        error: e.into(),
                    })
                    .await;
                return;
            }
        };
        shared.counters.add_read(len);
        if len < KCP_OVERHEAD {
            log::debug!("drop short udt datagram from {remote}");
            continue;
        }
        let mut data = Bytes::copy_from_slice(&buf[..len]);
        if let Some(input) = sessions.get(&remote) {
            // a full session loses the datagram, KCP retransmits it
            match input.try_send(data) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => {
                    log::debug!("udt session {remote} is behind, drop datagram");
                    continue;
                }
                Err(TrySendError::Closed(returned)) => data = returned,
            }
            sessions.remove(&remote);
        }
        let conv = kcp::get_conv(&data);
        let (input, input_receiver) = channel(shared.config.channel_capacity);
        _ = input.try_send(data);
        sessions.insert(remote, input);

        let (writer, receiver) = channel(shared.config.channel_capacity);
        let id = shared.next_connection_id();
        let (ready, gate) = oneshot::channel();
        let task = tokio::spawn(run_accepted(
            conv,
            socket.clone(),
            local,
            remote,
            input_receiver,
            receiver,
            shared.clone(),
            id,
            gate,
        ));
        shared
            .attach(Transport::Udt, remote, id, writer, task)
            .await;
        _ = ready.send(());
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_accepted<M: WireMessage>(
    conv: u32,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    remote: SocketAddr,
    input: Receiver<Bytes>,
    receiver: Receiver<M>,
    shared: Arc<Shared<M>>,
    id: u64,
    gate: oneshot::Receiver<()>,
) {
    _ = gate.await;
    if let Err(e) = run_session(conv, socket, local, remote, input, receiver, &shared).await {
        log::debug!("udt session {remote}: {e}");
    }
    closed(&shared, remote, id).await;
}

pub(crate) async fn connect_and_run<M: WireMessage>(
    ip: IpAddr,
    remote: SocketAddr,
    receiver: Receiver<M>,
    shared: Arc<Shared<M>>,
    id: u64,
) {
    if let Err(e) = connect(ip, remote, receiver, &shared).await {
        log::warn!("udt channel {remote}: {e}");
        shared
            .emit(EndpointEvent::Fault {
                transport: Transport::Udt,
                port: 0,
                error: Arc::new(e),
                fatal: false,
            })
            .await;
    }
    closed(&shared, remote, id).await;
}

async fn connect<M: WireMessage>(
    ip: IpAddr,
    remote: SocketAddr,
    receiver: Receiver<M>,
    shared: &Arc<Shared<M>>,
) -> Result<()> {
    let socket = socket::bind_udp(SocketAddr::new(ip, 0)).map_err(|e| Error::BindFailed {
        addr: SocketAddr::new(ip, 0),
        reason: format!("{e:#}"),
    })?;
    let socket = Arc::new(socket);
    let local = socket.local_addr()?;
    let (input, input_receiver) = channel(shared.config.channel_capacity);
    let pump = async {
        let mut buf = vec![0u8; DATAGRAM_BUF];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(rs) => rs,
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            if from != remote || len < KCP_OVERHEAD {
                continue;
            }
            shared.counters.add_read(len);
            if input.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                return Ok(());
            }
        }
    };
    let conv = rand::random();
    let session = run_session(
        conv,
        socket.clone(),
        local,
        remote,
        input_receiver,
        receiver,
        shared,
    );
    tokio::select! {
        rs = pump => rs,
        rs = session => rs,
    }
}

async fn closed<M: WireMessage>(shared: &Arc<Shared<M>>, remote: SocketAddr, id: u64) {
    shared
        .command(Command::ChannelInactive {
            transport: Transport::Udt,
            remote,
            id,
        })
        .await;
}

async fn run_session<M: WireMessage>(
    conv: u32,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    remote: SocketAddr,
    mut input: Receiver<Bytes>,
    mut receiver: Receiver<M>,
    shared: &Arc<Shared<M>>,
) -> Result<()> {
    let mut kcp = Kcp::new(
        conv,
        KcpOutput {
            socket,
            remote,
            counters: shared.counters.clone(),
        },
    );
    kcp.set_wndsize(128, 128);
    kcp.set_nodelay(true, 10, 2, true);

    let idle_timeout = shared.config.udt_idle_timeout();
    let start = Instant::now();
    let mut last_input = start;
    let mut interval = tokio::time::interval(KCP_UPDATE_INTERVAL);
    let mut frame = BytesMut::new();
    let max_frame_len = shared.config.max_frame_len;
    let mut buf = vec![0u8; max_frame_len];
    loop {
        tokio::select! {
            data = input.recv() => {
                let Some(data) = data else {
                    return Ok(());
                };
                kcp.input(&data).map_err(io::Error::other)?;
                last_input = Instant::now();
            }
            msg = receiver.recv(), if kcp.wait_snd() < kcp.snd_wnd() as usize => {
                let Some(mut msg) = msg else {
                    return Ok(());
                };
                msg.rewrite_source(local);
                frame.clear();
                match shared.encode(&msg, &mut frame) {
                    Ok(()) => {
                        kcp.send(&frame).map_err(io::Error::other)?;
                    }
                    Err(e) => log::warn!("drop udt message to {remote}: {e}"),
                }
            }
            _ = interval.tick() => {
                kcp.update(start.elapsed().as_millis() as u32)
                    .map_err(io::Error::other)?;
                if last_input.elapsed() > idle_timeout {
                    log::debug!("udt session {remote} idle");
                    return Ok(());
                }
            }
        }
        while let Ok(size) = kcp.peeksize() {
            if size > buf.len() {
                buf.resize(size, 0);
            }
            let len = match kcp.recv(&mut buf) {
                Ok(len) => len,
                Err(e) => {
                    log::warn!("udt session {remote}: {e}");
                    break;
                }
            };
            if len > max_frame_len {
                log::warn!("drop udt message of {len} bytes from {remote}, limit {max_frame_len}");
                buf.truncate(max_frame_len);
                continue;
            }
            if !shared.deliver(&buf[..len], remote, local, Transport::Udt).await {
                return Ok(());
            }
        }
    }
}
