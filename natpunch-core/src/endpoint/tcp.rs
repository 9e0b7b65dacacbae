use bytes::{BufMut, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{channel, Receiver};
use tokio::sync::oneshot;

use super::{Command, EndpointEvent, Shared, Transport, WireMessage};
use crate::error::{Error, Result};
use crate::socket;

/// `u32` big-endian length followed by the frame.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixedCodec {
    max_frame_len: usize,
}

impl LengthPrefixedCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Reads one frame into `buf`, returning its length.
    pub async fn read_frame<R: AsyncRead + Unpin>(
        &self,
        read: &mut R,
        buf: &mut Vec<u8>,
    ) -> Result<usize> {
        let mut head = [0; 4];
        read.read_exact(&mut head).await?;
        let len = u32::from_be_bytes(head) as usize;
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        buf.resize(len, 0);
        read.read_exact(&mut buf[..len]).await?;
        Ok(len)
    }

    pub async fn write_frame<W: AsyncWrite + Unpin>(&self, write: &mut W, data: &[u8]) -> Result<()> {
        if data.len() > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len: data.len(),
                max: self.max_frame_len,
            });
        }
        let mut frame = BytesMut::with_capacity(4 + data.len());
        frame.put_u32(data.len() as u32);
        frame.extend_from_slice(data);
        write.write_all(&frame).await?;
        Ok(())
    }
}

pub(crate) async fn accept_loop<M: WireMessage>(
    listener: TcpListener,
    local: SocketAddr,
    shared: Arc<Shared<M>>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(rs) => rs,
            Err(e) => {
                log::warn!("accept on {local}: {e:?}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        _ = stream.set_nodelay(true);
        let (writer, receiver) = channel(shared.config.channel_capacity);
        let id = shared.next_connection_id();
        let (ready, gate) = oneshot::channel();
        let task = tokio::spawn(run_accepted(stream, remote, receiver, shared.clone(), id, gate));
        shared
            .attach(Transport::Tcp, remote, id, writer, task)
            .await;
        _ = ready.send(());
    }
}

async fn run_accepted<M: WireMessage>(
    stream: TcpStream,
    remote: SocketAddr,
    receiver: Receiver<M>,
    shared: Arc<Shared<M>>,
    id: u64,
    gate: oneshot::Receiver<()>,
) {
    _ = gate.await;
    if let Err(e) = run_stream(stream, remote, receiver, &shared).await {
        log::debug!("tcp channel {remote}: {e}");
    }
    shared
        .command(Command::ChannelInactive {
            transport: Transport::Tcp,
            remote,
            id,
        })
        .await;
}

/// Lazily opened outbound channel; queued messages wait for the connect.
pub(crate) async fn connect_and_run<M: WireMessage>(
    remote: SocketAddr,
    receiver: Receiver<M>,
    shared: Arc<Shared<M>>,
    id: u64,
) {
    let rs = match socket::connect_tcp(remote, shared.config.connect_timeout()).await {
        Ok(stream) => run_stream(stream, remote, receiver, &shared).await,
        Err(e) => Err(e),
    };
    if let Err(e) = rs {
        log::warn!("tcp channel {remote}: {e}");
        shared
            .emit(EndpointEvent::Fault {
                transport: Transport::Tcp,
                port: 0,
                error: Arc::new(e),
                fatal: false,
            })
            .await;
    }
    shared
        .command(Command::ChannelInactive {
            transport: Transport::Tcp,
            remote,
            id,
        })
        .await;
}

async fn run_stream<M: WireMessage>(
    stream: TcpStream,
    remote: SocketAddr,
    mut receiver: Receiver<M>,
    shared: &Arc<Shared<M>>,
) -> Result<()> {
    let local = stream.local_addr()?;
    let codec = LengthPrefixedCodec::new(shared.config.max_frame_len);
    let (mut read, mut write) = stream.into_split();
    let reader = async {
        let mut buf = Vec::new();
        loop {
            let len = match codec.read_frame(&mut read, &mut buf).await {
                Ok(len) => len,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            shared.counters.add_read(len + 4);
            if !shared.deliver(&buf[..len], remote, local, Transport::Tcp).await {
                return Ok(());
            }
        }
    };
    let writer = async {
        let mut buf = BytesMut::new();
        while let Some(mut msg) = receiver.recv().await {
            msg.rewrite_source(local);
            buf.clear();
            if let Err(e) = shared.encode(&msg, &mut buf) {
                log::warn!("drop tcp message to {remote}: {e}");
                continue;
            }
            codec.write_frame(&mut write, &buf).await?;
            shared.counters.add_written(buf.len() + 4);
        }
        Ok::<(), Error>(())
    };
    tokio::select! {
        rs = reader => rs,
        rs = writer => rs,
    }
}
