use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use super::{Command, Shared, Transport, WireMessage};

/// Errors a datagram socket survives: ICMP feedback and spurious wakeups.
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

pub(crate) async fn recv_loop<M: WireMessage>(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    shared: Arc<Shared<M>>,
) {
    let mut buf = vec![0u8; shared.config.recv_buffer_size];
    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(rs) => rs,
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                shared
                    .command(Command::SocketLost {
                        transport: Transport::Udp,
                        port: local.port(),
                        error: e.into(),
                    })
                    .await;
                return;
            }
        };
        shared.counters.add_read(len);
        if !shared.deliver(&buf[..len], remote, local, Transport::Udp).await {
            return;
        }
    }
}
