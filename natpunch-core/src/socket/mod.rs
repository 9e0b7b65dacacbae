use anyhow::{anyhow, Context};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use socket2::Protocol;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Binds a non-blocking UDP socket. IPv6 sockets are v6-only.
pub fn bind_udp(addr: SocketAddr) -> anyhow::Result<tokio::net::UdpSocket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket
            .set_only_v6(true)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
        socket
    };
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind_udp {}", addr))?;
    Ok(tokio::net::UdpSocket::from_std(socket.into())?)
}

pub fn create_tcp_listener(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    let socket = if addr.is_ipv6() {
        let socket = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?;
        socket
            .set_only_v6(true)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
        socket
    } else {
        socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?
    };
    socket
        .set_reuse_address(true)
        .context("set_reuse_address")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind_tcp {}", addr))?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    Ok(tokio::net::TcpListener::from_std(socket.into())?)
}

pub async fn connect_tcp(
    addr: SocketAddr,
    timeout: Duration,
) -> crate::error::Result<tokio::net::TcpStream> {
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_nodelay(true)?;
    match tokio::time::timeout(timeout, socket.connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(crate::error::Error::ConnectFailed {
            addr,
            reason: e.to_string(),
        }),
        Err(_) => Err(crate::error::Error::ConnectFailed {
            addr,
            reason: format!("timed out after {timeout:?}"),
        }),
    }
}

/// Extracts the io error kind buried under anyhow context, if any.
pub fn io_error_kind(e: &anyhow::Error) -> Option<io::ErrorKind> {
    e.downcast_ref::<io::Error>().map(|e| e.kind())
}

/// All IPv4 addresses of local interfaces, loopback excluded.
pub fn local_ipv4_addrs() -> anyhow::Result<Vec<Ipv4Addr>> {
    let network_interfaces = NetworkInterface::show()?;
    let mut rs = Vec::new();
    for iface in network_interfaces {
        for addr in iface.addr {
            if let IpAddr::V4(ip) = addr.ip() {
                if ip.is_loopback() || ip.is_unspecified() || ip.is_link_local() {
                    continue;
                }
                rs.push(ip);
            }
        }
    }
    Ok(rs)
}

/// Picks a local address: 0 is the first public one, `n > 0` the n-th private one.
pub fn pick_ipv4(choice: u8) -> anyhow::Result<Ipv4Addr> {
    let addrs = local_ipv4_addrs()?;
    if choice == 0 {
        return addrs
            .into_iter()
            .find(|ip| !ip.is_private())
            .ok_or_else(|| anyhow!("no network interface with a public ip found"));
    }
    addrs
        .into_iter()
        .filter(|ip| ip.is_private())
        .nth(choice as usize - 1)
        .ok_or_else(|| anyhow!("no private ip number {} found", choice))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_conflict_surfaces_addr_in_use() {
        let first = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        let err = bind_udp(addr).unwrap_err();
        assert_eq!(io_error_kind(&err), Some(io::ErrorKind::AddrInUse));
    }

    #[tokio::test]
    async fn connect_refused_is_connect_failed() {
        let listener = create_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect_tcp(addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::ConnectFailed { .. }));
    }
}
