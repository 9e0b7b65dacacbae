use bytes::BufMut;
use natpunch_core::nat::NatDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use super::Reader;
use crate::error::{Error, Result};

/// Contact point of one node: where it listens and who it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub node_id: u32,
}

impl Address {
    pub const LEN: usize = 10;

    pub fn new(ip: Ipv4Addr, port: u16, node_id: u32) -> Self {
        Self { ip, port, node_id }
    }

    /// IPv6 sources are mapped to the unspecified address.
    pub fn from_socket(addr: SocketAddr, node_id: u32) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        Self::new(ip, addr.port(), node_id)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.node_id);
        buf.put_u32(self.ip.into());
        buf.put_u16(self.port);
    }

    pub(crate) fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let node_id = reader.u32()?;
        let ip = Ipv4Addr::from(reader.u32()?);
        let port = reader.u16()?;
        Ok(Self { ip, port, node_id })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.ip, self.port)
    }
}

/// Advertised contact information of a peer in one overlay.
///
/// A natted peer is reachable only through its `parents`, the rendezvous
/// servers it is registered with. An open peer has none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VodAddress {
    pub addr: Address,
    pub overlay_id: u32,
    pub nat: NatDescriptor,
    pub parents: Vec<Address>,
}

impl VodAddress {
    pub fn new(addr: Address, overlay_id: u32, nat: NatDescriptor) -> Self {
        Self {
            addr,
            overlay_id,
            nat,
            parents: Vec::new(),
        }
    }

    /// Keeps the first occurrence of every parent.
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = Address>) -> Self {
        self.parents.clear();
        for parent in parents {
            if !self.parents.contains(&parent) {
                self.parents.push(parent);
            }
        }
        self
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.nat.is_open()
    }

    #[inline]
    pub fn node_id(&self) -> u32 {
        self.addr.node_id
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.addr
    }

    /// Handshakes and cached paths are keyed per node and overlay.
    #[inline]
    pub fn key(&self) -> (u32, u32) {
        (self.addr.node_id, self.overlay_id)
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let count = u8::try_from(self.parents.len())
            .map_err(|_| Error::encode(format!("{} parents exceed 255", self.parents.len())))?;
        self.addr.encode(buf);
        buf.put_u32(self.overlay_id);
        self.nat.encode(buf);
        buf.put_u8(count);
        for parent in &self.parents {
            parent.encode(buf);
        }
        Ok(())
    }

    pub(crate) fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let addr = Address::decode(reader)?;
        let overlay_id = reader.u32()?;
        let nat = reader.nat()?;
        let parents = decode_parents(reader)?;
        Ok(Self {
            addr,
            overlay_id,
            nat,
            parents,
        })
    }
}

pub(crate) fn decode_parents(reader: &mut Reader<'_>) -> Result<Vec<Address>> {
    let count = reader.u8()? as usize;
    let mut parents = Vec::with_capacity(count);
    for _ in 0..count {
        parents.push(Address::decode(reader)?);
    }
    Ok(parents)
}

impl fmt::Display for VodAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.addr, self.overlay_id, self.nat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use natpunch_core::nat::{AllocationPolicy, FilteringPolicy, MappingPolicy};

    #[test]
    fn address_is_ten_bytes() {
        let addr = Address::new(Ipv4Addr::new(10, 0, 0, 1), 3000, 7);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        assert_eq!(buf.len(), Address::LEN);
        assert_eq!(&buf[..4], &7u32.to_be_bytes());
        let mut reader = Reader::new(&buf);
        assert_eq!(Address::decode(&mut reader).unwrap(), addr);
        assert_eq!(addr.to_string(), "7@10.0.0.1:3000");
    }

    #[test]
    fn parents_are_deduplicated_in_order() {
        let p1 = Address::new(Ipv4Addr::new(1, 1, 1, 1), 1, 1);
        let p2 = Address::new(Ipv4Addr::new(2, 2, 2, 2), 2, 2);
        let nat = NatDescriptor::natted(
            MappingPolicy::EndpointIndependent,
            AllocationPolicy::PortPreservation,
            FilteringPolicy::AddressDependent,
        );
        let vod = VodAddress::new(Address::new(Ipv4Addr::LOCALHOST, 9, 9), 3, nat)
            .with_parents([p2, p1, p2]);
        assert_eq!(vod.parents, vec![p2, p1]);
        assert_eq!(vod.key(), (9, 3));

        let mut buf = BytesMut::new();
        vod.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 10 + 4 + 12 + 1 + 2 * Address::LEN);
        let mut reader = Reader::new(&buf);
        assert_eq!(VodAddress::decode(&mut reader).unwrap(), vod);
        reader.finish().unwrap();
    }

    #[test]
    fn v6_mapped_source_keeps_v4() {
        let addr: SocketAddr = "[::ffff:192.168.1.2]:80".parse().unwrap();
        let addr = Address::from_socket(addr, 1);
        assert_eq!(addr.ip, Ipv4Addr::new(192, 168, 1, 2));
    }
}
