use bytes::{BufMut, Bytes, BytesMut};
use natpunch_core::endpoint::{Transport, WireMessage};
use natpunch_core::timer::TimeoutId;
use std::net::{IpAddr, SocketAddr};

use super::address::decode_parents;
use super::opcode::{
    ConnectStatus, EchoKind, KeepAliveStatus, Opcode, RegisterStatus, UnregisterStatus,
};
use super::{put_bool, put_string, Address, Reader, VodAddress, MAGIC};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    StunEchoRequest {
        kind: EchoKind,
        /// Where a relayed echo must be answered; set on `Forwarded`.
        reply_to: Option<Address>,
    },
    StunEchoResponse {
        /// Public address the server saw the request come from.
        observed: Address,
        kind: EchoKind,
        /// The responding server's alternate port, 0 if it has none.
        alt_port: u16,
    },
    StunReportRequest {
        report: String,
    },
    StunReportResponse,

    HpRegisterRequest {
        wait_time: u32,
        overlay_id: u32,
    },
    HpRegisterResponse {
        status: RegisterStatus,
    },
    HpUnregisterRequest {
        delay: i32,
        prev_status: RegisterStatus,
    },
    HpUnregisterResponse {
        status: UnregisterStatus,
    },
    HpKeepAliveRequest,
    HpKeepAliveResponse {
        status: KeepAliveStatus,
    },
    /// Towards a parent `peer` is the target; a forwarded request carries the
    /// initiator instead.
    HpConnectRequest {
        peer: VodAddress,
        forwarded: bool,
    },
    HpConnectResponse {
        status: ConnectStatus,
        target_id: u32,
    },
    HpPing,
    HpPong,
    HpDeleteConnection {
        remote_client_id: u32,
    },
    HpExpire,

    ConnectionPing,
    ConnectionPong,
    Data {
        payload: Bytes,
    },
}

impl Body {
    pub fn opcode(&self) -> Opcode {
        match self {
            Body::StunEchoRequest { .. } => Opcode::StunEchoRequest,
            Body::StunEchoResponse { .. } => Opcode::StunEchoResponse,
            Body::StunReportRequest { .. } => Opcode::StunReportRequest,
            Body::StunReportResponse => Opcode::StunReportResponse,
            Body::HpRegisterRequest { .. } => Opcode::HpRegisterRequest,
            Body::HpRegisterResponse { .. } => Opcode::HpRegisterResponse,
            Body::HpUnregisterRequest { .. } => Opcode::HpUnregisterRequest,
            Body::HpUnregisterResponse { .. } => Opcode::HpUnregisterResponse,
            Body::HpKeepAliveRequest => Opcode::HpKeepAliveRequest,
            Body::HpKeepAliveResponse { .. } => Opcode::HpKeepAliveResponse,
            Body::HpConnectRequest { .. } => Opcode::HpConnectRequest,
            Body::HpConnectResponse { .. } => Opcode::HpConnectResponse,
            Body::HpPing => Opcode::HpPing,
            Body::HpPong => Opcode::HpPong,
            Body::HpDeleteConnection { .. } => Opcode::HpDeleteConnection,
            Body::HpExpire => Opcode::HpExpire,
            Body::ConnectionPing => Opcode::ConnectionPing,
            Body::ConnectionPong => Opcode::ConnectionPong,
            Body::Data { .. } => Opcode::Data,
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Body::StunEchoRequest { kind, reply_to } => {
                buf.put_u8(*kind as u8);
                put_bool(buf, reply_to.is_some());
                if let Some(addr) = reply_to {
                    addr.encode(buf);
                }
            }
            Body::StunEchoResponse {
                observed,
                kind,
                alt_port,
            } => {
                observed.encode(buf);
                buf.put_u8(*kind as u8);
                buf.put_u16(*alt_port);
            }
            Body::StunReportRequest { report } => put_string(buf, report)?,
            Body::HpRegisterRequest {
                wait_time,
                overlay_id,
            } => {
                buf.put_u32(*wait_time);
                buf.put_u32(*overlay_id);
            }
            Body::HpRegisterResponse { status } => buf.put_u8(*status as u8),
            Body::HpUnregisterRequest { delay, prev_status } => {
                buf.put_i32(*delay);
                buf.put_u8(*prev_status as u8);
            }
            Body::HpUnregisterResponse { status } => buf.put_u8(*status as u8),
            Body::HpKeepAliveResponse { status } => buf.put_u8(*status as u8),
            Body::HpConnectRequest { peer, forwarded } => {
                peer.encode(buf)?;
                put_bool(buf, *forwarded);
            }
            Body::HpConnectResponse { status, target_id } => {
                buf.put_u8(*status as u8);
                buf.put_u32(*target_id);
            }
            Body::HpDeleteConnection { remote_client_id } => buf.put_u32(*remote_client_id),
            Body::Data { payload } => {
                let len = u16::try_from(payload.len()).map_err(|_| {
                    Error::encode(format!("payload of {} bytes exceeds 65535", payload.len()))
                })?;
                buf.put_u16(len);
                buf.put_slice(payload);
            }
            Body::StunReportResponse
            | Body::HpKeepAliveRequest
            | Body::HpPing
            | Body::HpPong
            | Body::HpExpire
            | Body::ConnectionPing
            | Body::ConnectionPong => {}
        }
        Ok(())
    }

    fn decode(opcode: Opcode, reader: &mut Reader<'_>) -> Result<Self> {
        let body = match opcode {
            Opcode::StunEchoRequest => {
                let kind = EchoKind::try_from(reader.u8()?)?;
                let reply_to = if reader.bool()? {
                    Some(Address::decode(reader)?)
                } else {
                    None
                };
                Body::StunEchoRequest { kind, reply_to }
            }
            Opcode::StunEchoResponse => Body::StunEchoResponse {
                observed: Address::decode(reader)?,
                kind: EchoKind::try_from(reader.u8()?)?,
                alt_port: reader.u16()?,
            },
            Opcode::StunReportRequest => Body::StunReportRequest {
                report: reader.string()?,
            },
            Opcode::StunReportResponse => Body::StunReportResponse,
            Opcode::HpRegisterRequest => Body::HpRegisterRequest {
                wait_time: reader.u32()?,
                overlay_id: reader.u32()?,
            },
            Opcode::HpRegisterResponse => Body::HpRegisterResponse {
                status: RegisterStatus::try_from(reader.u8()?)?,
            },
            Opcode::HpUnregisterRequest => Body::HpUnregisterRequest {
                delay: reader.i32()?,
                prev_status: RegisterStatus::try_from(reader.u8()?)?,
            },
            Opcode::HpUnregisterResponse => Body::HpUnregisterResponse {
                status: UnregisterStatus::try_from(reader.u8()?)?,
            },
            Opcode::HpKeepAliveRequest => Body::HpKeepAliveRequest,
            Opcode::HpKeepAliveResponse => Body::HpKeepAliveResponse {
                status: KeepAliveStatus::try_from(reader.u8()?)?,
            },
            Opcode::HpConnectRequest => Body::HpConnectRequest {
                peer: VodAddress::decode(reader)?,
                forwarded: reader.bool()?,
            },
            Opcode::HpConnectResponse => Body::HpConnectResponse {
                status: ConnectStatus::try_from(reader.u8()?)?,
                target_id: reader.u32()?,
            },
            Opcode::HpPing => Body::HpPing,
            Opcode::HpPong => Body::HpPong,
            Opcode::HpDeleteConnection => Body::HpDeleteConnection {
                remote_client_id: reader.u32()?,
            },
            Opcode::HpExpire => Body::HpExpire,
            Opcode::ConnectionPing => Body::ConnectionPing,
            Opcode::ConnectionPong => Body::ConnectionPong,
            Opcode::Data => {
                let len = reader.u16()? as usize;
                Body::Data {
                    payload: Bytes::copy_from_slice(reader.bytes(len)?),
                }
            }
            Opcode::Unknown => return Err(Error::decode("unknown opcode")),
        };
        Ok(body)
    }
}

/// One framed protocol message.
///
/// The header carries the sender's full [`VodAddress`] so every receiver
/// learns the NAT type and parents of whoever talks to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub src: VodAddress,
    pub dst: Address,
    pub timeout_id: TimeoutId,
    /// Not on the wire: which channel the message travels or arrived on.
    pub transport: Transport,
    pub body: Body,
}

impl Message {
    pub fn new(src: VodAddress, dst: Address, body: Body) -> Self {
        Self {
            src,
            dst,
            timeout_id: TimeoutId::NONE,
            transport: Transport::Udp,
            body,
        }
    }

    pub fn with_timeout(mut self, timeout_id: TimeoutId) -> Self {
        self.timeout_id = timeout_id;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    /// A reply to `self` from `src`, echoing the timeout id.
    pub fn reply(&self, src: VodAddress, body: Body) -> Self {
        Message::new(src, self.src.addr, body)
            .with_timeout(self.timeout_id)
            .with_transport(self.transport)
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let count = u8::try_from(self.src.parents.len()).map_err(|_| {
            Error::encode(format!("{} parents exceed 255", self.src.parents.len()))
        })?;
        buf.put_u32(MAGIC);
        buf.put_u8(self.opcode().into());
        self.src.addr.encode(buf);
        self.dst.encode(buf);
        buf.put_u32(self.src.overlay_id);
        buf.put_u64(self.timeout_id.as_u64());
        self.src.nat.encode(buf);
        buf.put_u8(count);
        for parent in &self.src.parents {
            parent.encode(buf);
        }
        self.body.encode(buf)
    }

    pub fn decode(frame: &[u8], transport: Transport) -> Result<Self> {
        let mut reader = Reader::new(frame);
        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(Error::decode(format!("bad magic {magic:#010x}")));
        }
        let raw = reader.u8()?;
        let opcode = Opcode::from(raw);
        if opcode == Opcode::Unknown {
            return Err(Error::decode(format!("unknown opcode {raw:#04x}")));
        }
        let src_addr = Address::decode(&mut reader)?;
        let dst = Address::decode(&mut reader)?;
        let overlay_id = reader.u32()?;
        let timeout_id = TimeoutId::from_raw(reader.u64()?);
        let nat = reader.nat()?;
        let parents = decode_parents(&mut reader)?;
        let body = Body::decode(opcode, &mut reader)?;
        reader.finish()?;
        Ok(Self {
            src: VodAddress {
                addr: src_addr,
                overlay_id,
                nat,
                parents,
            },
            dst,
            timeout_id,
            transport,
            body,
        })
    }
}

impl WireMessage for Message {
    type Error = Error;

    fn source(&self) -> SocketAddr {
        self.src.addr.socket_addr()
    }

    fn destination(&self) -> SocketAddr {
        self.dst.socket_addr()
    }

    fn transport(&self) -> Transport {
        self.transport
    }

    fn rewrite_source(&mut self, local: SocketAddr) {
        if let IpAddr::V4(ip) = local.ip() {
            self.src.addr.ip = ip;
        }
        self.src.addr.port = local.port();
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        Message::encode(self, buf)
    }

    fn decode(frame: &[u8], transport: Transport) -> Result<Self> {
        Message::decode(frame, transport)
    }
}
